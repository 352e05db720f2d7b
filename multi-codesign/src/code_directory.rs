// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.
//!
//! The CodeDirectory records a digest for every page of the binary's code and
//! for the "special" blobs stored alongside it. Its own digest, the cdhash,
//! is what the CMS signature ultimately vouches for.
//!
//! Special slot digests are stored at negative indices before `hashOffset`:
//! slot 1 is at `hashOffset - hashSize`, slot 2 before that, and so on.

use {
    crate::{
        digest::DigestAlgorithm,
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, CodeSigningSlot,
        },
        error::CodesignError,
    },
    scroll::{IOwrite, Pread},
    std::{collections::BTreeMap, io::Write, str::FromStr},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

impl FromStr for CodeSignatureFlags {
    type Err = CodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::HOST),
            "hard" => Ok(Self::FORCE_HARD),
            "kill" => Ok(Self::FORCE_KILL),
            "expires" => Ok(Self::FORCE_EXPIRATION),
            "library" => Ok(Self::LIBRARY_VALIDATION),
            "runtime" => Ok(Self::RUNTIME),
            "linker-signed" => Ok(Self::LINKER_SIGNED),
            _ => Err(CodesignError::CodeSignatureUnknownFlag(s.to_string())),
        }
    }
}

impl CodeSignatureFlags {
    /// Attempt to convert a series of strings into a [CodeSignatureFlags].
    pub fn from_strs(s: &[&str]) -> Result<CodeSignatureFlags, CodesignError> {
        s.iter()
            .try_fold(CodeSignatureFlags::empty(), |acc, s| Ok(acc | Self::from_str(s)?))
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

impl FromStr for ExecutableSegmentFlags {
    type Err = CodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main-binary" => Ok(Self::MAIN_BINARY),
            "allow-unsigned" => Ok(Self::ALLOW_UNSIGNED),
            "debugger" => Ok(Self::DEBUGGER),
            "jit" => Ok(Self::JIT),
            "skip-library-validation" => Ok(Self::SKIP_LIBRARY_VALIDATION),
            "can-load-cd-hash" => Ok(Self::CAN_LOAD_CD_HASH),
            "can-exec-cd-hash" => Ok(Self::CAN_EXEC_CD_HASH),
            _ => Err(CodesignError::ExecutableSegmentUnknownFlag(s.to_string())),
        }
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

impl CodeDirectoryVersion {
    /// Size of the fixed header, blob header included, for this version.
    pub fn header_size(&self) -> usize {
        match self {
            Self::Initial => 44,
            Self::SupportsScatter => 48,
            Self::SupportsTeamId => 52,
            Self::SupportsCodeLimit64 => 64,
            Self::SupportsExecutableSegment => 88,
            Self::SupportsRuntime => 96,
            Self::SupportsLinkage => 108,
        }
    }

    /// Resolve the newest known version not exceeding a raw version number.
    pub fn from_raw(version: u32) -> Result<Self, CodesignError> {
        [
            Self::SupportsLinkage,
            Self::SupportsRuntime,
            Self::SupportsExecutableSegment,
            Self::SupportsCodeLimit64,
            Self::SupportsTeamId,
            Self::SupportsScatter,
            Self::Initial,
        ]
        .into_iter()
        .find(|v| version >= *v as u32)
        .ok_or(CodesignError::CodeDirectoryMalformed("version predates 0x20000"))
    }
}

/// Compute paged digests.
///
/// `data` is split into chunks of `page_size` bytes, the last chunk holding
/// the remainder, and each chunk is digested.
pub fn paged_digests(data: &[u8], hash: DigestAlgorithm, page_size: usize) -> Vec<Vec<u8>> {
    data.chunks(page_size.max(1))
        .map(|chunk| hash.digest_data(chunk))
        .collect()
}

/// The offsets and counts needed to walk a serialized CodeDirectory.
///
/// This is the subset of header fields that cdhash computation relies on,
/// validated against the blob length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CodeDirectoryLayout {
    pub version: u32,
    /// Blob length recorded in the header.
    pub length: usize,
    /// Offset of the first code slot digest.
    pub hash_offset: usize,
    pub ident_offset: usize,
    pub n_special_slots: usize,
    pub n_code_slots: usize,
    /// Effective code limit, preferring the 64-bit field when set.
    pub code_limit: u64,
    pub hash_size: usize,
    /// Raw `hashType` value.
    pub hash_type: u8,
    /// Page size in bytes. `None` means the whole code limit is a single page.
    pub page_size: Option<usize>,
    pub scatter_offset: Option<u32>,
    pub team_offset: Option<u32>,
}

impl CodeDirectoryLayout {
    /// Read the layout from a CodeDirectory blob, header included.
    pub fn from_blob_bytes(data: &[u8]) -> Result<Self, CodesignError> {
        let payload = read_and_validate_blob_header(
            data,
            u32::from(CodeSigningMagic::CodeDirectory),
            "code directory blob",
        )?;
        let length = payload.len() + 8;
        let data = &data[..length];

        let offset = &mut 8;
        let version = data.gread_with::<u32>(offset, scroll::BE)?;
        let known = CodeDirectoryVersion::from_raw(version)?;

        if length < known.header_size() {
            return Err(CodesignError::CodeDirectoryMalformed(
                "blob shorter than its version's header",
            ));
        }

        // Skip flags.
        *offset += 4;
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let code_limit = data.gread_with::<u32>(offset, scroll::BE)?;
        let hash_size = data.gread_with::<u8>(offset, scroll::BE)? as usize;
        let hash_type = data.gread_with::<u8>(offset, scroll::BE)?;
        // Skip platform.
        *offset += 1;
        let page_size_log2 = data.gread_with::<u8>(offset, scroll::BE)?;

        let page_size = match page_size_log2 {
            0 => None,
            v if v < 32 => Some(1usize << v),
            _ => return Err(CodesignError::CodeDirectoryMalformed("page size")),
        };

        let non_zero = |v: u32| if v == 0 { None } else { Some(v) };

        let scatter_offset = if known >= CodeDirectoryVersion::SupportsScatter {
            non_zero(data.pread_with::<u32>(44, scroll::BE)?)
        } else {
            None
        };
        let team_offset = if known >= CodeDirectoryVersion::SupportsTeamId {
            non_zero(data.pread_with::<u32>(48, scroll::BE)?)
        } else {
            None
        };
        let code_limit_64 = if known >= CodeDirectoryVersion::SupportsCodeLimit64 {
            data.pread_with::<u64>(56, scroll::BE)?
        } else {
            0
        };

        let layout = Self {
            version,
            length,
            hash_offset,
            ident_offset,
            n_special_slots,
            n_code_slots,
            code_limit: if code_limit_64 != 0 {
                code_limit_64
            } else {
                code_limit as u64
            },
            hash_size,
            hash_type,
            page_size,
            scatter_offset,
            team_offset,
        };

        let special_start = n_special_slots
            .checked_mul(hash_size)
            .and_then(|v| hash_offset.checked_sub(v))
            .ok_or(CodesignError::CodeDirectoryMalformed("special slots precede blob"))?;
        let hashes_end = n_code_slots
            .checked_mul(hash_size)
            .and_then(|v| v.checked_add(hash_offset))
            .ok_or(CodesignError::CodeDirectoryMalformed("code slot count"))?;

        if special_start < known.header_size() || hashes_end > length {
            return Err(CodesignError::CodeDirectoryMalformed(
                "hash slots outside of blob",
            ));
        }
        if ident_offset < known.header_size() || ident_offset >= length {
            return Err(CodesignError::CodeDirectoryMalformedIdentifier);
        }

        Ok(layout)
    }

    /// Offset of the highest numbered special slot digest.
    pub fn special_slots_offset(&self) -> usize {
        self.hash_offset - self.n_special_slots * self.hash_size
    }

    /// Offset just past the last code slot digest.
    pub fn hashes_end_offset(&self) -> usize {
        self.hash_offset + self.n_code_slots * self.hash_size
    }

    /// Offset of the digest for a special slot, if the table holds that slot.
    pub fn special_slot_offset(&self, slot: CodeSigningSlot) -> Option<usize> {
        let index = u32::from(slot) as usize;

        if slot.is_special() && index <= self.n_special_slots {
            Some(self.hash_offset - index * self.hash_size)
        } else {
            None
        }
    }

    /// Offset of the digest for a code page.
    pub fn code_slot_offset(&self, page: usize) -> Option<usize> {
        if page < self.n_code_slots {
            Some(self.hash_offset + page * self.hash_size)
        } else {
            None
        }
    }

    /// The digest algorithm named by `hashType`.
    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm, CodesignError> {
        let alg = DigestAlgorithm::from_macho_hash_type(self.hash_type)?;

        if alg.digest_len() != self.hash_size {
            return Err(CodesignError::CodeDirectoryMalformed(
                "hash size does not match hash type",
            ));
        }

        Ok(alg)
    }
}

fn read_c_string(data: &[u8], offset: usize) -> Option<Result<String, std::str::Utf8Error>> {
    let data = data.get(offset..)?;
    let end = data.iter().position(|b| *b == 0)?;

    Some(std::str::from_utf8(&data[..end]).map(|s| s.to_string()))
}

/// Represents a code directory blob entry.
///
/// This struct is versioned and has been extended over time. It holds a
/// superset of the fields across versions; fields introduced after
/// [Self::version] are `None` after parsing and are not serialized.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeDirectory {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// File offset at which code digesting stops.
    ///
    /// This is the start of the embedded signature data.
    pub code_limit: u32,
    /// Digest algorithm of every slot.
    pub hash_type: DigestAlgorithm,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes. Must be a power of two.
    pub page_size: u32,
    // Version 0x20100
    pub scatter_offset: Option<u32>,
    // Version 0x20300
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    pub exec_seg_base: Option<u64>,
    pub exec_seg_limit: Option<u64>,
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,
    // Version 0x20600
    pub linkage_hash_type: Option<u8>,
    pub linkage_truncated: Option<u8>,
    pub linkage_offset: Option<u32>,
    pub linkage_size: Option<u32>,

    /// Signing identifier.
    pub identifier: String,
    /// Team identifier. Requires version 0x20200.
    pub team_id: Option<String>,
    /// Digests of special slots. Absent slots below the highest one are
    /// serialized as zero digests.
    pub special_hashes: BTreeMap<CodeSigningSlot, Vec<u8>>,
    /// Digests of successive code pages.
    pub code_hashes: Vec<Vec<u8>>,
}

impl Blob for CodeDirectory {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, CodesignError> {
        let layout = CodeDirectoryLayout::from_blob_bytes(data)?;
        let data = &data[..layout.length];
        let known = CodeDirectoryVersion::from_raw(layout.version)?;
        let hash_type = layout.digest_algorithm()?;

        let flags =
            CodeSignatureFlags::from_bits_truncate(data.pread_with::<u32>(12, scroll::BE)?);
        let code_limit = data.pread_with::<u32>(32, scroll::BE)?;
        let platform = data.pread_with::<u8>(38, scroll::BE)?;

        let at_least = |v: CodeDirectoryVersion| known >= v;

        let code_limit_64 = if at_least(CodeDirectoryVersion::SupportsCodeLimit64) {
            Some(data.pread_with::<u64>(56, scroll::BE)?)
        } else {
            None
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if at_least(CodeDirectoryVersion::SupportsExecutableSegment) {
                (
                    Some(data.pread_with::<u64>(64, scroll::BE)?),
                    Some(data.pread_with::<u64>(72, scroll::BE)?),
                    Some(ExecutableSegmentFlags::from_bits_truncate(
                        data.pread_with::<u64>(80, scroll::BE)?,
                    )),
                )
            } else {
                (None, None, None)
            };

        let (runtime, pre_encrypt_offset) = if at_least(CodeDirectoryVersion::SupportsRuntime) {
            (
                Some(data.pread_with::<u32>(88, scroll::BE)?),
                Some(data.pread_with::<u32>(92, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (linkage_hash_type, linkage_truncated, linkage_offset, linkage_size) =
            if at_least(CodeDirectoryVersion::SupportsLinkage) {
                (
                    Some(data.pread_with::<u8>(96, scroll::BE)?),
                    Some(data.pread_with::<u8>(97, scroll::BE)?),
                    Some(data.pread_with::<u32>(100, scroll::BE)?),
                    Some(data.pread_with::<u32>(104, scroll::BE)?),
                )
            } else {
                (None, None, None, None)
            };

        let identifier = match read_c_string(data, layout.ident_offset) {
            Some(Ok(s)) => s,
            _ => return Err(CodesignError::CodeDirectoryMalformedIdentifier),
        };

        let team_id = match layout.team_offset {
            Some(offset) => match read_c_string(data, offset as usize) {
                Some(Ok(s)) => Some(s),
                _ => return Err(CodesignError::CodeDirectoryMalformedTeam),
            },
            None => None,
        };

        let special_hashes = (1..=layout.n_special_slots)
            .filter_map(|index| {
                let slot = CodeSigningSlot::from(index as u32);
                let start = layout.special_slot_offset(slot)?;
                let digest = &data[start..start + layout.hash_size];

                // Zero digests denote absent slots.
                if digest.iter().all(|b| *b == 0) {
                    None
                } else {
                    Some((slot, digest.to_vec()))
                }
            })
            .collect();

        let code_hashes = data[layout.hash_offset..layout.hashes_end_offset()]
            .chunks(layout.hash_size.max(1))
            .map(|c| c.to_vec())
            .collect();

        Ok(Self {
            version: layout.version,
            flags,
            code_limit,
            hash_type,
            platform,
            page_size: layout.page_size.unwrap_or(0) as u32,
            scatter_offset: layout.scatter_offset,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt_offset,
            linkage_hash_type,
            linkage_truncated,
            linkage_offset,
            linkage_size,
            identifier,
            team_id,
            special_hashes,
            code_hashes,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        let known = CodeDirectoryVersion::from_raw(self.version)?;
        let at_least = |v: CodeDirectoryVersion| known >= v;

        if self.scatter_offset.is_some() {
            return Err(CodesignError::Unsupported("code directory scatter vectors"));
        }
        if self.team_id.is_some() && !at_least(CodeDirectoryVersion::SupportsTeamId) {
            return Err(CodesignError::CodeDirectoryMalformed(
                "team id requires version 0x20200",
            ));
        }
        if !self.page_size.is_power_of_two() && self.page_size != 0 {
            return Err(CodesignError::CodeDirectoryMalformed("page size"));
        }

        let hash_size = self.hash_type.digest_len();
        if self
            .special_hashes
            .values()
            .chain(self.code_hashes.iter())
            .any(|h| h.len() != hash_size)
        {
            return Err(CodesignError::CodeDirectoryMalformed(
                "digest length does not match hash type",
            ));
        }
        if self.special_hashes.keys().any(|slot| !slot.is_special()) {
            return Err(CodesignError::CodeDirectoryMalformed(
                "slot not expressible as a special slot",
            ));
        }

        let n_special_slots = self.n_special_slots();
        let ident_offset = known.header_size();
        let team_offset = ident_offset + self.identifier.len() + 1;
        let hash_offset = team_offset
            + self.team_id.as_ref().map(|t| t.len() + 1).unwrap_or(0)
            + n_special_slots as usize * hash_size;

        let mut cursor = Vec::with_capacity(self.serialized_size() - 8);

        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits(), scroll::BE)?;
        cursor.iowrite_with(hash_offset as u32, scroll::BE)?;
        cursor.iowrite_with(ident_offset as u32, scroll::BE)?;
        cursor.iowrite_with(n_special_slots, scroll::BE)?;
        cursor.iowrite_with(self.code_hashes.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(hash_size as u8, scroll::BE)?;
        cursor.iowrite_with(self.hash_type.macho_hash_type(), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        let page_size_log2 = if self.page_size == 0 {
            0
        } else {
            self.page_size.trailing_zeros() as u8
        };
        cursor.iowrite_with(page_size_log2, scroll::BE)?;
        // spare2
        cursor.iowrite_with(0u32, scroll::BE)?;

        if at_least(CodeDirectoryVersion::SupportsScatter) {
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsTeamId) {
            let offset = if self.team_id.is_some() {
                team_offset as u32
            } else {
                0
            };
            cursor.iowrite_with(offset, scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsCodeLimit64) {
            // spare3
            cursor.iowrite_with(0u32, scroll::BE)?;
            cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsExecutableSegment) {
            cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(
                self.exec_seg_flags
                    .unwrap_or_else(ExecutableSegmentFlags::empty)
                    .bits(),
                scroll::BE,
            )?;
        }
        if at_least(CodeDirectoryVersion::SupportsRuntime) {
            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.pre_encrypt_offset.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsLinkage) {
            cursor.iowrite_with(self.linkage_hash_type.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_truncated.unwrap_or(0), scroll::BE)?;
            // spare4
            cursor.iowrite_with(0u16, scroll::BE)?;
            cursor.iowrite_with(self.linkage_offset.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_size.unwrap_or(0), scroll::BE)?;
        }

        debug_assert_eq!(cursor.len() + 8, ident_offset);
        cursor.write_all(self.identifier.as_bytes())?;
        cursor.write_all(b"\0")?;

        if let Some(team) = &self.team_id {
            cursor.write_all(team.as_bytes())?;
            cursor.write_all(b"\0")?;
        }

        // Highest slot first, ending with slot 1 right before the code digests.
        let zero = vec![0u8; hash_size];
        for index in (1..=n_special_slots).rev() {
            let slot = CodeSigningSlot::from(index);
            cursor.write_all(self.special_hashes.get(&slot).unwrap_or(&zero))?;
        }

        debug_assert_eq!(cursor.len() + 8, hash_offset);
        for hash in &self.code_hashes {
            cursor.write_all(hash)?;
        }

        Ok(cursor)
    }
}

impl CodeDirectory {
    /// Construct an empty CodeDirectory for the given identifier and digest.
    ///
    /// The version supports team ids and the executable segment fields.
    pub fn new(identifier: impl ToString, hash_type: DigestAlgorithm) -> Self {
        Self {
            version: CodeDirectoryVersion::SupportsExecutableSegment as u32,
            flags: CodeSignatureFlags::empty(),
            code_limit: 0,
            hash_type,
            platform: 0,
            page_size: 4096,
            scatter_offset: None,
            code_limit_64: None,
            exec_seg_base: None,
            exec_seg_limit: None,
            exec_seg_flags: None,
            runtime: None,
            pre_encrypt_offset: None,
            linkage_hash_type: None,
            linkage_truncated: None,
            linkage_offset: None,
            linkage_size: None,
            identifier: identifier.to_string(),
            team_id: None,
            special_hashes: BTreeMap::new(),
            code_hashes: vec![],
        }
    }

    /// Number of special slots recorded, which is the highest populated slot.
    pub fn n_special_slots(&self) -> u32 {
        self.special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0)
    }

    /// Exact serialized size of this blob, header included.
    pub fn serialized_size(&self) -> usize {
        let header = CodeDirectoryVersion::from_raw(self.version)
            .map(|v| v.header_size())
            .unwrap_or(CodeDirectoryVersion::Initial.header_size());

        Self::size_for(
            header,
            &self.identifier,
            self.team_id.as_deref(),
            self.hash_type,
            self.n_special_slots() as usize,
            self.code_hashes.len(),
        )
    }

    /// Size of a CodeDirectory blob with the given shape.
    pub fn size_for(
        header_size: usize,
        identifier: &str,
        team_id: Option<&str>,
        hash_type: DigestAlgorithm,
        n_special_slots: usize,
        n_code_slots: usize,
    ) -> usize {
        header_size
            + identifier.len()
            + 1
            + team_id.map(|t| t.len() + 1).unwrap_or(0)
            + hash_type.digest_len() * (n_special_slots + n_code_slots)
    }

    /// The effective code limit.
    pub fn effective_code_limit(&self) -> u64 {
        match self.code_limit_64 {
            Some(v) if v != 0 => v,
            _ => self.code_limit as u64,
        }
    }

    /// Lower the version to the minimum required by the populated fields.
    ///
    /// Returns the old version.
    pub fn adjust_version(&mut self) -> u32 {
        let old_version = self.version;

        let mut minimum_version = CodeDirectoryVersion::Initial;

        if self.scatter_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsScatter;
        }
        if self.team_id.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsTeamId;
        }
        if self.code_limit_64.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsCodeLimit64;
        }
        if self.exec_seg_base.is_some()
            || self.exec_seg_limit.is_some()
            || self.exec_seg_flags.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsExecutableSegment;
        }
        if self.runtime.is_some() || self.pre_encrypt_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsRuntime;
        }
        if self.linkage_hash_type.is_some()
            || self.linkage_truncated.is_some()
            || self.linkage_offset.is_some()
            || self.linkage_size.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsLinkage;
        }

        self.version = minimum_version as u32;

        old_version
    }
}
