// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures (SuperBlobs, blobs and slots).
//!
//! A Mach-O code signature is a single `SuperBlob`:
//!
//! * A header holding the magic, the total length and the number of blobs.
//! * An array of `(slot, offset)` index entries, offsets relative to the
//!   start of the SuperBlob.
//! * The blobs themselves. Each blob starts with its own u32 magic and u32
//!   length, the length including that 8 byte header.
//!
//! All integers are big-endian regardless of the Mach-O byte order.

use {
    crate::{
        code_directory::CodeDirectory, code_requirement::RequirementSet, digest::DigestAlgorithm,
        error::CodesignError,
    },
    cryptographic_message_syntax::SignedData,
    scroll::{IOwrite, Pread},
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        io::Write,
    },
};

/// Size of the SuperBlob header: magic, length and count.
pub const SUPERBLOB_HEADER_SIZE: usize = 12;

/// Size of a SuperBlob index entry.
pub const BLOB_INDEX_SIZE: usize = 8;

/// Size of a blob header: magic and length.
pub const BLOB_HEADER_SIZE: usize = 8;

/// Header magic for the payload types found in signature data.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CodeSigningMagic {
    /// A single requirement expression.
    Requirement,
    /// A set of requirement expressions.
    RequirementSet,
    /// A CodeDirectory.
    CodeDirectory,
    /// The SuperBlob holding an embedded signature.
    EmbeddedSignature,
    /// XML plist entitlements.
    Entitlements,
    /// DER encoded entitlements.
    EntitlementsDer,
    /// Generic wrapper. The CMS signature is stored in this type.
    BlobWrapper,
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// A slot within embedded signature data.
///
/// Slots 1 through 7 are special slots: their blob digests are recorded in
/// the CodeDirectory at negative indices before the code page digests.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    /// Alternate CodeDirectory, 0 through 4.
    AlternateCodeDirectory(u8),
    Signature,
    Unknown(u32),
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000..=0x1004 => Self::AlternateCodeDirectory((v - 0x1000) as u8),
            0x10000 => Self::Signature,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory(i) => 0x1000 + i as u32,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl Display for CodeSigningSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CodeDirectory => f.write_str("CodeDirectory"),
            Self::Info => f.write_str("Info"),
            Self::RequirementSet => f.write_str("RequirementSet"),
            Self::ResourceDir => f.write_str("Resources"),
            Self::Application => f.write_str("Application"),
            Self::Entitlements => f.write_str("Entitlements"),
            Self::RepSpecific => f.write_str("Rep Specific"),
            Self::EntitlementsDer => f.write_str("DER Entitlements"),
            Self::AlternateCodeDirectory(i) => {
                f.write_fmt(format_args!("CodeDirectory Alternate #{}", i))
            }
            Self::Signature => f.write_str("CMS Signature"),
            Self::Unknown(v) => f.write_fmt(format_args!("Unknown ({})", v)),
        }
    }
}

impl CodeSigningSlot {
    /// Whether this slot's digest is recorded in the CodeDirectory special slots.
    pub fn is_special(&self) -> bool {
        matches!(u32::from(*self), 1..=7)
    }
}

/// Read the magic and length fields of a blob.
pub fn read_blob_header(data: &[u8]) -> Result<(u32, usize), CodesignError> {
    let magic = data.pread_with::<u32>(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)?;

    Ok((magic, length as usize))
}

/// Validate a blob's header and return its payload.
///
/// The payload is bounded by the length recorded in the header.
pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], CodesignError> {
    let (magic, length) = read_blob_header(data)?;

    if magic != expected_magic {
        return Err(CodesignError::BadMagic(what));
    }

    if length < BLOB_HEADER_SIZE || length > data.len() {
        return Err(CodesignError::Truncated {
            offset: 0,
            needed: length,
        });
    }

    Ok(&data[BLOB_HEADER_SIZE..length])
}

/// Common behavior of typed blobs.
pub trait Blob: Sized {
    /// The header magic that identifies this format.
    fn magic() -> u32;

    /// Parse an instance from bytes beginning with the blob header.
    fn from_blob_bytes(data: &[u8]) -> Result<Self, CodesignError>;

    /// Serialize the payload, without the blob header.
    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError>;

    /// Serialize this blob, header included.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodesignError> {
        let payload = self.serialize_payload()?;

        let mut res = Vec::with_capacity(payload.len() + BLOB_HEADER_SIZE);
        res.iowrite_with(Self::magic(), scroll::BE)?;
        // Length includes our own header.
        res.iowrite_with((payload.len() + BLOB_HEADER_SIZE) as u32, scroll::BE)?;
        res.extend(payload);

        Ok(res)
    }

    /// Digest the serialized blob.
    fn digest_with(&self, digest: DigestAlgorithm) -> Result<Vec<u8>, CodesignError> {
        Ok(digest.digest_data(&self.to_blob_bytes()?))
    }
}

/// A blob holding opaque data, used for the CMS signature.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlobWrapper {
    pub data: Vec<u8>,
}

impl Blob for BlobWrapper {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, CodesignError> {
        Ok(Self {
            data: read_and_validate_blob_header(data, Self::magic(), "blob wrapper")?.to_vec(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        Ok(self.data.clone())
    }
}

/// Create the binary content for an embedded signature SuperBlob.
///
/// Blobs are laid out in the order given, with index entries in ascending
/// offset order.
pub fn create_superblob(blobs: &[(CodeSigningSlot, Vec<u8>)]) -> Result<Vec<u8>, CodesignError> {
    let total_length = SUPERBLOB_HEADER_SIZE
        + BLOB_INDEX_SIZE * blobs.len()
        + blobs.iter().map(|(_, data)| data.len()).sum::<usize>();

    let mut dest = Vec::with_capacity(total_length);
    dest.iowrite_with(u32::from(CodeSigningMagic::EmbeddedSignature), scroll::BE)?;
    dest.iowrite_with(total_length as u32, scroll::BE)?;
    dest.iowrite_with(blobs.len() as u32, scroll::BE)?;

    let mut offset = SUPERBLOB_HEADER_SIZE + BLOB_INDEX_SIZE * blobs.len();
    for (slot, data) in blobs {
        dest.iowrite_with(u32::from(*slot), scroll::BE)?;
        dest.iowrite_with(offset as u32, scroll::BE)?;
        offset += data.len();
    }

    for (_, data) in blobs {
        dest.write_all(data)?;
    }

    Ok(dest)
}

/// A single blob referenced by a SuperBlob index entry.
#[derive(Clone, Debug)]
pub struct BlobEntry<'a> {
    /// Position within the SuperBlob index.
    pub index: usize,
    pub slot: CodeSigningSlot,
    /// Start offset within the SuperBlob.
    pub offset: usize,
    pub magic: CodeSigningMagic,
    /// The raw blob, header included, bounded by its recorded length.
    pub data: &'a [u8],
}

impl<'a> BlobEntry<'a> {
    /// The blob data without its header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[BLOB_HEADER_SIZE..]
    }

    /// Digest the raw blob.
    pub fn digest_with(&self, digest: DigestAlgorithm) -> Vec<u8> {
        digest.digest_data(self.data)
    }
}

/// A lightly parsed embedded signature SuperBlob.
#[derive(Clone, Debug)]
pub struct EmbeddedSignature<'a> {
    /// Length recorded in the SuperBlob header.
    pub length: u32,
    /// Raw data backing the SuperBlob, bounded by its recorded length.
    pub data: &'a [u8],
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> EmbeddedSignature<'a> {
    /// Parse a SuperBlob.
    ///
    /// `data` is the region referenced by `LC_CODE_SIGNATURE` and may be
    /// longer than the SuperBlob itself.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        let offset = &mut 0;

        let magic = CodeSigningMagic::from(data.gread_with::<u32>(offset, scroll::BE)?);
        if magic != CodeSigningMagic::EmbeddedSignature {
            return Err(CodesignError::BadMagic("embedded signature super blob"));
        }

        let length = data.gread_with::<u32>(offset, scroll::BE)?;
        let count = data.gread_with::<u32>(offset, scroll::BE)? as usize;

        let index_end = count
            .checked_mul(BLOB_INDEX_SIZE)
            .and_then(|v| v.checked_add(SUPERBLOB_HEADER_SIZE))
            .ok_or(CodesignError::SuperblobMalformed)?;

        if (length as usize) < index_end || length as usize > data.len() {
            return Err(CodesignError::SuperblobMalformed);
        }

        let data = &data[..length as usize];
        let mut blobs = Vec::with_capacity(count);

        for i in 0..count {
            let slot = CodeSigningSlot::from(data.gread_with::<u32>(offset, scroll::BE)?);
            let blob_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;

            if blob_offset < index_end {
                return Err(CodesignError::SuperblobMalformed);
            }

            let full_slice = data
                .get(blob_offset..)
                .ok_or(CodesignError::SuperblobMalformed)?;
            let (blob_magic, blob_length) = read_blob_header(full_slice)?;

            // Self-reported length can't exceed the data we have.
            if blob_length < BLOB_HEADER_SIZE || blob_length > full_slice.len() {
                return Err(CodesignError::SuperblobMalformed);
            }

            blobs.push(BlobEntry {
                index: i,
                slot,
                offset: blob_offset,
                magic: blob_magic.into(),
                data: &full_slice[..blob_length],
            });
        }

        Ok(Self {
            length,
            data,
            blobs,
        })
    }

    /// Find the first occurrence of a slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    /// The raw CodeDirectory blob, if present.
    pub fn code_directory_data(&self) -> Result<Option<&'a [u8]>, CodesignError> {
        match self.find_slot(CodeSigningSlot::CodeDirectory) {
            Some(entry) if entry.magic == CodeSigningMagic::CodeDirectory => Ok(Some(entry.data)),
            Some(_) => Err(CodesignError::BadMagic("code directory blob")),
            None => Ok(None),
        }
    }

    /// Parse the CodeDirectory, if present.
    pub fn code_directory(&self) -> Result<Option<CodeDirectory>, CodesignError> {
        self.code_directory_data()?
            .map(CodeDirectory::from_blob_bytes)
            .transpose()
    }

    /// Parse the requirement set, if present.
    pub fn code_requirements(&self) -> Result<Option<RequirementSet>, CodesignError> {
        self.find_slot(CodeSigningSlot::RequirementSet)
            .map(|entry| RequirementSet::from_blob_bytes(entry.data))
            .transpose()
    }

    /// Raw CMS signature data, if present.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, CodesignError> {
        match self.find_slot(CodeSigningSlot::Signature) {
            Some(entry) if entry.magic == CodeSigningMagic::BlobWrapper => Ok(Some(entry.payload())),
            Some(_) => Err(CodesignError::BadMagic("signature blob wrapper")),
            None => Ok(None),
        }
    }

    /// Parse the CMS signature, if present.
    ///
    /// An empty signature blob is treated as no signature.
    pub fn signed_data(&self) -> Result<Option<SignedData>, CodesignError> {
        match self.signature_data()? {
            Some(data) if !data.is_empty() => Ok(Some(SignedData::parse_ber(data)?)),
            _ => Ok(None),
        }
    }
}
