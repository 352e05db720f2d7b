// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PE image structures relevant to Authenticode.
//!
//! Authenticode signatures live in the attribute certificate table, which
//! is not mapped into memory and is referenced by the security entry of the
//! optional header's data directories. The image digest covers everything
//! but the checksum field, that directory entry and the certificate table.

use {
    crate::{digest::DigestAlgorithm, error::CodesignError},
    scroll::Pread,
};

/// Optional header magic of PE32 images.
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
/// Optional header magic of PE32+ images.
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;

/// Size of the `WIN_CERTIFICATE` header.
pub const WIN_CERTIFICATE_HEADER_SIZE: usize = 8;

pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

const PE_SIGNATURE: &[u8] = b"PE\0\0";
const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;
const DATA_DIRECTORY_SIZE: usize = 8;
const SECTION_HEADER_SIZE: usize = 40;

pub(crate) fn align8(v: usize) -> usize {
    (v + 7) & !7
}

/// Whether data begins with a DOS header.
pub fn is_pe_magic(data: &[u8]) -> bool {
    data.starts_with(b"MZ")
}

/// Raw data of a section.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeSection {
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
}

impl PeSection {
    pub fn raw_data_end(&self) -> usize {
        self.pointer_to_raw_data as usize + self.size_of_raw_data as usize
    }
}

/// Parsed layout of a PE image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeContext {
    pub optional_header_magic: u16,
    /// File offset of the optional header checksum.
    pub checksum_offset: usize,
    /// File offset of the security data directory entry, if the image has
    /// enough directory entries.
    pub security_entry_offset: Option<usize>,
    /// File offset of the attribute certificate table.
    pub security_virtual_address: u32,
    pub security_size: u32,
    pub size_of_headers: usize,
    /// Sections with raw data, sorted by file offset.
    pub sections: Vec<PeSection>,
    pub file_len: usize,
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, CodesignError> {
    data.pread_with::<u16>(offset, scroll::LE)
        .map_err(|_| CodesignError::Truncated { offset, needed: 2 })
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, CodesignError> {
    data.pread_with::<u32>(offset, scroll::LE)
        .map_err(|_| CodesignError::Truncated { offset, needed: 4 })
}

impl PeContext {
    /// Parse the headers of a PE image.
    pub fn parse(data: &[u8]) -> Result<Self, CodesignError> {
        if !is_pe_magic(data) {
            return Err(CodesignError::BadMagic("DOS header"));
        }

        let pe_offset = read_u32(data, 0x3c)? as usize;
        let signature = data
            .get(pe_offset..pe_offset + PE_SIGNATURE.len())
            .ok_or(CodesignError::Truncated {
                offset: pe_offset,
                needed: PE_SIGNATURE.len(),
            })?;
        if signature != PE_SIGNATURE {
            return Err(CodesignError::BadMagic("PE signature"));
        }

        let number_of_sections = read_u16(data, pe_offset + 6)? as usize;
        let optional_header_size = read_u16(data, pe_offset + 20)? as usize;
        let optional_header = pe_offset + 24;

        if data.len() < optional_header + optional_header_size {
            return Err(CodesignError::Truncated {
                offset: optional_header,
                needed: optional_header_size,
            });
        }

        let optional_header_magic = read_u16(data, optional_header)?;
        let (rva_count_offset, directories_offset) = match optional_header_magic {
            IMAGE_NT_OPTIONAL_HDR32_MAGIC => (92, 96),
            IMAGE_NT_OPTIONAL_HDR64_MAGIC => (108, 112),
            magic => {
                return Err(CodesignError::InvalidPe(format!(
                    "unknown optional header magic {:#x}",
                    magic
                )))
            }
        };

        if optional_header_size < directories_offset {
            return Err(CodesignError::InvalidPe(format!(
                "optional header of {} bytes is too small",
                optional_header_size
            )));
        }

        let size_of_headers = read_u32(data, optional_header + 60)? as usize;
        let checksum_offset = optional_header + 64;
        let rva_count = read_u32(data, optional_header + rva_count_offset)? as usize;

        let security_entry = directories_offset
            + IMAGE_DIRECTORY_ENTRY_SECURITY * DATA_DIRECTORY_SIZE;
        let security_entry_offset = if rva_count > IMAGE_DIRECTORY_ENTRY_SECURITY
            && security_entry + DATA_DIRECTORY_SIZE <= optional_header_size
        {
            Some(optional_header + security_entry)
        } else {
            None
        };

        let (security_virtual_address, security_size) = match security_entry_offset {
            Some(offset) => (read_u32(data, offset)?, read_u32(data, offset + 4)?),
            None => (0, 0),
        };

        let section_table = optional_header + optional_header_size;
        let mut sections = Vec::with_capacity(number_of_sections);
        for i in 0..number_of_sections {
            let entry = section_table + i * SECTION_HEADER_SIZE;
            let size_of_raw_data = read_u32(data, entry + 16)?;
            let pointer_to_raw_data = read_u32(data, entry + 20)?;

            if size_of_raw_data == 0 {
                continue;
            }

            sections.push(PeSection {
                pointer_to_raw_data,
                size_of_raw_data,
            });
        }
        sections.sort_by_key(|s| s.pointer_to_raw_data);

        Ok(Self {
            optional_header_magic,
            checksum_offset,
            security_entry_offset,
            security_virtual_address,
            security_size,
            size_of_headers,
            sections,
            file_len: data.len(),
        })
    }

    /// Whether the security directory references a certificate table.
    pub fn is_signed(&self) -> bool {
        self.security_entry_offset.is_some()
            && self.security_virtual_address != 0
            && self.security_size as usize > WIN_CERTIFICATE_HEADER_SIZE
    }

    /// Compute the Authenticode digest of the image.
    ///
    /// The zero padding at the end aligns the end offset of the hashed data
    /// to 8 bytes. A certificate table is written at that aligned offset, so
    /// the digest is the same before and after signing.
    pub fn authenticode_digest(
        &self,
        data: &[u8],
        digest: DigestAlgorithm,
    ) -> Result<Vec<u8>, CodesignError> {
        let mut hasher = digest.as_hasher();

        let headers_end = self.size_of_headers.min(data.len());
        if headers_end < self.checksum_offset + 4 {
            return Err(CodesignError::InvalidPe(
                "size of headers does not cover the optional header".into(),
            ));
        }

        hasher.update(&data[..self.checksum_offset]);

        match self.security_entry_offset {
            Some(entry) if entry + DATA_DIRECTORY_SIZE <= headers_end => {
                hasher.update(&data[self.checksum_offset + 4..entry]);
                hasher.update(&data[entry + DATA_DIRECTORY_SIZE..headers_end]);
            }
            _ => {
                hasher.update(&data[self.checksum_offset + 4..headers_end]);
            }
        }

        let mut hashed_end = headers_end;
        for section in &self.sections {
            let start = section.pointer_to_raw_data as usize;
            let end = section.raw_data_end();

            let raw = data.get(start..end).ok_or(CodesignError::Truncated {
                offset: start,
                needed: section.size_of_raw_data as usize,
            })?;
            hasher.update(raw);

            hashed_end = hashed_end.max(end);
        }

        let certificate_size = if self.is_signed() {
            self.security_size as usize
        } else {
            0
        };
        let trailing_end = data.len().checked_sub(certificate_size).ok_or_else(|| {
            CodesignError::InvalidPe("certificate table larger than the image".into())
        })?;

        if trailing_end > hashed_end {
            hasher.update(&data[hashed_end..trailing_end]);
            hashed_end = trailing_end;
        }

        let padding = align8(hashed_end) - hashed_end;
        hasher.update(&[0u8; 8][..padding]);

        Ok(hasher.finish().as_ref().to_vec())
    }

    /// The CMS envelope in the certificate table, if signed.
    pub fn signature_data<'a>(&self, data: &'a [u8]) -> Result<Option<&'a [u8]>, CodesignError> {
        if !self.is_signed() {
            return Ok(None);
        }

        let start = self.security_virtual_address as usize;
        let table = data
            .get(start..start + self.security_size as usize)
            .ok_or(CodesignError::EnvelopeMalformed(
                "certificate table extends beyond the image",
            ))?;

        let length = read_u32(table, 0)? as usize;
        let revision = read_u16(table, 4)?;
        let certificate_type = read_u16(table, 6)?;

        if length < WIN_CERTIFICATE_HEADER_SIZE || length > table.len() {
            return Err(CodesignError::EnvelopeMalformed(
                "WIN_CERTIFICATE length out of bounds",
            ));
        }
        if revision != WIN_CERT_REVISION_2_0 || certificate_type != WIN_CERT_TYPE_PKCS_SIGNED_DATA {
            return Err(CodesignError::EnvelopeMalformed(
                "WIN_CERTIFICATE is not a PKCS#7 signed data certificate",
            ));
        }

        Ok(Some(&table[WIN_CERTIFICATE_HEADER_SIZE..length]))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::*,
        scroll::{Pwrite, LE},
        std::ops::Range,
    };

    const CHECKSUM: usize = 0x58 + 64;
    const SECURITY_ENTRY_PE32: usize = 0x58 + 128;
    const SECURITY_ENTRY_PE32_PLUS: usize = 0x58 + 144;

    /// SHA-256 of the given ranges of `data` followed by `padding` zero bytes.
    fn concatenated_sha256(data: &[u8], ranges: &[Range<usize>], padding: usize) -> Vec<u8> {
        let mut message = Vec::new();
        for range in ranges {
            message.extend_from_slice(&data[range.clone()]);
        }
        message.resize(message.len() + padding, 0);

        ring::digest::digest(&ring::digest::SHA256, &message)
            .as_ref()
            .to_vec()
    }

    #[test]
    fn parse_pe32_and_pe32_plus() -> Result<(), CodesignError> {
        for plus in [false, true] {
            let data = pe_fixture(&[&[1u8; 700], &[2u8; 100]], plus);
            let ctx = PeContext::parse(&data)?;

            assert_eq!(
                ctx.optional_header_magic,
                if plus { 0x20b } else { 0x10b }
            );
            assert_eq!(ctx.checksum_offset, 0x58 + 64);
            assert_eq!(
                ctx.security_entry_offset,
                Some(0x58 + if plus { 144 } else { 128 })
            );
            assert_eq!(ctx.sections.len(), 2);
            assert_eq!(ctx.sections[0].pointer_to_raw_data as usize, 512);
            assert_eq!(ctx.sections[1].pointer_to_raw_data as usize, 512 + 1024);
            assert!(!ctx.is_signed());
        }

        Ok(())
    }

    #[test]
    fn reject_bad_headers() {
        assert!(matches!(
            PeContext::parse(b"ZM\0\0"),
            Err(CodesignError::BadMagic(_))
        ));

        let mut data = pe_fixture(&[], false);
        data[0x40] = b'X';
        assert!(matches!(
            PeContext::parse(&data),
            Err(CodesignError::BadMagic(_))
        ));

        let mut data = pe_fixture(&[], false);
        data[0x58] = 0x07;
        assert!(matches!(
            PeContext::parse(&data),
            Err(CodesignError::InvalidPe(_))
        ));

        let data = pe_fixture(&[], false);
        assert!(matches!(
            PeContext::parse(&data[..0x60]),
            Err(CodesignError::Truncated { .. })
        ));
    }

    #[test]
    fn digest_ignores_checksum_and_security_entry() -> Result<(), CodesignError> {
        let data = pe_fixture(&[b"code"], false);
        let ctx = PeContext::parse(&data)?;
        let original = ctx.authenticode_digest(&data, DigestAlgorithm::Sha256)?;
        assert_eq!(original.len(), 32);

        let mut patched = data.clone();
        patched[ctx.checksum_offset] ^= 0xff;
        patched[ctx.security_entry_offset.unwrap() + 3] = 0x7f;
        assert_eq!(
            PeContext::parse(&patched)?.authenticode_digest(&patched, DigestAlgorithm::Sha256)?,
            original
        );

        let mut patched = data;
        patched[512] ^= 0xff;
        assert_ne!(
            ctx.authenticode_digest(&patched, DigestAlgorithm::Sha256)?,
            original
        );

        Ok(())
    }

    #[test]
    fn digest_pads_unaligned_trailing_data() -> Result<(), CodesignError> {
        let mut data = pe_fixture(&[], true);
        data.extend_from_slice(b"tail");

        let ctx = PeContext::parse(&data)?;
        let digest = ctx.authenticode_digest(&data, DigestAlgorithm::Sha1)?;

        let mut padded = data.clone();
        padded.extend_from_slice(&[0u8; 4]);
        let padded_ctx = PeContext::parse(&padded)?;

        assert_eq!(
            digest,
            padded_ctx.authenticode_digest(&padded, DigestAlgorithm::Sha1)?
        );

        Ok(())
    }

    #[test]
    fn digest_matches_manual_range_concatenation() -> Result<(), CodesignError> {
        let mut data = pe_fixture(&[b"code", &[0xccu8; 600]], false);
        assert_eq!(data.len(), 2048);
        data.extend_from_slice(b"overlay");

        let unsigned = concatenated_sha256(
            &data,
            &[
                0..CHECKSUM,
                CHECKSUM + 4..SECURITY_ENTRY_PE32,
                SECURITY_ENTRY_PE32 + 8..512,
                512..1024,
                1024..2048,
                2048..2055,
            ],
            1,
        );
        assert_eq!(
            PeContext::parse(&data)?.authenticode_digest(&data, DigestAlgorithm::Sha256)?,
            unsigned
        );

        // Certificate table at the next 8 byte boundary.
        data.resize(2056, 0);
        data.extend_from_slice(&[0xee; 24]);
        data.pwrite_with(2056u32, SECURITY_ENTRY_PE32, LE)?;
        data.pwrite_with(24u32, SECURITY_ENTRY_PE32 + 4, LE)?;
        data.pwrite_with(0xdead_beefu32, CHECKSUM, LE)?;

        let signed = concatenated_sha256(
            &data,
            &[
                0..CHECKSUM,
                CHECKSUM + 4..SECURITY_ENTRY_PE32,
                SECURITY_ENTRY_PE32 + 8..512,
                512..1024,
                1024..2048,
                2048..2056,
            ],
            0,
        );
        assert_eq!(signed, unsigned);

        let ctx = PeContext::parse(&data)?;
        assert!(ctx.is_signed());
        assert_eq!(ctx.authenticode_digest(&data, DigestAlgorithm::Sha256)?, signed);

        Ok(())
    }

    #[test]
    fn digest_follows_file_order_and_skips_empty_sections() -> Result<(), CodesignError> {
        let sections = [
            FixtureSection::aligned(b"first in table"),
            FixtureSection::aligned(&[0x5a; 700]),
            FixtureSection {
                content: &[],
                raw_size: 0,
            },
        ];
        // Table entry 1 is laid out before table entry 0. Entry 2 points past
        // the end of the file.
        let data = pe_fixture_with_layout(&sections, &[1, 0], true);
        assert_eq!(data.len(), 512 + 1024 + 512);
        assert_eq!(&data[1536..1550], b"first in table");

        let ctx = PeContext::parse(&data)?;
        assert_eq!(ctx.sections.len(), 2);
        assert_eq!(ctx.sections[0].pointer_to_raw_data, 512);
        assert_eq!(ctx.sections[1].pointer_to_raw_data, 1536);

        let headers = [
            0..CHECKSUM,
            CHECKSUM + 4..SECURITY_ENTRY_PE32_PLUS,
            SECURITY_ENTRY_PE32_PLUS + 8..512,
        ];

        let mut file_order = headers.to_vec();
        file_order.extend([512..1536, 1536..2048]);
        let expected = concatenated_sha256(&data, &file_order, 0);
        assert_eq!(
            ctx.authenticode_digest(&data, DigestAlgorithm::Sha256)?,
            expected
        );

        let mut table_order = headers.to_vec();
        table_order.extend([1536..2048, 512..1536]);
        assert_ne!(concatenated_sha256(&data, &table_order, 0), expected);

        Ok(())
    }
}
