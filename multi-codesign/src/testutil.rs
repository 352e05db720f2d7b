// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures shared by unit tests.

use {
    crate::policy::OID_APPLE_DEVELOPER_EXTENSION_PREFIX,
    bcder::Oid,
    bytes::{BufMut, BytesMut},
    scroll::{Endian, Pwrite},
    x509_certificate::{
        CapturedX509Certificate, InMemorySigningKeyPair, KeyAlgorithm, X509CertificateBuilder,
    },
};

/// Size of the `__LINKEDIT` segment in Mach-O fixtures.
pub const MACHO_LINKEDIT_SIZE: usize = 1024;

/// File offset of the `__text` section in Mach-O fixtures.
pub const MACHO_TEXT_SECTION_OFFSET: usize = 1024;

fn fill_pattern(data: &mut [u8], seed: u8) {
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
}

/// Build an unsigned main executable of `len` bytes.
///
/// The binary has a `__TEXT` segment with one section followed by a
/// 1 KiB `__LINKEDIT` segment ending at the end of the file. `len` must be a
/// multiple of 16 of at least 4096. Without `big_endian_32` the binary is a
/// little-endian 64-bit one.
pub fn macho_fixture(len: usize, big_endian_32: bool) -> Vec<u8> {
    assert!(len >= 4096 && len % 16 == 0);

    let (endian, magic, header_size, segment_size, section_size, lc_segment) = if big_endian_32 {
        (scroll::BE, 0xfeed_face_u32, 28, 56, 68, 0x1u32)
    } else {
        (scroll::LE, 0xfeed_facf_u32, 32, 72, 80, 0x19u32)
    };

    let text_size = len - MACHO_LINKEDIT_SIZE;
    let text_command_size = segment_size + section_size;
    let sizeofcmds = text_command_size + segment_size;

    let mut data = vec![0u8; len];
    fill_pattern(&mut data[MACHO_TEXT_SECTION_OFFSET..text_size], 7);
    fill_pattern(&mut data[text_size..], 99);

    let w = |data: &mut Vec<u8>, offset: usize, value: u32| {
        data.pwrite_with(value, offset, endian).unwrap();
    };
    let w_addr = |data: &mut Vec<u8>, offset: usize, value: u64, wide: bool| {
        if wide {
            data.pwrite_with(value, offset, endian).unwrap();
        } else {
            data.pwrite_with(value as u32, offset, endian).unwrap();
        }
    };
    let wide = !big_endian_32;
    let field = |index: usize| if wide { 24 + index * 8 } else { 24 + index * 4 };

    w(&mut data, 0, magic);
    w(&mut data, 4, if wide { 0x0100_0007 } else { 7 });
    w(&mut data, 8, 3);
    w(&mut data, 12, 2);
    w(&mut data, 16, 2);
    w(&mut data, 20, sizeofcmds as u32);

    // __TEXT with a single __text section.
    let text = header_size;
    w(&mut data, text, lc_segment);
    w(&mut data, text + 4, text_command_size as u32);
    data[text + 8..text + 14].copy_from_slice(b"__TEXT");
    w_addr(&mut data, text + field(0), 0x1_0000_0000, wide);
    w_addr(&mut data, text + field(1), text_size as u64, wide);
    w_addr(&mut data, text + field(2), 0, wide);
    w_addr(&mut data, text + field(3), text_size as u64, wide);
    let after_sizes = text + field(4);
    w(&mut data, after_sizes, 5);
    w(&mut data, after_sizes + 4, 5);
    w(&mut data, after_sizes + 8, 1);

    let section = text + segment_size;
    data[section..section + 6].copy_from_slice(b"__text");
    data[section + 16..section + 22].copy_from_slice(b"__TEXT");
    let (size_field, offset_field) = if wide { (40, 48) } else { (36, 40) };
    w_addr(
        &mut data,
        section + size_field,
        (text_size - MACHO_TEXT_SECTION_OFFSET) as u64,
        wide,
    );
    w(&mut data, section + offset_field, MACHO_TEXT_SECTION_OFFSET as u32);

    // __LINKEDIT covering the tail of the file.
    let linkedit = text + text_command_size;
    w(&mut data, linkedit, lc_segment);
    w(&mut data, linkedit + 4, segment_size as u32);
    data[linkedit + 8..linkedit + 18].copy_from_slice(b"__LINKEDIT");
    w_addr(&mut data, linkedit + field(0), 0x1_0001_0000, wide);
    w_addr(&mut data, linkedit + field(1), MACHO_LINKEDIT_SIZE as u64, wide);
    w_addr(&mut data, linkedit + field(2), text_size as u64, wide);
    w_addr(&mut data, linkedit + field(3), MACHO_LINKEDIT_SIZE as u64, wide);
    w(&mut data, linkedit + field(4), 1);
    w(&mut data, linkedit + field(4) + 4, 1);

    data
}

const PE_OFFSET: usize = 0x40;
const FILE_ALIGNMENT: usize = 512;

fn align(v: usize, a: usize) -> usize {
    (v + a - 1) / a * a
}

/// A section of a PE fixture.
pub struct FixtureSection<'a> {
    /// Bytes at the start of the section's raw data.
    pub content: &'a [u8],
    /// `SizeOfRawData`. Zero yields a section without file data.
    pub raw_size: usize,
}

impl<'a> FixtureSection<'a> {
    /// A section whose raw size is `content` rounded up to the file alignment.
    pub fn aligned(content: &'a [u8]) -> Self {
        Self {
            content,
            raw_size: align(content.len(), FILE_ALIGNMENT),
        }
    }
}

/// Build an unsigned PE image with one section per element of `sections`.
///
/// The checksum field holds a non-zero value. An empty `sections` yields
/// a header-only stub.
pub fn pe_fixture(sections: &[&[u8]], pe32_plus: bool) -> Vec<u8> {
    let sections = sections
        .iter()
        .map(|content| FixtureSection::aligned(content))
        .collect::<Vec<_>>();
    let file_order = (0..sections.len()).collect::<Vec<_>>();

    pe_fixture_with_layout(&sections, &file_order, pe32_plus)
}

/// Build an unsigned PE image with explicit section layout.
///
/// `sections` is the section table. `file_order` lists table indices in the
/// order their raw data is laid out after the headers. Sections with a zero
/// raw size must not appear in `file_order`; their `PointerToRawData` points
/// past the end of the file.
pub fn pe_fixture_with_layout(
    sections: &[FixtureSection],
    file_order: &[usize],
    pe32_plus: bool,
) -> Vec<u8> {
    let endian = scroll::LE;
    let optional_header_size = if pe32_plus { 240 } else { 224 };
    let optional_header = PE_OFFSET + 24;
    let section_table = optional_header + optional_header_size;
    let headers_end = section_table + 40 * sections.len();
    let size_of_headers = align(headers_end, FILE_ALIGNMENT);

    let mut data = vec![0u8; size_of_headers];
    data[0..2].copy_from_slice(b"MZ");
    data.pwrite_with(PE_OFFSET as u32, 0x3c, endian).unwrap();

    data[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");
    let coff = PE_OFFSET + 4;
    write_u16(&mut data, coff, if pe32_plus { 0x8664u16 } else { 0x14c }, endian);
    write_u16(&mut data, coff + 2, sections.len() as u16, endian);
    write_u16(&mut data, coff + 16, optional_header_size as u16, endian);
    write_u16(&mut data, coff + 18, 0x0102u16, endian);

    write_u16(
        &mut data,
        optional_header,
        if pe32_plus { 0x20bu16 } else { 0x10b },
        endian,
    );
    data.pwrite_with(0x1000u32, optional_header + 32, endian).unwrap();
    data.pwrite_with(FILE_ALIGNMENT as u32, optional_header + 36, endian)
        .unwrap();
    data.pwrite_with(size_of_headers as u32, optional_header + 60, endian)
        .unwrap();
    data.pwrite_with(0x1234_5678u32, optional_header + 64, endian)
        .unwrap();
    data.pwrite_with(
        16u32,
        optional_header + if pe32_plus { 108 } else { 92 },
        endian,
    )
    .unwrap();

    let mut pointers = vec![None; sections.len()];
    let mut raw_pointer = size_of_headers;
    for &index in file_order {
        assert!(sections[index].raw_size > 0);
        pointers[index] = Some(raw_pointer);
        raw_pointer += sections[index].raw_size;
    }
    let past_end = raw_pointer + FILE_ALIGNMENT;

    for (i, section) in sections.iter().enumerate() {
        let entry = section_table + 40 * i;

        data[entry..entry + 5].copy_from_slice(format!(".s{:03}", i).as_bytes());
        data.pwrite_with(section.content.len() as u32, entry + 8, endian)
            .unwrap();
        data.pwrite_with(0x1000u32 * (i as u32 + 1), entry + 12, endian)
            .unwrap();
        data.pwrite_with(section.raw_size as u32, entry + 16, endian)
            .unwrap();
        data.pwrite_with(pointers[i].unwrap_or(past_end) as u32, entry + 20, endian)
            .unwrap();
    }

    for &index in file_order {
        let section = &sections[index];
        let start = data.len();
        data.extend_from_slice(section.content);
        data.resize(start + section.raw_size, 0);
    }

    data
}

fn write_u16(data: &mut [u8], offset: usize, value: u16, endian: Endian) {
    data.pwrite_with(value, offset, endian).unwrap();
}

/// Create a self-signed Ed25519 certificate.
pub fn self_signed_certificate(
    common_name: &str,
    team_id: Option<&str>,
) -> (CapturedX509Certificate, InMemorySigningKeyPair) {
    let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ed25519);
    builder
        .subject()
        .append_common_name_utf8_string(common_name)
        .unwrap();
    if let Some(team_id) = team_id {
        builder
            .subject()
            .append_organizational_unit_utf8_string(team_id)
            .unwrap();
    }
    builder.validity_duration(chrono::Duration::hours(1));

    let (cert, key, _) = builder.create_with_random_keypair().unwrap();

    (cert, key)
}

/// Create a self-signed certificate resembling an Apple Developer ID one.
///
/// It carries the critical Developer ID Application extension and the team
/// in the subject OU.
pub fn apple_developer_certificate(
    common_name: &str,
    team_id: &str,
) -> (CapturedX509Certificate, InMemorySigningKeyPair) {
    let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ed25519);
    builder
        .subject()
        .append_common_name_utf8_string(common_name)
        .unwrap();
    builder
        .subject()
        .append_organizational_unit_utf8_string(team_id)
        .unwrap();
    builder.validity_duration(chrono::Duration::hours(1));

    let mut oid = BytesMut::from(OID_APPLE_DEVELOPER_EXTENSION_PREFIX.as_ref());
    oid.put_u8(13);
    builder.add_extension_der_data(Oid(oid.freeze()), true, &[0x05, 0x00]);

    let (cert, key, _) = builder.create_with_random_keypair().unwrap();

    (cert, key)
}

/// Encode a DER TLV holding the concatenation of `parts`.
pub fn der_tlv(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
    let content = parts.concat();

    let mut out = vec![tag];
    if content.len() < 0x80 {
        out.push(content.len() as u8);
    } else {
        let len = content.len().to_be_bytes();
        let skip = len.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (len.len() - skip) as u8);
        out.extend_from_slice(&len[skip..]);
    }
    out.extend_from_slice(&content);

    out
}

/// A UTF-16 little-endian encoding of `s`, with BOM.
pub fn utf16le_with_bom(s: &str) -> Vec<u8> {
    let mut data = vec![0xff, 0xfe];
    data.extend(s.encode_utf16().flat_map(|c| c.to_le_bytes()));
    data
}
