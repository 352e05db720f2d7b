// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O primitives related to code signing.
//!
//! [MachOContext] is a light description of a thin Mach-O binary: the byte
//! order and width, the `__TEXT` and `__LINKEDIT` segments and the
//! `LC_CODE_SIGNATURE` load command if present. It holds offsets only and
//! is derived anew from the current bytes whenever they may have changed.
//!
//! Signatures live at the end of `__LINKEDIT`, which must also be the end of
//! the file. Adding one means appending a load command, growing
//! `__LINKEDIT` and writing the SuperBlob at a 16 byte aligned offset.

use {
    crate::{embedded_signature::EmbeddedSignature, error::CodesignError},
    log::{debug, warn},
    scroll::{Endian, Pread, Pwrite},
};

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;
pub const FAT_MAGIC_64: u32 = 0xcafe_babf;
pub const FAT_CIGAM_64: u32 = 0xbfba_feca;

pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;

/// Size of a `linkedit_data_command`.
pub const LINKEDIT_DATA_COMMAND_SIZE: usize = 16;

/// `filetype` of main executables.
pub const MH_EXECUTE: u32 = 0x2;

/// Alignment of the signature data offset.
pub const SIGNATURE_ALIGNMENT: usize = 16;

pub(crate) fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Whether data begins with a Mach-O or universal binary magic.
pub fn is_macho_magic(data: &[u8]) -> bool {
    match data.pread_with::<u32>(0, scroll::LE) {
        Ok(magic) => matches!(
            magic,
            MH_MAGIC
                | MH_CIGAM
                | MH_MAGIC_64
                | MH_CIGAM_64
                | FAT_MAGIC
                | FAT_CIGAM
                | FAT_MAGIC_64
                | FAT_CIGAM_64
        ),
        Err(_) => false,
    }
}

/// A segment load command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentInfo {
    /// File offset of the load command.
    pub command_offset: usize,
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
}

impl SegmentInfo {
    /// File offset just past the segment's data.
    pub fn file_end(&self) -> u64 {
        self.fileoff + self.filesize
    }
}

/// The `LC_CODE_SIGNATURE` load command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CodeSignatureCommand {
    /// File offset of the load command.
    pub command_offset: usize,
    /// File offset of the signature data.
    pub data_offset: u32,
    pub data_size: u32,
}

/// Parsed layout of a thin Mach-O binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachOContext {
    pub endian: Endian,
    pub is_64: bool,
    pub header_size: usize,
    pub file_type: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub text: SegmentInfo,
    pub linkedit: SegmentInfo,
    pub code_signature: Option<CodeSignatureCommand>,
    /// File offset just past the last load command.
    pub commands_end: usize,
    /// Lowest file offset of any section with file content.
    pub first_section_offset: Option<u64>,
    /// Length of the data this context was derived from.
    pub file_len: usize,
}

fn segment_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());

    String::from_utf8_lossy(&raw[..end]).to_string()
}

fn read_bytes(data: &[u8], offset: usize, len: usize) -> Result<&[u8], CodesignError> {
    data.get(offset..offset + len).ok_or(CodesignError::Truncated {
        offset,
        needed: len,
    })
}

impl MachOContext {
    /// Parse the headers of a thin Mach-O binary.
    pub fn parse(data: &[u8]) -> Result<Self, CodesignError> {
        let magic = data
            .pread_with::<u32>(0, scroll::LE)
            .map_err(|_| CodesignError::Truncated {
                offset: 0,
                needed: 4,
            })?;

        let (endian, is_64) = match magic {
            MH_MAGIC => (scroll::LE, false),
            MH_MAGIC_64 => (scroll::LE, true),
            MH_CIGAM => (scroll::BE, false),
            MH_CIGAM_64 => (scroll::BE, true),
            FAT_MAGIC | FAT_CIGAM | FAT_MAGIC_64 | FAT_CIGAM_64 => {
                return Err(CodesignError::UniversalBinary)
            }
            _ => return Err(CodesignError::BadMagic("mach-o header")),
        };

        let header_size = if is_64 { 32 } else { 28 };
        read_bytes(data, 0, header_size)?;

        let file_type = data.pread_with::<u32>(12, endian)?;
        let ncmds = data.pread_with::<u32>(16, endian)?;
        let sizeofcmds = data.pread_with::<u32>(20, endian)?;

        let commands_end = header_size + sizeofcmds as usize;
        if commands_end > data.len() {
            return Err(CodesignError::Truncated {
                offset: header_size,
                needed: sizeofcmds as usize,
            });
        }

        let mut text = None;
        let mut linkedit = None;
        let mut code_signature = None;
        let mut first_section_offset: Option<u64> = None;

        let mut offset = header_size;
        for index in 0..ncmds {
            let cmd = data.pread_with::<u32>(offset, endian)?;
            let cmdsize = data.pread_with::<u32>(offset + 4, endian)? as usize;

            if cmdsize < 8 || offset + cmdsize > commands_end {
                return Err(CodesignError::InvalidMachO(format!(
                    "load command {} at offset {} has invalid size {}",
                    index, offset, cmdsize
                )));
            }

            let command = &data[offset..offset + cmdsize];

            match cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let is_64_command = cmd == LC_SEGMENT_64;
                    let segment = Self::parse_segment(command, offset, is_64_command, endian)?;

                    if let Some(section_offset) =
                        Self::lowest_section_offset(command, is_64_command, endian)?
                    {
                        first_section_offset = Some(
                            first_section_offset.map_or(section_offset, |v| v.min(section_offset)),
                        );
                    }

                    match segment.name.as_str() {
                        "__TEXT" => text = Some(segment),
                        "__LINKEDIT" => linkedit = Some(segment),
                        _ => {}
                    }
                }
                LC_CODE_SIGNATURE => {
                    if cmdsize < LINKEDIT_DATA_COMMAND_SIZE {
                        return Err(CodesignError::InvalidMachO(
                            "LC_CODE_SIGNATURE command too small".into(),
                        ));
                    }

                    code_signature = Some(CodeSignatureCommand {
                        command_offset: offset,
                        data_offset: command.pread_with::<u32>(8, endian)?,
                        data_size: command.pread_with::<u32>(12, endian)?,
                    });
                }
                _ => {}
            }

            offset += cmdsize;
        }

        Ok(Self {
            endian,
            is_64,
            header_size,
            file_type,
            ncmds,
            sizeofcmds,
            text: text.ok_or(CodesignError::MissingTextSegment)?,
            linkedit: linkedit.ok_or(CodesignError::MissingLinkeditSegment)?,
            code_signature,
            commands_end,
            first_section_offset,
            file_len: data.len(),
        })
    }

    fn parse_segment(
        command: &[u8],
        command_offset: usize,
        is_64: bool,
        endian: Endian,
    ) -> Result<SegmentInfo, CodesignError> {
        let name = segment_name(read_bytes(command, 8, 16)?);

        Ok(if is_64 {
            SegmentInfo {
                command_offset,
                name,
                vmaddr: command.pread_with::<u64>(24, endian)?,
                vmsize: command.pread_with::<u64>(32, endian)?,
                fileoff: command.pread_with::<u64>(40, endian)?,
                filesize: command.pread_with::<u64>(48, endian)?,
            }
        } else {
            SegmentInfo {
                command_offset,
                name,
                vmaddr: command.pread_with::<u32>(24, endian)? as u64,
                vmsize: command.pread_with::<u32>(28, endian)? as u64,
                fileoff: command.pread_with::<u32>(32, endian)? as u64,
                filesize: command.pread_with::<u32>(36, endian)? as u64,
            }
        })
    }

    fn lowest_section_offset(
        command: &[u8],
        is_64: bool,
        endian: Endian,
    ) -> Result<Option<u64>, CodesignError> {
        let (nsects_offset, first_section, section_size, offset_field) = if is_64 {
            (64, 72, 80, 48)
        } else {
            (48, 56, 68, 40)
        };

        let nsects = command.pread_with::<u32>(nsects_offset, endian)? as usize;
        let mut lowest = None;

        for i in 0..nsects {
            let section = first_section + i * section_size;
            let file_offset = command.pread_with::<u32>(section + offset_field, endian)? as u64;

            // Zero-fill sections have no file content.
            if file_offset != 0 {
                lowest = Some(lowest.map_or(file_offset, |v: u64| v.min(file_offset)));
            }
        }

        Ok(lowest)
    }

    /// Whether the binary has a code signature load command.
    pub fn is_signed(&self) -> bool {
        self.code_signature.is_some()
    }

    /// Raw signature data referenced by `LC_CODE_SIGNATURE`.
    pub fn signature_data<'a>(&self, data: &'a [u8]) -> Result<Option<&'a [u8]>, CodesignError> {
        match &self.code_signature {
            Some(command) => {
                let start = command.data_offset as usize;
                let len = command.data_size as usize;

                Ok(Some(read_bytes(data, start, len)?))
            }
            None => Ok(None),
        }
    }

    /// Parse the embedded signature.
    ///
    /// A SuperBlob that fails to parse is treated as absent.
    pub fn embedded_signature<'a>(
        &self,
        data: &'a [u8],
    ) -> Result<Option<EmbeddedSignature<'a>>, CodesignError> {
        match self.signature_data(data)? {
            Some(signature) => match EmbeddedSignature::from_bytes(signature) {
                Ok(sig) => Ok(Some(sig)),
                Err(e) => {
                    warn!("ignoring malformed embedded signature: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Bytes available between the end of the load commands and the first
    /// section's data.
    pub fn load_command_space(&self) -> usize {
        let limit = self
            .first_section_offset
            .unwrap_or_else(|| self.text.file_end()) as usize;

        limit.saturating_sub(self.commands_end)
    }

    /// Plan where a signature of `reserved_size` bytes goes.
    pub fn plan_signature(&self, reserved_size: usize) -> Result<SignatureLayout, CodesignError> {
        if self.is_signed() {
            return Err(CodesignError::AlreadySigned);
        }

        if self.linkedit.file_end() != self.file_len as u64 {
            return Err(CodesignError::LinkeditNotAtEnd);
        }

        if self.load_command_space() < LINKEDIT_DATA_COMMAND_SIZE {
            return Err(CodesignError::LoadCommandNoRoom);
        }

        let data_offset = align_to(self.file_len, SIGNATURE_ALIGNMENT);

        if data_offset + reserved_size > u32::MAX as usize {
            return Err(CodesignError::Unsupported("signed binaries larger than 4 GiB"));
        }

        Ok(SignatureLayout {
            original_len: self.file_len,
            data_offset,
            reserved_size,
            command_offset: self.commands_end,
        })
    }

    fn write_segment_sizes(
        &self,
        data: &mut [u8],
        segment: &SegmentInfo,
        vmsize: u64,
        filesize: u64,
    ) -> Result<(), CodesignError> {
        let offset = segment.command_offset;

        if self.is_64 {
            data.pwrite_with(vmsize, offset + 32, self.endian)?;
            data.pwrite_with(filesize, offset + 48, self.endian)?;
        } else {
            data.pwrite_with(vmsize as u32, offset + 28, self.endian)?;
            data.pwrite_with(filesize as u32, offset + 36, self.endian)?;
        }

        Ok(())
    }

    /// Patch header fields for a planned signature.
    ///
    /// `data` is the start of the file: the whole file or a copy of at
    /// least its header and load commands. The `LC_CODE_SIGNATURE` command
    /// is written, the command count and size are bumped and `__LINKEDIT` is
    /// grown to cover the signature. No data is appended.
    pub fn apply_signature_layout(
        &self,
        data: &mut [u8],
        layout: &SignatureLayout,
    ) -> Result<(), CodesignError> {
        let command_end = layout.command_offset + LINKEDIT_DATA_COMMAND_SIZE;
        if data.len() < command_end {
            return Err(CodesignError::Truncated {
                offset: layout.command_offset,
                needed: LINKEDIT_DATA_COMMAND_SIZE,
            });
        }

        data.pwrite_with(self.ncmds + 1, 16, self.endian)?;
        data.pwrite_with(
            self.sizeofcmds + LINKEDIT_DATA_COMMAND_SIZE as u32,
            20,
            self.endian,
        )?;

        let command = &mut data[layout.command_offset..command_end];
        command.pwrite_with(LC_CODE_SIGNATURE, 0, self.endian)?;
        command.pwrite_with(LINKEDIT_DATA_COMMAND_SIZE as u32, 4, self.endian)?;
        command.pwrite_with(layout.data_offset as u32, 8, self.endian)?;
        command.pwrite_with(layout.reserved_size as u32, 12, self.endian)?;

        let new_filesize = (layout.signature_end() as u64)
            .checked_sub(self.linkedit.fileoff)
            .ok_or(CodesignError::LinkeditNotAtEnd)?;
        let delta = new_filesize - self.linkedit.filesize;

        debug!(
            "growing __LINKEDIT from {} to {} bytes",
            self.linkedit.filesize, new_filesize
        );
        self.write_segment_sizes(
            data,
            &self.linkedit,
            self.linkedit.vmsize + delta,
            new_filesize,
        )
    }

    /// Remove the code signature load command and shrink `__LINKEDIT`.
    ///
    /// Load commands following the signature command move down and the
    /// vacated bytes are zeroed. Returns the number of trailing bytes
    /// belonging to the removed signature, or `None` when unsigned.
    pub fn remove_signature_command(&self, data: &mut [u8]) -> Result<Option<usize>, CodesignError> {
        let command = match &self.code_signature {
            Some(command) => *command,
            None => return Ok(None),
        };

        let command_size = data.pread_with::<u32>(command.command_offset + 4, self.endian)? as usize;
        let data_offset = command.data_offset as u64;

        if data_offset < self.linkedit.fileoff || data_offset > self.linkedit.file_end() {
            return Err(CodesignError::InvalidMachO(
                "signature data outside of __LINKEDIT".into(),
            ));
        }
        if data.len() < self.commands_end || (data_offset as usize) > data.len() {
            return Err(CodesignError::SignatureLayoutMismatch);
        }

        data.copy_within(
            command.command_offset + command_size..self.commands_end,
            command.command_offset,
        );
        data[self.commands_end - command_size..self.commands_end].fill(0);

        data.pwrite_with(self.ncmds - 1, 16, self.endian)?;
        data.pwrite_with(self.sizeofcmds - command_size as u32, 20, self.endian)?;

        // The signature runs to the end of __LINKEDIT.
        let removed = self.linkedit.file_end() - data_offset;

        // Segment commands after the signature command moved down.
        let mut linkedit = self.linkedit.clone();
        if linkedit.command_offset > command.command_offset {
            linkedit.command_offset -= command_size;
        }

        self.write_segment_sizes(
            data,
            &linkedit,
            self.linkedit.vmsize.saturating_sub(removed),
            self.linkedit.filesize - removed,
        )?;

        let trailing = data.len() - data_offset as usize;
        data[data_offset as usize..].fill(0);

        Ok(Some(trailing))
    }
}

/// Where a signature is placed in a binary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignatureLayout {
    /// File length before signing.
    pub original_len: usize,
    /// File offset of the SuperBlob. Also the code limit.
    pub data_offset: usize,
    /// Bytes reserved for the SuperBlob.
    pub reserved_size: usize,
    /// File offset of the new `LC_CODE_SIGNATURE` command.
    pub command_offset: usize,
}

impl SignatureLayout {
    /// File length after signing.
    pub fn signature_end(&self) -> usize {
        self.data_offset + self.reserved_size
    }
}

/// Mach-O data carried by a created signature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachOSignaturePayload {
    /// Serialized requirement set blob.
    pub requirements: Vec<u8>,
    /// Serialized CodeDirectory blob.
    pub code_directory: Vec<u8>,
    /// The layout the CodeDirectory was computed against.
    pub layout: SignatureLayout,
}
