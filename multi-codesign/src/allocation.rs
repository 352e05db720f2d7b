// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutable byte storage that signature handlers read from and write to.

use {
    crate::error::CodesignError,
    log::debug,
    std::{
        fs::{File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
};

/// A resizable byte span backing signable content.
///
/// Handlers only ever see the current span. Growing the span must happen
/// after any in-place patching, since resizing may relocate the storage.
pub trait Allocation {
    /// The current content.
    fn span(&self) -> &[u8];

    /// The current content, mutably.
    fn span_mut(&mut self) -> &mut [u8];

    /// Grow or shrink the content to `len` bytes. New bytes are zero.
    fn resize(&mut self, len: usize) -> Result<(), CodesignError>;

    /// Persist pending changes to the backing store.
    fn flush(&mut self) -> Result<(), CodesignError> {
        Ok(())
    }

    fn len(&self) -> usize {
        self.span().len()
    }

    fn is_empty(&self) -> bool {
        self.span().is_empty()
    }
}

/// Content held entirely in memory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryAllocation {
    data: Vec<u8>,
}

impl MemoryAllocation {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Surrender the content.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for MemoryAllocation {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl Allocation for MemoryAllocation {
    fn span(&self) -> &[u8] {
        &self.data
    }

    fn span_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn resize(&mut self, len: usize) -> Result<(), CodesignError> {
        self.data.resize(len, 0);
        Ok(())
    }
}

/// Content backed by a file on disk.
///
/// The file is read when opened. Mutations happen on an in-memory copy and
/// are written back, with the file length adjusted, on [Allocation::flush].
#[derive(Debug)]
pub struct FileAllocation {
    path: PathBuf,
    file: File,
    data: Vec<u8>,
    dirty: bool,
}

impl FileAllocation {
    /// Open a file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CodesignError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        Ok(Self {
            path,
            file,
            data,
            dirty: false,
        })
    }

    /// The path this allocation was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether there are changes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Allocation for FileAllocation {
    fn span(&self) -> &[u8] {
        &self.data
    }

    fn span_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    fn resize(&mut self, len: usize) -> Result<(), CodesignError> {
        if len != self.data.len() {
            self.data.resize(len, 0);
            self.dirty = true;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodesignError> {
        if !self.dirty {
            return Ok(());
        }

        debug!(
            "writing {} bytes back to {}",
            self.data.len(),
            self.path.display()
        );
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.data)?;
        self.file.set_len(self.data.len() as u64)?;
        self.file.flush()?;
        self.dirty = false;

        Ok(())
    }
}
