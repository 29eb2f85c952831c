//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailroom.
//
// Mailroom is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailroom is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailroom. If not, see <http://www.gnu.org/licenses/>.

//! Message bodies of unknown length, held in memory while small and in an
//! anonymous temporary file once they outgrow a limit.
//!
//! A body is received into a `BufferWriter`, then flipped into a
//! `BufferReader` that admission hooks and the mailman can each read from
//! the start.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Where and when buffers spill to disk.
#[derive(Clone, Debug)]
pub struct Cache {
    folder: PathBuf,
    memory_limit: usize,
}

impl Cache {
    pub fn new(folder: PathBuf, memory_limit: usize) -> Self {
        Self {
            folder,
            memory_limit,
        }
    }

    /// Ensures the spill directory exists.
    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.folder)
    }

    pub fn writer(&self) -> BufferWriter {
        BufferWriter {
            cache: self.clone(),
            storage: Storage::Memory(io::Cursor::new(Vec::new())),
            len: 0,
        }
    }
}

enum Storage {
    Memory(io::Cursor<Vec<u8>>),
    /// Already unlinked, so nothing outlives the process.
    Spilled(fs::File),
}

impl Storage {
    fn stream(&mut self) -> &mut dyn ReadWriteSeek {
        match *self {
            Storage::Memory(ref mut cursor) => cursor,
            Storage::Spilled(ref mut file) => file,
        }
    }
}

trait ReadWriteSeek: Read + Write + Seek {}
impl<T: Read + Write + Seek> ReadWriteSeek for T {}

pub struct BufferWriter {
    cache: Cache,
    storage: Storage,
    len: u64,
}

impl BufferWriter {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.storage, Storage::Spilled(_))
    }

    /// Finishes writing and returns a reader positioned at the start.
    pub fn flip(mut self) -> io::Result<BufferReader> {
        let stream = self.storage.stream();
        stream.flush()?;
        stream.seek(SeekFrom::Start(0))?;
        Ok(BufferReader {
            storage: self.storage,
        })
    }

    fn spill(&mut self) -> io::Result<()> {
        let mut file = tempfile::tempfile_in(&self.cache.folder)?;
        if let Storage::Memory(ref cursor) = self.storage {
            file.write_all(cursor.get_ref())?;
        }
        self.storage = Storage::Spilled(file);
        Ok(())
    }
}

impl Write for BufferWriter {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let over_limit = usize::try_from(self.len)
            .ok()
            .and_then(|len| len.checked_add(src.len()))
            .map_or(true, |total| total > self.cache.memory_limit);
        if over_limit && !self.is_on_disk() {
            self.spill()?;
        }

        self.storage.stream().write_all(src)?;
        self.len += src.len() as u64;
        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A finished buffer, which can be read any number of times via `rewind`.
pub struct BufferReader {
    storage: Storage,
}

impl BufferReader {
    /// Wraps `data` without going through a `Cache`.
    #[cfg(test)]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            storage: Storage::Memory(io::Cursor::new(data)),
        }
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.storage.stream().seek(SeekFrom::Start(0)).map(|_| ())
    }
}

impl Read for BufferReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.storage.stream().read(dst)
    }
}
