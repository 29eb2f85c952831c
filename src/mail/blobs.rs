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

//! Storage of message content.
//!
//! Each mail's content (prepended headers plus body, exactly as it will be
//! served to clients) lives in a single file named after the mail's ID. Blobs
//! are written once and never modified.

use std::fs;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

use crate::mail::store::MailId;

pub struct BlobStore {
    folder: PathBuf,
}

impl BlobStore {
    pub fn new(folder: PathBuf) -> Self {
        Self { folder }
    }

    /// Ensures the blob directory exists.
    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.folder)
    }

    pub fn path(&self, id: MailId) -> PathBuf {
        self.folder.join(id.to_string())
    }

    /// Writes the entirety of `src` as the blob for `id`.
    ///
    /// The blob becomes visible atomically once it is fully written. Fails
    /// with `AlreadyExists` if `id` is already in use.
    ///
    /// Returns the number of bytes written.
    pub fn write(&self, id: MailId, src: &mut impl Read) -> io::Result<u64> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.folder)?;
        let size = {
            let mut w = io::BufWriter::new(tmp.as_file_mut());
            let size = io::copy(src, &mut w)?;
            w.into_inner().map_err(io::IntoInnerError::into_error)?;
            size
        };
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(self.path(id)).map_err(|e| e.error)?;
        Ok(size)
    }

    pub fn open(&self, id: MailId) -> io::Result<fs::File> {
        fs::File::open(self.path(id))
    }

    /// Opens the blob for `id` positioned `offset` bytes in.
    pub fn open_at(&self, id: MailId, offset: u64) -> io::Result<fs::File> {
        let mut file = self.open(id)?;
        file.seek(io::SeekFrom::Start(offset))?;
        Ok(file)
    }

    /// Deletes the blob for `id`.
    ///
    /// Returns `false` if it did not exist. Open readers of the blob remain
    /// usable.
    pub fn delete(&self, id: MailId) -> io::Result<bool> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(true),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, id: MailId) -> bool {
        self.path(id).is_file()
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }
}
