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

use std::rc::Rc;

use log::{info, warn};

use super::blobs::BlobStore;
use super::store::{self, StoreRef, UnixTimestamp};
use crate::support::error::Error;

/// Removes the content of mails nobody needs any more.
pub struct Cleaner {
    store: StoreRef,
    blobs: Rc<BlobStore>,
}

impl Cleaner {
    pub fn new(store: StoreRef, blobs: Rc<BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Deletes the blob of every live mail whose recipients have all
    /// reached a terminal status and marks the mail deleted.
    ///
    /// Returns the number of mails cleaned.
    pub fn clean(&self) -> Result<usize, Error> {
        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;
        let now = UnixTimestamp::now();

        let resolved = store::fetch_resolved_mails(&tx)?;
        for &id in &resolved {
            match self.blobs.delete(id) {
                Ok(true) => (),
                Ok(false) => warn!("Blob of mail {id} was already gone"),
                Err(e) => return Err(e.into()),
            }
            store::mark_mail_deleted(&tx, id, now)?;
        }
        tx.commit()?;

        if !resolved.is_empty() {
            info!("Cleaned {} mail(s)", resolved.len());
        }
        Ok(resolved.len())
    }
}
