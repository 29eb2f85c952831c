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

//! Persistence of accepted mail.

use std::io::Read;
use std::rc::Rc;

use log::{info, warn};

use super::addressbook::{self, Resolution};
use super::blobs::BlobStore;
use super::envelope::Envelope;
use super::store::{self, MailId, RecipientStatus, StoreRef, UnixTimestamp};
use crate::smtp::outbound::queue::QueueSignal;
use crate::support::error::Error;

pub struct Mailman {
    store: StoreRef,
    blobs: Rc<BlobStore>,
    queue: QueueSignal,
}

impl Mailman {
    pub fn new(
        store: StoreRef,
        blobs: Rc<BlobStore>,
        queue: QueueSignal,
    ) -> Self {
        Self {
            store,
            blobs,
            queue,
        }
    }

    /// The signal used to wake the queue worker.
    pub fn queue_signal(&self) -> &QueueSignal {
        &self.queue
    }

    /// Stores `content` as a new mail addressed per `envelope`.
    ///
    /// Local recipients are inboxed immediately and others are queued for
    /// the courier. If any local recipient does not exist, nothing is
    /// stored and `UnknownLocalAddress` is returned.
    pub fn deliver(
        &self,
        envelope: &Envelope,
        content: &mut impl Read,
    ) -> Result<MailId, Error> {
        let id = MailId::random();
        let size = self.blobs.write(id, content)?;

        match self.record(id, size, envelope) {
            Ok(queued) => {
                info!(
                    "Accepted mail {id} ({size} bytes) from <{}> for {} \
                     recipient(s)",
                    envelope.return_path(),
                    envelope.to.len(),
                );
                if queued {
                    self.queue.wake_up();
                }
                Ok(id)
            },
            Err(e) => {
                if let Err(e2) = self.blobs.delete(id) {
                    warn!("Failed to remove blob of aborted mail {id}: {e2}");
                }
                Err(e)
            },
        }
    }

    /// Writes the rows for a new mail. Returns whether any recipient was
    /// queued for outbound delivery.
    fn record(
        &self,
        id: MailId,
        size: u64,
        envelope: &Envelope,
    ) -> Result<bool, Error> {
        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;
        store::insert_mail(
            &tx,
            id,
            UnixTimestamp(envelope.date),
            &envelope.return_path(),
            size,
        )?;

        let mut queued = false;
        for to in &envelope.to {
            let forward_path = to.to_string();
            match addressbook::resolve(&tx, to)? {
                Resolution::Local(mailbox) => {
                    store::insert_recipient(
                        &tx,
                        id,
                        Some(mailbox),
                        &forward_path,
                        RecipientStatus::Inboxed,
                    )?;
                },
                Resolution::LocalUnknown => {
                    return Err(Error::UnknownLocalAddress(to.clone()));
                },
                Resolution::NonLocal => {
                    store::insert_recipient(
                        &tx,
                        id,
                        None,
                        &forward_path,
                        RecipientStatus::Pending,
                    )?;
                    queued = true;
                },
            }
        }

        tx.commit()?;
        Ok(queued)
    }
}
