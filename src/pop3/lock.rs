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

//! The registry enforcing one POP3 session per mailbox.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::mail::store::MailboxId;

/// The set of mailboxes that have a POP3 session in the transaction state.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct MailboxLocks {
    held: Arc<Mutex<HashSet<MailboxId>>>,
}

/// Proof that a session owns its mailbox. The mailbox is released when this
/// is dropped.
pub struct MailboxLock {
    held: Arc<Mutex<HashSet<MailboxId>>>,
    mailbox: MailboxId,
}

impl MailboxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock on `mailbox`, or returns `None` if another session
    /// holds it.
    pub fn try_lock(&self, mailbox: MailboxId) -> Option<MailboxLock> {
        if !self.held.lock().unwrap().insert(mailbox) {
            return None;
        }

        Some(MailboxLock {
            held: Arc::clone(&self.held),
            mailbox,
        })
    }

    #[cfg(test)]
    pub fn is_locked(&self, mailbox: MailboxId) -> bool {
        self.held.lock().unwrap().contains(&mailbox)
    }
}

impl MailboxLock {
    pub fn mailbox(&self) -> MailboxId {
        self.mailbox
    }
}

impl Drop for MailboxLock {
    fn drop(&mut self) {
        self.held.lock().unwrap().remove(&self.mailbox);
    }
}
