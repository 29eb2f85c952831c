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

//! The POP3 view of a mailbox.
//!
//! An `Inbox` is a snapshot of the mails inboxed for a mailbox at the moment
//! it was taken. Deletions are only recorded in the snapshot until
//! `Inboxer::commit` writes them back, so a session that ends without `QUIT`
//! leaves the mailbox unchanged.

use std::fs;
use std::io;
use std::rc::Rc;

use log::info;

use super::blobs::BlobStore;
use super::store::{self, MailId, MailboxId, StoreRef};
use crate::support::error::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboxEntry {
    pub id: MailId,
    pub size: u64,
    marked: bool,
}

/// Indices are 0-based; the POP3 layer translates message numbers.
#[derive(Clone, Debug)]
pub struct Inbox {
    mailbox: MailboxId,
    entries: Vec<InboxEntry>,
}

impl Inbox {
    pub fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    /// The number of mails in the snapshot, marked or not.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn entry(&self, ix: usize) -> Option<&InboxEntry> {
        self.entries.get(ix)
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, &InboxEntry)> + '_ {
        self.entries.iter().enumerate()
    }

    /// Marks entry `ix` for deletion. Returns `false` if there is no such
    /// entry.
    pub fn mark(&mut self, ix: usize) -> bool {
        match self.entries.get_mut(ix) {
            Some(entry) => {
                entry.marked = true;
                true
            },
            None => false,
        }
    }

    pub fn is_marked(&self, ix: usize) -> bool {
        self.entries.get(ix).map_or(false, |e| e.marked)
    }

    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.marked = false;
        }
    }

    /// The number of unmarked mails.
    pub fn effective_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.marked).count()
    }

    /// The total size of unmarked mails.
    pub fn effective_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.marked)
            .map(|e| e.size)
            .sum()
    }
}

pub struct Inboxer {
    store: StoreRef,
    blobs: Rc<BlobStore>,
}

impl Inboxer {
    pub fn new(store: StoreRef, blobs: Rc<BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Snapshots the inboxed mails of `mailbox`, oldest first.
    pub fn inbox(&self, mailbox: MailboxId) -> Result<Inbox, Error> {
        let mut store = self.store.borrow_mut();
        let tx = store.read_tx()?;
        let entries = store::fetch_inboxed_mails(&tx, mailbox)?
            .into_iter()
            .map(|mail| InboxEntry {
                id: mail.id,
                size: mail.size,
                marked: false,
            })
            .collect();

        Ok(Inbox { mailbox, entries })
    }

    /// Moves every marked mail of `inbox` out of the mailbox.
    ///
    /// Either all marked mails are removed or none are.
    pub fn commit(&self, inbox: &Inbox) -> Result<(), Error> {
        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;
        let mut removed = 0;
        for entry in inbox.entries.iter().filter(|e| e.marked) {
            removed +=
                store::mark_inboxed_delivered(&tx, entry.id, inbox.mailbox)?;
        }
        tx.commit()?;

        if removed > 0 {
            info!("Removed {removed} mail(s) from mailbox {}", inbox.mailbox);
        }
        Ok(())
    }

    pub fn open(&self, entry: &InboxEntry) -> io::Result<fs::File> {
        self.blobs.open(entry.id)
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::mail::address::Address;
    use crate::mail::envelope::Envelope;
    use crate::mail::store::RecipientStatus;
    use crate::mail::test_fixture::Fixture;

    fn deliver(fixture: &Fixture, content: &[u8]) -> MailId {
        let mut env = Envelope::new(
            "client.test".to_owned(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        env.from = Some(Address::parse("ext@foo.test").unwrap());
        env.to = vec![Address::parse("alice@example.com").unwrap()];
        fixture
            .services
            .mailman
            .deliver(&env, &mut &content[..])
            .unwrap()
    }

    #[test]
    fn snapshot_and_marks() {
        let fixture = Fixture::new();
        let inboxer = &fixture.services.inboxer;
        let a = deliver(&fixture, b"first\r\n");
        let b = deliver(&fixture, b"second message\r\n");

        let mut inbox = inboxer.inbox(fixture.alice).unwrap();
        assert_eq!(2, inbox.count());
        assert_eq!(23, inbox.total_size());
        let ids = inbox.entries().map(|(_, e)| e.id).collect::<Vec<_>>();
        assert!(ids == [a, b] || ids == [b, a]);

        // Later deliveries don't appear in the snapshot
        deliver(&fixture, b"third\r\n");
        assert_eq!(2, inbox.count());

        assert!(inbox.mark(1));
        assert!(!inbox.mark(2));
        assert!(inbox.is_marked(1));
        assert!(!inbox.is_marked(0));
        assert_eq!(1, inbox.effective_count());
        assert_eq!(inbox.entry(0).unwrap().size, inbox.effective_size());

        inbox.reset();
        assert!(!inbox.is_marked(1));
        assert_eq!(2, inbox.effective_count());
        assert_eq!(23, inbox.effective_size());

        let mut content = String::new();
        inboxer
            .open(inbox.entry(0).unwrap())
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert!(content.ends_with("\r\n"));
    }

    #[test]
    fn commit_removes_marked_only() {
        let fixture = Fixture::new();
        let inboxer = &fixture.services.inboxer;
        deliver(&fixture, b"first\r\n");
        deliver(&fixture, b"second\r\n");

        let mut inbox = inboxer.inbox(fixture.alice).unwrap();
        let removed = inbox.entry(0).unwrap().id;
        inbox.mark(0);
        inboxer.commit(&inbox).unwrap();

        let after = inboxer.inbox(fixture.alice).unwrap();
        assert_eq!(1, after.count());
        assert_ne!(removed, after.entry(0).unwrap().id);

        let mut store = fixture.services.store.borrow_mut();
        let tx = store.read_tx().unwrap();
        let recipients = store::fetch_recipients(&tx, removed, None).unwrap();
        assert_eq!(RecipientStatus::Delivered, recipients[0].status);
    }

    #[test]
    fn uncommitted_marks_are_discarded() {
        let fixture = Fixture::new();
        let inboxer = &fixture.services.inboxer;
        deliver(&fixture, b"first\r\n");

        let mut inbox = inboxer.inbox(fixture.alice).unwrap();
        inbox.mark(0);
        drop(inbox);

        assert_eq!(1, inboxer.inbox(fixture.alice).unwrap().count());
    }
}
