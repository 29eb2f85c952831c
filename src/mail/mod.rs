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

//! The protocol-independent part of the server: addresses, storage, and the
//! components that move mail between them.

pub mod address;
pub mod addressbook;
pub mod authenticator;
pub mod blobs;
pub mod cleaner;
pub mod envelope;
pub mod inboxer;
pub mod mailman;
pub mod store;

use std::cell::RefCell;
use std::rc::Rc;

use self::addressbook::Addressbook;
use self::authenticator::Authenticator;
use self::blobs::BlobStore;
use self::cleaner::Cleaner;
use self::inboxer::Inboxer;
use self::mailman::Mailman;
use self::store::{Store, StoreRef};
use crate::smtp::outbound::queue::QueueSignal;
use crate::support::buffer::Cache;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

/// Everything a protocol session needs from the rest of the server.
///
/// One instance is shared by every task on the server thread.
pub struct Services {
    pub hostname: String,
    /// The maximum message size in bytes, 0 for unlimited.
    pub max_message_size: u64,
    pub store: StoreRef,
    pub blobs: Rc<BlobStore>,
    pub cache: Cache,
    pub addressbook: Addressbook,
    pub authenticator: Authenticator,
    pub mailman: Mailman,
    pub inboxer: Inboxer,
    pub cleaner: Cleaner,
}

impl Services {
    /// Opens the store and data directories named by `config`, creating
    /// them as needed.
    pub fn open(
        log_prefix: &LogPrefix,
        config: &SystemConfig,
        queue: QueueSignal,
    ) -> Result<Self, Error> {
        let storage = &config.storage;
        let store = Store::open(
            log_prefix,
            &storage.database.filename,
            &storage.database.journal_mode,
        )?;

        let blobs = BlobStore::new(storage.blobs.folder_name.clone());
        blobs.init()?;
        let cache = Cache::new(
            storage.cache.folder_name.clone(),
            storage.cache.memory_limit,
        );
        cache.init()?;

        Self::new(config, Rc::new(RefCell::new(store)), blobs, cache, queue)
    }

    fn new(
        config: &SystemConfig,
        store: StoreRef,
        blobs: BlobStore,
        cache: Cache,
        queue: QueueSignal,
    ) -> Result<Self, Error> {
        let blobs = Rc::new(blobs);
        let authenticator = Authenticator::new(
            Rc::clone(&store),
            &config.crypto.argon2,
            config.security.auth.min_duration,
        )?;

        Ok(Self {
            hostname: config.hostname(),
            max_message_size: config.mail.size,
            addressbook: Addressbook::new(Rc::clone(&store)),
            authenticator,
            mailman: Mailman::new(
                Rc::clone(&store),
                Rc::clone(&blobs),
                queue,
            ),
            inboxer: Inboxer::new(Rc::clone(&store), Rc::clone(&blobs)),
            cleaner: Cleaner::new(Rc::clone(&store), Rc::clone(&blobs)),
            store,
            blobs,
            cache,
        })
    }

    /// Makes sure every configured domain is local and imports the address
    /// book seed file, if any.
    pub fn prepare_addressbook(
        &self,
        config: &SystemConfig,
    ) -> Result<(), Error> {
        for domain in &config.general.domains {
            self.addressbook.ensure_domain(domain)?;
        }

        if let Some(ref path) = config.addressbook.filename {
            self.addressbook.import_seed_file(path)?;
        }

        Ok(())
    }
}
