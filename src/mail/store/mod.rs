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

//! The relational store.
//!
//! All persistent state other than message content lives in a single SQLite
//! database. Data-access functions take a plain `rusqlite::Connection` so that
//! they can run either directly or inside a `rusqlite::Transaction` opened by
//! the caller; anything that needs several statements to be atomic opens a
//! transaction with `read_tx` or `write_tx` and passes that down.

mod directory;
mod mails;
mod migrations;
mod types;

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

pub use self::directory::*;
pub use self::mails::*;
pub use self::types::*;
use crate::support::{error::Error, log_prefix::LogPrefix};

static MIGRATION_V1: &str = include_str!("store.v1.sql");

/// The store as shared by the components of a running server.
///
/// The server runs on a single thread; a borrow is never held across an
/// await point.
pub type StoreRef = Rc<RefCell<Store>>;

/// An open connection to the database.
pub struct Store {
    cxn: rusqlite::Connection,
}

impl Store {
    /// Opens (creating if necessary) the database at `path` and brings its
    /// schema up to date.
    pub fn open(
        log_prefix: &LogPrefix,
        path: &Path,
        journal_mode: &str,
    ) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        cxn.pragma_update(None, "foreign_keys", true)?;
        if !journal_mode.is_empty() {
            cxn.pragma_update(None, "journal_mode", journal_mode)?;
        }
        cxn.busy_timeout(Duration::from_secs(10))?;

        migrations::apply_migrations(
            log_prefix,
            &mut cxn,
            "mailroom",
            &[MIGRATION_V1],
        )?;

        Ok(Self { cxn })
    }

    /// Opens a private in-memory database. Used by tests.
    #[cfg(test)]
    pub fn open_memory() -> Self {
        let mut cxn = rusqlite::Connection::open_in_memory().unwrap();
        cxn.pragma_update(None, "foreign_keys", true).unwrap();
        migrations::apply_migrations(
            &LogPrefix::new("test".to_owned()),
            &mut cxn,
            "test",
            &[MIGRATION_V1],
        )
        .unwrap();
        Self { cxn }
    }

    /// Starts a transaction which will only read.
    pub fn read_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.cxn.read_tx()
    }

    /// Starts a transaction which holds the write lock from the start.
    pub fn write_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.cxn.write_tx()
    }
}

trait ConnectionExt {
    fn read_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>>;
    fn write_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>>;
    fn enable_write(&mut self, enabled: bool) -> rusqlite::Result<()>;
}

impl ConnectionExt for rusqlite::Connection {
    fn read_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.enable_write(false)?;
        self.transaction_with_behavior(rusqlite::TransactionBehavior::Deferred)
    }

    fn write_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.enable_write(true)?;
        self.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
    }

    #[cfg(debug_assertions)]
    fn enable_write(&mut self, enabled: bool) -> rusqlite::Result<()> {
        // PRAGMA doesn't actually support templates, so switch the whole query
        // string based on `enabled`.
        self.execute(
            if enabled {
                "PRAGMA query_only = false"
            } else {
                "PRAGMA query_only = true"
            },
            (),
        )?;
        Ok(())
    }

    #[cfg(not(debug_assertions))]
    fn enable_write(&mut self, _: bool) -> rusqlite::Result<()> {
        Ok(())
    }
}
