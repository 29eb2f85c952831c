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

use std::io;

use thiserror::Error;

use crate::mail::address::Address;

/// Errors from the storage and delivery layers.
///
/// Protocol-level problems (bad syntax, bad sequence) never reach this type;
/// the session handlers turn those into replies directly.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Mail not found")]
    MailNotFound,
    #[error("Mailbox not found")]
    MailboxNotFound,
    #[error("Domain not found")]
    DomainNotFound,
    #[error("Address already in use")]
    AddressInUse,
    #[error("Domain already exists")]
    DomainExists,
    #[error("Unknown local address: {0}")]
    UnknownLocalAddress(Address),
    #[error("Database schema is newer than this version of Mailroom")]
    UnsupportedSchemaVersion,
    #[error("Password hashing failed: {0}")]
    PasswordHash(#[from] argon2::Error),
    #[error("Blocking task failed: {0}")]
    BlockingTask(#[from] tokio::task::JoinError),
    #[error("DNS lookup failed: {0}")]
    Dns(String),
    #[error("Invalid address book: {0}")]
    BadAddressBook(String),
    #[error("Invalid TLS certificate source: {0}")]
    TlsSource(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}
