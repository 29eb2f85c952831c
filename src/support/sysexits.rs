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

//! Process exit statuses following `sysexits.h`.
//!
//! The administrative commands and the server startup path report failures
//! through these so that wrappers and init systems can tell configuration
//! mistakes apart from transient conditions.

use std::io;

use super::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_OK: Sysexit = Sysexit(0);
pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_DATAERR: Sysexit = Sysexit(65);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_NOUSER: Sysexit = Sysexit(67);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_OSERR: Sysexit = Sysexit(71);
pub const EX_CANTCREAT: Sysexit = Sysexit(73);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_NOPERM: Sysexit = Sysexit(77);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    /// Picks the exit status that best describes `e`.
    pub fn for_error(e: &Error) -> Self {
        match *e {
            Error::MailboxNotFound
            | Error::DomainNotFound
            | Error::UnknownLocalAddress(_) => EX_NOUSER,
            Error::AddressInUse | Error::DomainExists => EX_DATAERR,
            Error::UnsupportedSchemaVersion
            | Error::TlsSource(_)
            | Error::BadAddressBook(_) => EX_CONFIG,
            Error::Io(ref e) if io::ErrorKind::PermissionDenied == e.kind() => {
                EX_NOPERM
            },
            Error::Io(_) => EX_IOERR,
            Error::Sqlite(_) => EX_UNAVAILABLE,
            Error::Dns(_) => EX_TEMPFAIL,
            _ => EX_SOFTWARE,
        }
    }
}
