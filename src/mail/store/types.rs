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

//! Bindings for the model types to `rusqlite`, plus the row types of the
//! store.

use std::fmt;
use std::str::FromStr;

use chrono::prelude::*;
use rand::Rng;
use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef,
};

macro_rules! transparent_to_sql {
    ($t:ident) => {
        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }
    };
}

macro_rules! transparent_from_sql {
    ($t:ident) => {
        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                FromSql::column_result(value).map(Self)
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub i64);
transparent_to_sql!(DomainId);
transparent_from_sql!(DomainId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxId(pub i64);
transparent_to_sql!(MailboxId);
transparent_from_sql!(MailboxId);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecipientId(pub i64);
transparent_to_sql!(RecipientId);
transparent_from_sql!(RecipientId);

/// The identifier of a mail, which is also the name of its blob.
///
/// This is a random 128-bit value, always represented as 32 lower-case hex
/// digits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailId(pub u128);

impl MailId {
    pub fn random() -> Self {
        Self(rand::rngs::OsRng.gen())
    }
}

impl fmt::Display for MailId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for MailId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MailId({self})")
    }
}

impl FromStr for MailId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if 32 != s.len()
            || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(());
        }

        u128::from_str_radix(s, 16).map(Self).map_err(|_| ())
    }
}

impl ToSql for MailId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for MailId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::from_str(s).map_err(|()| FromSqlError::InvalidType)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(pub DateTime<Utc>);

impl UnixTimestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl ToSql for UnixTimestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.timestamp()))
    }
}

impl FromSql for UnixTimestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        DateTime::<Utc>::from_timestamp(inner, 0)
            .ok_or(FromSqlError::OutOfRange(inner))
            .map(Self)
    }
}

/// The delivery state of one recipient of one mail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RecipientStatus {
    /// Terminal permanent failure.
    Failed = 0,
    /// Terminal success: accepted by the remote server, or retrieved and
    /// deleted by the mailbox owner.
    Delivered = 1,
    /// Local, visible to POP3.
    Inboxed = 2,
    /// Outbound, waiting for the courier.
    Pending = 3,
}

impl ToSql for RecipientStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as u8))
    }
}

impl FromSql for RecipientStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match u8::column_result(value)? {
            0 => Ok(Self::Failed),
            1 => Ok(Self::Delivered),
            2 => Ok(Self::Inboxed),
            3 => Ok(Self::Pending),
            n => Err(FromSqlError::OutOfRange(n.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub id: DomainId,
    /// Lower-case ASCII form.
    pub name: String,
}

impl FromRow for Domain {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub id: MailboxId,
    pub display_name: String,
}

impl FromRow for Mailbox {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            display_name: row.get("display_name")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MailboxCredential {
    pub mailbox_id: MailboxId,
    pub updated_at: UnixTimestamp,
    pub password_hash: String,
}

impl FromRow for MailboxCredential {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            mailbox_id: row.get("mailbox_id")?,
            updated_at: row.get("updated_at")?,
            password_hash: row.get("password_hash")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Mail {
    pub id: MailId,
    pub received_at: UnixTimestamp,
    pub deleted_at: Option<UnixTimestamp>,
    /// Empty for the null reverse-path.
    pub return_path: String,
    pub size: u64,
    pub attempt_count: u32,
    pub last_attempted_at: Option<UnixTimestamp>,
}

impl FromRow for Mail {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            received_at: row.get("received_at")?,
            deleted_at: row.get("deleted_at")?,
            return_path: row.get("return_path")?,
            size: row.get("size")?,
            attempt_count: row.get("attempt_count")?,
            last_attempted_at: row.get("last_attempted_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: RecipientId,
    pub mail_id: MailId,
    pub mailbox_id: Option<MailboxId>,
    pub forward_path: String,
    pub status: RecipientStatus,
}

impl FromRow for Recipient {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            mail_id: row.get("mail_id")?,
            mailbox_id: row.get("mailbox_id")?,
            forward_path: row.get("forward_path")?,
            status: row.get("status")?,
        })
    }
}

pub fn from_row<T: FromRow>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub fn from_single<T: FromSql>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    row.get(0)
}

pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

macro_rules! from_row_tuple {
    ($($ix:tt: $t:ident),*) => {
        impl<$($t: FromSql,)*> FromRow
        for ($($t,)*) {
            fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
                Ok(($(row.get($ix)?,)*))
            }
        }
    }
}

from_row_tuple!(0: A);
from_row_tuple!(0: A, 1: B);
from_row_tuple!(0: A, 1: B, 2: C);
from_row_tuple!(0: A, 1: B, 2: C, 3: D);
