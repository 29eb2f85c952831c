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

//! Mails and their recipients.

use rusqlite::OptionalExtension as _;

use super::types::*;
use crate::support::error::Error;

pub fn insert_mail(
    cxn: &rusqlite::Connection,
    id: MailId,
    received_at: UnixTimestamp,
    return_path: &str,
    size: u64,
) -> Result<(), Error> {
    cxn.execute(
        "INSERT INTO `mail` (`id`, `received_at`, `return_path`, `size`) \
         VALUES (?, ?, ?, ?)",
        (id, received_at, return_path, size),
    )?;
    Ok(())
}

pub fn insert_recipient(
    cxn: &rusqlite::Connection,
    mail: MailId,
    mailbox: Option<MailboxId>,
    forward_path: &str,
    status: RecipientStatus,
) -> Result<RecipientId, Error> {
    cxn.execute(
        "INSERT INTO `recipient` \
         (`mail_id`, `mailbox_id`, `forward_path`, `status`) \
         VALUES (?, ?, ?, ?)",
        (mail, mailbox, forward_path, status),
    )?;
    Ok(RecipientId(cxn.last_insert_rowid()))
}

pub fn fetch_mail(
    cxn: &rusqlite::Connection,
    id: MailId,
) -> Result<Mail, Error> {
    cxn.prepare_cached("SELECT * FROM `mail` WHERE `id` = ?")?
        .query_row((id,), from_row)
        .optional()?
        .ok_or(Error::MailNotFound)
}

/// Fetches the recipients of `mail`, optionally only those in `status`, in
/// insertion order.
pub fn fetch_recipients(
    cxn: &rusqlite::Connection,
    mail: MailId,
    status: Option<RecipientStatus>,
) -> Result<Vec<Recipient>, Error> {
    cxn.prepare_cached(
        "SELECT * FROM `recipient` \
         WHERE `mail_id` = ?1 AND (?2 IS NULL OR `status` = ?2) \
         ORDER BY `id`",
    )?
    .query_map((mail, status), from_row)?
    .collect::<Result<Vec<_>, _>>()
    .map_err(Into::into)
}

/// Fetches up to `limit` live mails which have at least one pending
/// recipient, ordered by `(last_attempted_at NULLS FIRST, attempt_count,
/// received_at)`.
pub fn fetch_pending_mails(
    cxn: &rusqlite::Connection,
    limit: usize,
) -> Result<Vec<Mail>, Error> {
    cxn.prepare_cached(
        "SELECT * FROM `mail` \
         WHERE `deleted_at` IS NULL AND EXISTS (\
           SELECT 1 FROM `recipient` \
           WHERE `recipient`.`mail_id` = `mail`.`id` \
           AND `recipient`.`status` = ?1\
         ) \
         ORDER BY `last_attempted_at` ASC NULLS FIRST, \
                  `attempt_count` ASC, `received_at` ASC \
         LIMIT ?2",
    )?
    .query_map((RecipientStatus::Pending, limit), from_row)?
    .collect::<Result<Vec<_>, _>>()
    .map_err(Into::into)
}

/// Increments the attempt counter of `mail` and sets its last attempt time.
///
/// Returns the new attempt count.
pub fn record_attempt(
    cxn: &rusqlite::Connection,
    mail: MailId,
    at: UnixTimestamp,
) -> Result<u32, Error> {
    cxn.prepare_cached(
        "UPDATE `mail` SET \
         `attempt_count` = `attempt_count` + 1, `last_attempted_at` = ? \
         WHERE `id` = ? \
         RETURNING `attempt_count`",
    )?
    .query_row((at, mail), from_single)
    .optional()?
    .ok_or(Error::MailNotFound)
}

/// Changes the status of a recipient.
///
/// Terminal statuses are never changed.
pub fn set_recipient_status(
    cxn: &rusqlite::Connection,
    recipient: RecipientId,
    status: RecipientStatus,
) -> Result<(), Error> {
    cxn.prepare_cached(
        "UPDATE `recipient` SET `status` = ? \
         WHERE `id` = ? AND `status` NOT IN (?, ?)",
    )?
    .execute((
        status,
        recipient,
        RecipientStatus::Failed,
        RecipientStatus::Delivered,
    ))?;
    Ok(())
}

/// Moves every pending recipient of `mail` to failed.
///
/// Returns the number of recipients changed.
pub fn fail_pending_recipients(
    cxn: &rusqlite::Connection,
    mail: MailId,
) -> Result<usize, Error> {
    cxn.prepare_cached(
        "UPDATE `recipient` SET `status` = ? \
         WHERE `mail_id` = ? AND `status` = ?",
    )?
    .execute((RecipientStatus::Failed, mail, RecipientStatus::Pending))
    .map_err(Into::into)
}

/// Fetches the live mails which are inboxed in `mailbox`, oldest first.
pub fn fetch_inboxed_mails(
    cxn: &rusqlite::Connection,
    mailbox: MailboxId,
) -> Result<Vec<Mail>, Error> {
    cxn.prepare_cached(
        "SELECT * FROM `mail` \
         WHERE `deleted_at` IS NULL AND EXISTS (\
           SELECT 1 FROM `recipient` \
           WHERE `recipient`.`mail_id` = `mail`.`id` \
           AND `recipient`.`mailbox_id` = ?1 \
           AND `recipient`.`status` = ?2\
         ) \
         ORDER BY `received_at`, `id`",
    )?
    .query_map((mailbox, RecipientStatus::Inboxed), from_row)?
    .collect::<Result<Vec<_>, _>>()
    .map_err(Into::into)
}

/// Moves every recipient of `mail` in `mailbox` from inboxed to delivered.
pub fn mark_inboxed_delivered(
    cxn: &rusqlite::Connection,
    mail: MailId,
    mailbox: MailboxId,
) -> Result<usize, Error> {
    cxn.prepare_cached(
        "UPDATE `recipient` SET `status` = ? \
         WHERE `mail_id` = ? AND `mailbox_id` = ? AND `status` = ?",
    )?
    .execute((
        RecipientStatus::Delivered,
        mail,
        mailbox,
        RecipientStatus::Inboxed,
    ))
    .map_err(Into::into)
}

/// Finds live mails all of whose recipients are in a terminal status.
pub fn fetch_resolved_mails(
    cxn: &rusqlite::Connection,
) -> Result<Vec<MailId>, Error> {
    cxn.prepare_cached(
        "SELECT `id` FROM `mail` \
         WHERE `deleted_at` IS NULL AND NOT EXISTS (\
           SELECT 1 FROM `recipient` \
           WHERE `recipient`.`mail_id` = `mail`.`id` \
           AND `recipient`.`status` NOT IN (?, ?)\
         ) \
         ORDER BY `received_at`",
    )?
    .query_map(
        (RecipientStatus::Failed, RecipientStatus::Delivered),
        from_single,
    )?
    .collect::<Result<Vec<_>, _>>()
    .map_err(Into::into)
}

pub fn mark_mail_deleted(
    cxn: &rusqlite::Connection,
    mail: MailId,
    at: UnixTimestamp,
) -> Result<(), Error> {
    cxn.prepare_cached(
        "UPDATE `mail` SET `deleted_at` = ? \
         WHERE `id` = ? AND `deleted_at` IS NULL",
    )?
    .execute((at, mail))?;
    Ok(())
}
