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

//! Domains, mailboxes, credentials, and addresses.

use rusqlite::OptionalExtension as _;

use super::types::*;
use crate::support::error::Error;

/// Finds the domain whose ASCII name is `name`.
pub fn find_domain(
    cxn: &rusqlite::Connection,
    name: &str,
) -> Result<Option<Domain>, Error> {
    cxn.prepare_cached("SELECT * FROM `domain` WHERE `name` = ?")?
        .query_row((name,), from_row)
        .optional()
        .map_err(Into::into)
}

/// Creates a new domain, failing with `DomainExists` if it is already known.
pub fn create_domain(
    cxn: &rusqlite::Connection,
    name: &str,
) -> Result<DomainId, Error> {
    if find_domain(cxn, name)?.is_some() {
        return Err(Error::DomainExists);
    }

    cxn.execute("INSERT INTO `domain` (`name`) VALUES (?)", (name,))?;
    Ok(DomainId(cxn.last_insert_rowid()))
}

/// Returns the ID of the named domain, creating it if needed.
pub fn ensure_domain(
    cxn: &rusqlite::Connection,
    name: &str,
) -> Result<DomainId, Error> {
    match find_domain(cxn, name)? {
        Some(domain) => Ok(domain.id),
        None => create_domain(cxn, name),
    }
}

/// Deletes the named domain along with all its addresses.
pub fn delete_domain(
    cxn: &rusqlite::Connection,
    name: &str,
) -> Result<(), Error> {
    if 0 == cxn.execute("DELETE FROM `domain` WHERE `name` = ?", (name,))? {
        return Err(Error::DomainNotFound);
    }

    Ok(())
}

pub fn list_domains(cxn: &rusqlite::Connection) -> Result<Vec<Domain>, Error> {
    cxn.prepare_cached("SELECT * FROM `domain` ORDER BY `name`")?
        .query_map((), from_row)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// Creates a mailbox with the given initial password hash.
pub fn create_mailbox(
    cxn: &rusqlite::Connection,
    display_name: &str,
    password_hash: &str,
) -> Result<MailboxId, Error> {
    cxn.execute(
        "INSERT INTO `mailbox` (`display_name`) VALUES (?)",
        (display_name,),
    )?;
    let id = MailboxId(cxn.last_insert_rowid());
    cxn.execute(
        "INSERT INTO `mailbox_credential` \
         (`mailbox_id`, `updated_at`, `password_hash`) VALUES (?, ?, ?)",
        (id, UnixTimestamp::now(), password_hash),
    )?;
    Ok(id)
}

pub fn fetch_mailbox(
    cxn: &rusqlite::Connection,
    id: MailboxId,
) -> Result<Mailbox, Error> {
    cxn.prepare_cached("SELECT * FROM `mailbox` WHERE `id` = ?")?
        .query_row((id,), from_row)
        .optional()?
        .ok_or(Error::MailboxNotFound)
}

pub fn list_mailboxes(
    cxn: &rusqlite::Connection,
) -> Result<Vec<Mailbox>, Error> {
    cxn.prepare_cached("SELECT * FROM `mailbox` ORDER BY `id`")?
        .query_map((), from_row)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub fn set_password_hash(
    cxn: &rusqlite::Connection,
    mailbox: MailboxId,
    password_hash: &str,
) -> Result<(), Error> {
    let updated = cxn.execute(
        "INSERT INTO `mailbox_credential` \
         (`mailbox_id`, `updated_at`, `password_hash`) VALUES (?, ?, ?) \
         ON CONFLICT DO UPDATE SET \
         `updated_at` = excluded.`updated_at`, \
         `password_hash` = excluded.`password_hash`",
        (mailbox, UnixTimestamp::now(), password_hash),
    );

    match updated {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if rusqlite::ErrorCode::ConstraintViolation == e.code =>
        {
            Err(Error::MailboxNotFound)
        },
        Err(e) => Err(e.into()),
    }
}

pub fn fetch_credential(
    cxn: &rusqlite::Connection,
    mailbox: MailboxId,
) -> Result<Option<MailboxCredential>, Error> {
    cxn.prepare_cached(
        "SELECT * FROM `mailbox_credential` WHERE `mailbox_id` = ?",
    )?
    .query_row((mailbox,), from_row)
    .optional()
    .map_err(Into::into)
}

/// Maps `local_part` (already normalised) in `domain` to `mailbox`.
pub fn create_address(
    cxn: &rusqlite::Connection,
    local_part: &str,
    domain: DomainId,
    mailbox: MailboxId,
) -> Result<(), Error> {
    if find_address_mailbox(cxn, local_part, domain)?.is_some() {
        return Err(Error::AddressInUse);
    }

    fetch_mailbox(cxn, mailbox)?;
    cxn.execute(
        "INSERT INTO `address` (`local_part`, `domain_id`, `mailbox_id`) \
         VALUES (?, ?, ?)",
        (local_part, domain, mailbox),
    )?;
    Ok(())
}

/// Removes an address. Returns whether it existed.
pub fn delete_address(
    cxn: &rusqlite::Connection,
    local_part: &str,
    domain: DomainId,
) -> Result<bool, Error> {
    Ok(0 != cxn.execute(
        "DELETE FROM `address` WHERE `local_part` = ? AND `domain_id` = ?",
        (local_part, domain),
    )?)
}

pub fn find_address_mailbox(
    cxn: &rusqlite::Connection,
    local_part: &str,
    domain: DomainId,
) -> Result<Option<MailboxId>, Error> {
    cxn.prepare_cached(
        "SELECT `mailbox_id` FROM `address` \
         WHERE `local_part` = ? AND `domain_id` = ?",
    )?
    .query_row((local_part, domain), from_single)
    .optional()
    .map_err(Into::into)
}

/// Lists the addresses of `mailbox` as `local@domain` strings.
pub fn list_addresses(
    cxn: &rusqlite::Connection,
    mailbox: MailboxId,
) -> Result<Vec<String>, Error> {
    cxn.prepare_cached(
        "SELECT `address`.`local_part` || '@' || `domain`.`name` \
         FROM `address` JOIN `domain` ON `address`.`domain_id` = `domain`.`id` \
         WHERE `address`.`mailbox_id` = ? \
         ORDER BY `domain`.`name`, `address`.`local_part`",
    )?
    .query_map((mailbox,), from_single)?
    .collect::<Result<Vec<_>, _>>()
    .map_err(Into::into)
}

#[cfg(test)]
mod test {
    use super::super::Store;
    use super::*;

    #[test]
    fn domain_crud() {
        let mut store = Store::open_memory();
        let tx = store.write_tx().unwrap();

        let example = create_domain(&tx, "example.com").unwrap();
        assert_matches!(
            Err(Error::DomainExists),
            create_domain(&tx, "example.com"),
        );
        assert_eq!(example, ensure_domain(&tx, "example.com").unwrap());
        let org = ensure_domain(&tx, "example.org").unwrap();
        assert_ne!(example, org);

        assert_eq!(
            Some(Domain {
                id: example,
                name: "example.com".to_owned(),
            }),
            find_domain(&tx, "example.com").unwrap(),
        );
        assert_eq!(None, find_domain(&tx, "example.net").unwrap());
        assert_eq!(
            vec!["example.com", "example.org"],
            list_domains(&tx)
                .unwrap()
                .into_iter()
                .map(|d| d.name)
                .collect::<Vec<_>>(),
        );

        delete_domain(&tx, "example.org").unwrap();
        assert_matches!(
            Err(Error::DomainNotFound),
            delete_domain(&tx, "example.org"),
        );
    }

    #[test]
    fn mailbox_and_address_crud() {
        let mut store = Store::open_memory();
        let tx = store.write_tx().unwrap();

        let domain = create_domain(&tx, "example.com").unwrap();
        let alice = create_mailbox(&tx, "Alice", "hash-a").unwrap();
        let bob = create_mailbox(&tx, "Bob", "hash-b").unwrap();

        assert_eq!("Alice", fetch_mailbox(&tx, alice).unwrap().display_name);
        assert_matches!(
            Err(Error::MailboxNotFound),
            fetch_mailbox(&tx, MailboxId(999)),
        );
        assert_eq!(2, list_mailboxes(&tx).unwrap().len());

        assert_eq!(
            "hash-a",
            fetch_credential(&tx, alice).unwrap().unwrap().password_hash,
        );
        set_password_hash(&tx, alice, "hash-a2").unwrap();
        assert_eq!(
            "hash-a2",
            fetch_credential(&tx, alice).unwrap().unwrap().password_hash,
        );
        assert_matches!(
            Err(Error::MailboxNotFound),
            set_password_hash(&tx, MailboxId(999), "x"),
        );

        create_address(&tx, "alice", domain, alice).unwrap();
        create_address(&tx, "postmaster", domain, alice).unwrap();
        create_address(&tx, "bob", domain, bob).unwrap();
        assert_matches!(
            Err(Error::AddressInUse),
            create_address(&tx, "alice", domain, bob),
        );
        assert_matches!(
            Err(Error::MailboxNotFound),
            create_address(&tx, "carol", domain, MailboxId(999)),
        );

        assert_eq!(
            Some(alice),
            find_address_mailbox(&tx, "alice", domain).unwrap(),
        );
        assert_eq!(None, find_address_mailbox(&tx, "carol", domain).unwrap());
        assert_eq!(
            vec!["alice@example.com", "postmaster@example.com"],
            list_addresses(&tx, alice).unwrap(),
        );

        assert!(delete_address(&tx, "postmaster", domain).unwrap());
        assert!(!delete_address(&tx, "postmaster", domain).unwrap());

        // Deleting the domain takes its addresses with it.
        delete_domain(&tx, "example.com").unwrap();
        assert!(list_addresses(&tx, alice).unwrap().is_empty());
    }
}
