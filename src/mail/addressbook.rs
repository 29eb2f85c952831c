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

//! Classification of addresses as local or not, and management of the local
//! address space.

use std::fs;
use std::path::Path;

use log::info;
use serde::Deserialize;

use super::address::Address;
use super::store::{self, MailboxId, StoreRef};
use crate::support::error::Error;

/// What an address means to this server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The domain is not one of ours.
    NonLocal,
    /// The domain is ours, but nobody has this address.
    LocalUnknown,
    /// The address belongs to the given mailbox.
    Local(MailboxId),
}

impl Resolution {
    pub fn is_local(self) -> bool {
        !matches!(self, Self::NonLocal)
    }

    pub fn mailbox(self) -> Option<MailboxId> {
        match self {
            Self::Local(mailbox) => Some(mailbox),
            Self::NonLocal | Self::LocalUnknown => None,
        }
    }
}

/// Resolves `address` using `cxn`, which may be a transaction.
pub fn resolve(
    cxn: &rusqlite::Connection,
    address: &Address,
) -> Result<Resolution, Error> {
    let Some(domain_name) = address.ascii_domain() else {
        return Ok(Resolution::NonLocal);
    };

    let Some(domain) = store::find_domain(cxn, &domain_name)? else {
        return Ok(Resolution::NonLocal);
    };

    let local_part = address.normalized_local_part();
    Ok(
        match store::find_address_mailbox(cxn, &local_part, domain.id)? {
            Some(mailbox) => Resolution::Local(mailbox),
            None => Resolution::LocalUnknown,
        },
    )
}

#[derive(Clone)]
pub struct Addressbook {
    store: StoreRef,
}

impl Addressbook {
    pub fn new(store: StoreRef) -> Self {
        Self { store }
    }

    pub fn lookup(&self, address: &Address) -> Result<Resolution, Error> {
        let mut store = self.store.borrow_mut();
        let tx = store.read_tx()?;
        resolve(&tx, address)
    }

    /// Makes `domain` local if it is not already.
    pub fn ensure_domain(&self, domain: &str) -> Result<(), Error> {
        let name = ascii_domain_or_err(domain)?;
        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;
        store::ensure_domain(&tx, &name)?;
        tx.commit()?;
        Ok(())
    }

    /// Routes `address`, whose domain must already be local, to `mailbox`.
    pub fn add_address(
        &self,
        address: &Address,
        mailbox: MailboxId,
    ) -> Result<(), Error> {
        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;
        add_address_in(&tx, address, mailbox)?;
        tx.commit()?;
        Ok(())
    }

    /// Removes `address`. Returns whether it existed.
    pub fn remove_address(&self, address: &Address) -> Result<bool, Error> {
        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;
        let name = ascii_domain_or_err(address.domain())?;
        let domain =
            store::find_domain(&tx, &name)?.ok_or(Error::DomainNotFound)?;
        let removed = store::delete_address(
            &tx,
            &address.normalized_local_part(),
            domain.id,
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Imports the mailboxes and addresses in the TOML file at `path`.
    ///
    /// Entries whose addresses already exist are merged into the mailbox
    /// owning the first such address; nothing is ever removed. Domains of
    /// listed addresses are created as needed.
    pub fn import_seed_file(&self, path: &Path) -> Result<(), Error> {
        let text = fs::read_to_string(path)?;
        let seed: SeedFile = toml::from_str(&text).map_err(|e| {
            Error::BadAddressBook(format!("{}: {}", path.display(), e))
        })?;
        self.import_seed(&seed)
    }

    fn import_seed(&self, seed: &SeedFile) -> Result<(), Error> {
        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;

        for entry in &seed.mailbox {
            let addresses = entry
                .addresses
                .iter()
                .map(|a| {
                    Address::parse(a)
                        .map_err(|e| Error::BadAddressBook(format!("{a}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;

            for address in &addresses {
                let domain = ascii_domain_or_err(address.domain())?;
                store::ensure_domain(&tx, &domain)?;
            }

            let mut existing = None;
            for address in &addresses {
                if let Some(mailbox) = resolve(&tx, address)?.mailbox() {
                    existing = Some(mailbox);
                    break;
                }
            }

            let mailbox = match existing {
                Some(mailbox) => {
                    if let Some(ref hash) = entry.password_hash {
                        store::set_password_hash(&tx, mailbox, hash)?;
                    }
                    mailbox
                },
                None => {
                    info!(
                        "Creating mailbox {:?} from address book",
                        entry.display_name,
                    );
                    store::create_mailbox(
                        &tx,
                        &entry.display_name,
                        entry.password_hash.as_deref().unwrap_or(NO_PASSWORD),
                    )?
                },
            };

            for address in &addresses {
                match resolve(&tx, address)? {
                    Resolution::LocalUnknown => {
                        add_address_in(&tx, address, mailbox)?;
                    },
                    Resolution::Local(_) | Resolution::NonLocal => (),
                }
            }
        }

        tx.commit()?;
        Ok(())
    }
}

/// A password hash which never verifies.
pub const NO_PASSWORD: &str = "!";

#[derive(Deserialize, Debug, Default)]
struct SeedFile {
    #[serde(default)]
    mailbox: Vec<SeedMailbox>,
}

#[derive(Deserialize, Debug)]
struct SeedMailbox {
    display_name: String,
    /// An encoded Argon2id hash.
    #[serde(default)]
    password_hash: Option<String>,
    #[serde(default)]
    addresses: Vec<String>,
}

fn add_address_in(
    cxn: &rusqlite::Connection,
    address: &Address,
    mailbox: MailboxId,
) -> Result<(), Error> {
    let name = ascii_domain_or_err(address.domain())?;
    let domain =
        store::find_domain(cxn, &name)?.ok_or(Error::DomainNotFound)?;
    store::create_address(
        cxn,
        &address.normalized_local_part(),
        domain.id,
        mailbox,
    )
}

fn ascii_domain_or_err(domain: &str) -> Result<String, Error> {
    super::address::ascii_domain(domain).ok_or(Error::DomainNotFound)
}
