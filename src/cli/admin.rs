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

//! The administrative commands.
//!
//! These work directly against the store, so they can be run while the
//! server is running.

use rand::{rngs::OsRng, Rng};

use super::main::{
    AddressSubcommand, DomainSubcommand, MailboxAddSubcommand,
    MailboxPasswdSubcommand, MailboxSubcommand,
};
use crate::mail::{
    address::{self, Address},
    addressbook::{self, Resolution},
    authenticator::hash_password,
    store::{self, Mailbox, MailboxId},
    Services,
};
use crate::smtp::outbound::queue::QueueSignal;
use crate::support::{
    error::Error, log_prefix::LogPrefix, sysexits::*,
    system_config::SystemConfig,
};

pub(super) fn domain(config: SystemConfig, cmd: DomainSubcommand) {
    let services = open(&config);
    match cmd {
        DomainSubcommand::Add { name } => {
            or_die(add_domain(&services, &name));
            println!("Added domain {name}");
        },
        DomainSubcommand::Remove { name } => {
            or_die(remove_domain(&services, &name));
            println!("Removed domain {name}");
        },
        DomainSubcommand::List => {
            for domain in or_die(list_domains(&services)) {
                println!("{domain}");
            }
        },
    }
}

pub(super) fn mailbox(config: SystemConfig, cmd: MailboxSubcommand) {
    let services = open(&config);
    match cmd {
        MailboxSubcommand::Add(cmd) => mailbox_add(&config, &services, cmd),
        MailboxSubcommand::Passwd(cmd) => {
            mailbox_passwd(&config, &services, cmd)
        },
        MailboxSubcommand::List => {
            for (mailbox, addresses) in or_die(list_mailboxes(&services)) {
                println!("{}\t{}", mailbox.id, mailbox.display_name);
                for address in addresses {
                    println!("\t{address}");
                }
            }
        },
    }
}

pub(super) fn address(config: SystemConfig, cmd: AddressSubcommand) {
    let services = open(&config);
    match cmd {
        AddressSubcommand::Add { address, mailbox } => {
            let new = parse_address(&address);
            let existing = parse_address(&mailbox);
            or_die(add_address(&services, &new, &existing));
            println!("Added {new}");
        },
        AddressSubcommand::Remove { address } => {
            let address = parse_address(&address);
            if !or_die(services.addressbook.remove_address(&address)) {
                die!(EX_NOUSER, "No such address: {}", address);
            }
            println!("Removed {address}");
        },
    }
}

fn mailbox_add(
    config: &SystemConfig,
    services: &Services,
    cmd: MailboxAddSubcommand,
) {
    let address = parse_address(&cmd.address);
    let display_name = cmd.display_name.unwrap_or(cmd.address);
    let password = get_password(cmd.prompt_password);
    let hash = or_die(hash_password(&config.crypto.argon2, &password));

    let mailbox =
        or_die(create_mailbox(services, &address, &display_name, &hash));
    println!("Created mailbox {mailbox} for {address}");
    if !cmd.prompt_password {
        println!("Password: {password}");
    }
}

fn mailbox_passwd(
    config: &SystemConfig,
    services: &Services,
    cmd: MailboxPasswdSubcommand,
) {
    let address = parse_address(&cmd.address);
    let password = get_password(cmd.prompt_password);
    let hash = or_die(hash_password(&config.crypto.argon2, &password));

    or_die(set_password_hash(services, &address, &hash));
    println!("Changed password of {address}");
    if !cmd.prompt_password {
        println!("Password: {password}");
    }
}

fn open(config: &SystemConfig) -> Services {
    let log_prefix = LogPrefix::new("admin".to_owned());
    // Mail is never accepted here, so nothing ever wakes a queue.
    or_die(Services::open(&log_prefix, config, QueueSignal::new()))
}

fn or_die<T>(result: Result<T, Error>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{e}");
            Sysexit::for_error(&e).exit()
        },
    }
}

fn parse_address(s: &str) -> Address {
    match Address::parse(s) {
        Ok(address) => address,
        Err(e) => die!(EX_USAGE, "Invalid address {:?}: {}", s, e),
    }
}

fn get_password(prompt: bool) -> String {
    if prompt {
        match rpassword::prompt_password("Password: ").and_then(|a| {
            rpassword::prompt_password("Confirm: ").map(|b| (a, b))
        }) {
            Err(e) => die!(EX_NOINPUT, "Failed to read password: {}", e),
            Ok((a, b)) if a != b => die!(EX_DATAERR, "Passwords don't match"),
            Ok((a, _)) if a.is_empty() => die!(EX_NOINPUT, "No password given"),
            Ok((a, _)) => a,
        }
    } else {
        let data: [u8; 12] = OsRng.gen();
        base64::encode(data)
    }
}

fn ascii_domain(name: &str) -> Result<String, Error> {
    address::ascii_domain(name).ok_or(Error::DomainNotFound)
}

fn add_domain(services: &Services, name: &str) -> Result<(), Error> {
    let name = ascii_domain(name)?;
    let mut store = services.store.borrow_mut();
    let tx = store.write_tx()?;
    store::create_domain(&tx, &name)?;
    tx.commit()?;
    Ok(())
}

fn remove_domain(services: &Services, name: &str) -> Result<(), Error> {
    let name = ascii_domain(name)?;
    let mut store = services.store.borrow_mut();
    let tx = store.write_tx()?;
    store::delete_domain(&tx, &name)?;
    tx.commit()?;
    Ok(())
}

/// Lists the local domains in their Unicode form.
fn list_domains(services: &Services) -> Result<Vec<String>, Error> {
    let mut store = services.store.borrow_mut();
    let tx = store.read_tx()?;
    Ok(store::list_domains(&tx)?
        .into_iter()
        .map(|d| address::normalize_domain(&d.name))
        .collect())
}

fn create_mailbox(
    services: &Services,
    address: &Address,
    display_name: &str,
    hash: &str,
) -> Result<MailboxId, Error> {
    let mut store = services.store.borrow_mut();
    let tx = store.write_tx()?;
    let domain = store::find_domain(&tx, &ascii_domain(address.domain())?)?
        .ok_or(Error::DomainNotFound)?;
    if addressbook::resolve(&tx, address)?.mailbox().is_some() {
        return Err(Error::AddressInUse);
    }

    let mailbox = store::create_mailbox(&tx, display_name, hash)?;
    store::create_address(
        &tx,
        &address.normalized_local_part(),
        domain.id,
        mailbox,
    )?;
    tx.commit()?;
    Ok(mailbox)
}

fn set_password_hash(
    services: &Services,
    address: &Address,
    hash: &str,
) -> Result<(), Error> {
    let mut store = services.store.borrow_mut();
    let tx = store.write_tx()?;
    let Resolution::Local(mailbox) = addressbook::resolve(&tx, address)?
    else {
        return Err(Error::MailboxNotFound);
    };
    store::set_password_hash(&tx, mailbox, hash)?;
    tx.commit()?;
    Ok(())
}

fn list_mailboxes(
    services: &Services,
) -> Result<Vec<(Mailbox, Vec<String>)>, Error> {
    let mut store = services.store.borrow_mut();
    let tx = store.read_tx()?;
    store::list_mailboxes(&tx)?
        .into_iter()
        .map(|mailbox| {
            let addresses = store::list_addresses(&tx, mailbox.id)?;
            Ok((mailbox, addresses))
        })
        .collect()
}

fn add_address(
    services: &Services,
    address: &Address,
    existing: &Address,
) -> Result<(), Error> {
    let Some(mailbox) = services.addressbook.lookup(existing)?.mailbox()
    else {
        return Err(Error::MailboxNotFound);
    };
    services.addressbook.add_address(address, mailbox)
}
