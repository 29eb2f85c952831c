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

//! Password verification for SMTP submission and POP3.

use std::time::Duration;

use log::warn;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use super::address::Address;
use super::addressbook::{self, Resolution};
use super::store::{self, MailboxId, StoreRef};
use crate::support::error::Error;
use crate::support::system_config::Argon2Config;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Either the address is not ours or the password is wrong. Callers
    /// cannot tell which.
    #[error("Wrong address or password")]
    WrongAddressPassword,
    #[error(transparent)]
    Store(#[from] Error),
}

/// Produces a new encoded Argon2id hash of `password` with a fresh salt.
pub fn hash_password(
    params: &Argon2Config,
    password: &str,
) -> Result<String, Error> {
    let mut salt = vec![0u8; params.salt_length.max(8) as usize];
    OsRng.fill_bytes(&mut salt);
    argon2::hash_encoded(password.as_bytes(), &salt, &argon2_config(params))
        .map_err(Into::into)
}

fn argon2_config(params: &Argon2Config) -> argon2::Config<'static> {
    let lanes = params.threads.max(1);
    argon2::Config {
        variant: argon2::Variant::Argon2id,
        version: argon2::Version::Version13,
        mem_cost: params.memory.max(8 * lanes),
        time_cost: params.time.max(1),
        lanes,
        hash_length: params.hash_length.max(4),
        ..argon2::Config::default()
    }
}

pub struct Authenticator {
    store: StoreRef,
    min_duration: Duration,
    /// Verified against when the address is unknown, so that unknown
    /// addresses cost as much as known ones.
    dummy_hash: String,
}

impl Authenticator {
    pub fn new(
        store: StoreRef,
        params: &Argon2Config,
        min_duration: Duration,
    ) -> Result<Self, Error> {
        let dummy_hash = hash_password(params, "")?;
        Ok(Self {
            store,
            min_duration,
            dummy_hash,
        })
    }

    /// Checks `password` against the mailbox owning the address `name`.
    ///
    /// Always takes at least the configured minimum duration.
    pub async fn auth(
        &self,
        name: &str,
        password: &str,
    ) -> Result<MailboxId, AuthError> {
        let start = tokio::time::Instant::now();
        let result = self.auth_impl(name, password).await;
        tokio::time::sleep_until(start + self.min_duration).await;
        result
    }

    async fn auth_impl(
        &self,
        name: &str,
        password: &str,
    ) -> Result<MailboxId, AuthError> {
        let (mailbox, hash) = match self.find_credential(name)? {
            Some((mailbox, hash)) => (Some(mailbox), hash),
            None => (None, self.dummy_hash.clone()),
        };

        let password = password.to_owned();
        let matched = tokio::task::spawn_blocking(move || {
            argon2::verify_encoded(&hash, password.as_bytes())
        })
        .await
        .map_err(Error::from)?;

        let matched = match matched {
            Ok(matched) => matched,
            Err(e) => {
                if let Some(mailbox) = mailbox {
                    warn!("Unusable password hash on mailbox {mailbox}: {e}");
                }
                false
            },
        };

        match mailbox {
            Some(mailbox) if matched => Ok(mailbox),
            _ => Err(AuthError::WrongAddressPassword),
        }
    }

    fn find_credential(
        &self,
        name: &str,
    ) -> Result<Option<(MailboxId, String)>, Error> {
        let Ok(address) = Address::parse(name) else {
            return Ok(None);
        };

        let mut store = self.store.borrow_mut();
        let tx = store.read_tx()?;
        let Resolution::Local(mailbox) = addressbook::resolve(&tx, &address)?
        else {
            return Ok(None);
        };

        Ok(store::fetch_credential(&tx, mailbox)?
            .map(|cred| (mailbox, cred.password_hash)))
    }
}

#[cfg(test)]
pub(crate) fn fast_params() -> Argon2Config {
    Argon2Config {
        time: 1,
        memory: 64,
        threads: 1,
        hash_length: 16,
        salt_length: 8,
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::mail::addressbook::{Addressbook, NO_PASSWORD};
    use crate::mail::store::Store;

    fn setup(min_duration: Duration) -> (Authenticator, MailboxId) {
        let store = Rc::new(RefCell::new(Store::open_memory()));
        let params = fast_params();
        let book = Addressbook::new(Rc::clone(&store));
        book.ensure_domain("example.com").unwrap();

        let (mailbox, locked) = {
            let mut s = store.borrow_mut();
            let tx = s.write_tx().unwrap();
            let hash = hash_password(&params, "hunter2").unwrap();
            let mailbox = store::create_mailbox(&tx, "Alice", &hash).unwrap();
            let locked =
                store::create_mailbox(&tx, "Locked", NO_PASSWORD).unwrap();
            tx.commit().unwrap();
            (mailbox, locked)
        };
        let addr = |s: &str| Address::parse(s).unwrap();
        book.add_address(&addr("alice@example.com"), mailbox).unwrap();
        book.add_address(&addr("locked@example.com"), locked).unwrap();

        let auth = Authenticator::new(store, &params, min_duration).unwrap();
        (auth, mailbox)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn auth_outcomes() {
        let (auth, alice) = setup(Duration::ZERO);

        assert_eq!(
            alice,
            auth.auth("alice@example.com", "hunter2").await.unwrap(),
        );
        assert_eq!(
            alice,
            auth.auth("ALICE+pop@Example.COM", "hunter2").await.unwrap(),
        );
        assert_matches!(
            Err(AuthError::WrongAddressPassword),
            auth.auth("alice@example.com", "hunter3").await,
        );
        assert_matches!(
            Err(AuthError::WrongAddressPassword),
            auth.auth("bob@example.com", "hunter2").await,
        );
        assert_matches!(
            Err(AuthError::WrongAddressPassword),
            auth.auth("alice@example.org", "hunter2").await,
        );
        assert_matches!(
            Err(AuthError::WrongAddressPassword),
            auth.auth("not an address", "hunter2").await,
        );
        assert_matches!(
            Err(AuthError::WrongAddressPassword),
            auth.auth("locked@example.com", "").await,
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn minimum_duration_enforced() {
        let (auth, _) = setup(Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        assert!(auth.auth("bob@example.com", "x").await.is_err());
        assert!(start.elapsed() >= Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        assert!(auth.auth("alice@example.com", "hunter2").await.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn hashes_are_salted() {
        let params = fast_params();
        let a = hash_password(&params, "pw").unwrap();
        let b = hash_password(&params, "pw").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("$argon2id$"));
        assert!(argon2::verify_encoded(&a, b"pw").unwrap());
        assert!(!argon2::verify_encoded(&b, b"pw2").unwrap());
    }
}
