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

//! Mail addresses and their normalisation.
//!
//! An `Address` retains exactly what the peer sent, since external addresses
//! must be reproduced verbatim on the wire. Normalisation is a separate step
//! that is only applied when an address is matched against local data.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// RFC 5321 § 4.5.3.1.1
pub const MAX_LOCAL_PART: usize = 64;
/// RFC 5321 § 4.5.3.1.2
pub const MAX_DOMAIN: usize = 255;
/// RFC 5321 § 4.5.3.1.3, less the angle brackets.
pub const MAX_PATH: usize = 256;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address")]
    InvalidAddress,
    #[error("Path too long")]
    PathTooLong,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    local: String,
    domain: String,
}

impl Address {
    /// Parses `local@domain`, splitting on the last `@`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (local, domain) =
            s.rsplit_once('@').ok_or(AddressError::InvalidAddress)?;

        if local.is_empty()
            || domain.is_empty()
            || s.chars().any(|c| {
                c.is_control() || c.is_whitespace() || '<' == c || '>' == c
            })
        {
            return Err(AddressError::InvalidAddress);
        }

        if local.len() > MAX_LOCAL_PART
            || domain.len() > MAX_DOMAIN
            || s.len() > MAX_PATH
        {
            return Err(AddressError::PathTooLong);
        }

        Ok(Self {
            local: local.to_owned(),
            domain: domain.to_owned(),
        })
    }

    pub fn local_part(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The domain in the form used as a key in the database.
    pub fn ascii_domain(&self) -> Option<String> {
        ascii_domain(&self.domain)
    }

    /// The local part in the form used as a key in the database.
    pub fn normalized_local_part(&self) -> String {
        normalize_local_part(&self.local)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, AddressError> {
        Self::parse(s)
    }
}

/// Converts `domain` to its Unicode form (IDNA "to Unicode"), then NFC.
///
/// Invalid domains are still mapped as far as IDNA allows.
pub fn normalize_domain(domain: &str) -> String {
    let (unicode, _) = idna::domain_to_unicode(domain);
    unicode.nfc().collect()
}

/// Converts `domain` to lower-case ASCII (punycode) form.
///
/// Returns `None` if `domain` is not a valid IDNA domain.
pub fn ascii_domain(domain: &str) -> Option<String> {
    idna::domain_to_ascii(domain)
        .ok()
        .filter(|d| !d.is_empty())
        .map(|d| d.to_ascii_lowercase())
}

/// Case-folds and NFKC-normalises `local`, then drops everything from the
/// first `+` onward.
pub fn normalize_local_part(local: &str) -> String {
    // A few compatibility characters only gain a case mapping after NFKC, so
    // repeat until nothing changes.
    let mut folded = fold_once(local);
    for _ in 0..3 {
        let again = fold_once(&folded);
        if again == folded {
            break;
        }
        folded = again;
    }

    if let Some(plus) = folded.find('+') {
        folded.truncate(plus);
    }

    folded
}

fn fold_once(s: &str) -> String {
    caseless::default_case_fold_str(s).nfkc().collect()
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_valid() {
        let a = Address::parse("alice@example.com").unwrap();
        assert_eq!("alice", a.local_part());
        assert_eq!("example.com", a.domain());
        assert_eq!("alice@example.com", a.to_string());

        let a = Address::parse("\"odd@local\"@example.com").unwrap();
        assert_eq!("\"odd@local\"", a.local_part());
        assert_eq!("example.com", a.domain());

        let a = Address::parse("Bob+Tag@EXAMPLE.com").unwrap();
        assert_eq!("Bob+Tag@EXAMPLE.com", a.to_string());
    }

    #[test]
    fn parse_invalid() {
        assert_eq!(
            Err(AddressError::InvalidAddress),
            Address::parse("example.com"),
        );
        assert_eq!(Err(AddressError::InvalidAddress), Address::parse("@x"));
        assert_eq!(Err(AddressError::InvalidAddress), Address::parse("x@"));
        assert_eq!(Err(AddressError::InvalidAddress), Address::parse(""));
        assert_eq!(
            Err(AddressError::InvalidAddress),
            Address::parse("a b@example.com"),
        );
        assert_eq!(
            Err(AddressError::InvalidAddress),
            Address::parse("<a@example.com>"),
        );
    }

    #[test]
    fn length_limits() {
        let local64 = "l".repeat(64);
        assert!(Address::parse(&format!("{local64}@example.com")).is_ok());
        assert_eq!(
            Err(AddressError::PathTooLong),
            Address::parse(&format!("{local64}l@example.com")),
        );

        let domain255 = format!("{}.com", "d".repeat(251));
        assert_eq!(
            Err(AddressError::PathTooLong),
            Address::parse(&format!("a@{domain255}x")),
        );
        // 1 + 1 + 254 = 256 total
        let domain254 = format!("{}.com", "d".repeat(250));
        assert!(Address::parse(&format!("a@{domain254}")).is_ok());
        // 2 + 1 + 254 = 257 total
        assert_eq!(
            Err(AddressError::PathTooLong),
            Address::parse(&format!("ab@{domain254}")),
        );
    }

    #[test]
    fn local_part_normalisation() {
        assert_eq!("alice", normalize_local_part("Alice"));
        assert_eq!("alice", normalize_local_part("ALICE+newsletters"));
        assert_eq!("", normalize_local_part("+only"));
        assert_eq!("strasse", normalize_local_part("STRAẞE"));
        // Full-width characters are compatibility-equivalent to ASCII
        assert_eq!("bob", normalize_local_part("ＢＯＢ"));
        assert_eq!("h", normalize_local_part("ℌ"));
    }

    #[test]
    fn domain_normalisation() {
        assert_eq!("bücher.example", normalize_domain("xn--bcher-kva.example"));
        assert_eq!("bücher.example", normalize_domain("BÜCHER.example"));
        assert_eq!(
            Some("xn--bcher-kva.example".to_owned()),
            ascii_domain("Bücher.Example"),
        );
        assert_eq!(Some("example.com".to_owned()), ascii_domain("EXAMPLE.com"));
        assert_eq!(None, ascii_domain(""));
    }

    proptest! {
        #[test]
        fn local_part_normalisation_is_idempotent(s in "\\PC{0,24}") {
            let once = normalize_local_part(&s);
            prop_assert_eq!(&once, &normalize_local_part(&once));
        }

        #[test]
        fn domain_normalisation_is_idempotent(
            s in "[a-zA-Z0-9äöüéÄÖÜ]{1,12}(\\.[a-zA-Z]{2,6}){1,2}"
        ) {
            let once = normalize_domain(&s);
            prop_assert_eq!(&once, &normalize_domain(&once));
        }

        #[test]
        fn idna_round_trip(
            s in "[a-zA-Z0-9äöüéÄÖÜ]{1,12}(\\.[a-zA-Z]{2,6}){1,2}"
        ) {
            let ascii = ascii_domain(&s).unwrap();
            prop_assert_eq!(normalize_domain(&ascii), normalize_domain(&s));
        }

        #[test]
        fn parse_display_round_trip(
            local in "[a-zA-Z0-9.+_-]{1,20}",
            domain in "[a-z0-9]{1,20}\\.[a-z]{2,5}",
        ) {
            let s = format!("{local}@{domain}");
            let a = Address::parse(&s).unwrap();
            prop_assert_eq!(s, a.to_string());
        }
    }
}
