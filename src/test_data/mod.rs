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

//! Fixed data shared by the tests.

use openssl::{
    asn1::Asn1Time,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509Builder, X509NameBuilder, X509},
};

/// A small message with DOS line endings.
pub static SIMPLE_MESSAGE: &[u8] = b"From: <ext@foo.test>\r\n\
To: <alice@example.com>\r\n\
Subject: hello\r\n\
\r\n\
Hello Alice.\r\n\
.. starts with a dot\r\n";

lazy_static::lazy_static! {
    pub static ref CERTIFICATE_PRIVATE_KEY: PKey<Private> =
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    /// A self-signed certificate for `localhost` valid for two days.
    pub static ref CERTIFICATE: X509 = {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&CERTIFICATE_PRIVATE_KEY).unwrap();
        builder
            .set_not_before(&Asn1Time::from_unix(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(2).unwrap())
            .unwrap();
        builder
            .sign(&CERTIFICATE_PRIVATE_KEY, MessageDigest::sha256())
            .unwrap();
        builder.build()
    };
}
