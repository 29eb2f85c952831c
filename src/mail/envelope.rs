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

use std::net::IpAddr;

use chrono::prelude::*;

use super::address::Address;

/// The out-of-band addressing information of a mail in transit.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// The identity the client gave in `HELO`/`EHLO`.
    pub helo: String,
    pub remote_ip: IpAddr,
    /// When `DATA` started.
    pub date: DateTime<Utc>,
    /// The reverse-path. `None` is the null path (`<>`) used by bounces.
    pub from: Option<Address>,
    /// The forward-paths, in the order `RCPT TO` accepted them.
    pub to: Vec<Address>,
}

impl Envelope {
    pub fn new(helo: String, remote_ip: IpAddr) -> Self {
        Self {
            helo,
            remote_ip,
            date: Utc::now(),
            from: None,
            to: Vec::new(),
        }
    }

    /// The reverse-path as it is stored and sent, without angle brackets.
    pub fn return_path(&self) -> String {
        self.from.as_ref().map(Address::to_string).unwrap_or_default()
    }

    /// Forgets the reverse- and forward-paths, keeping the session identity.
    pub fn clear(&mut self) {
        self.from = None;
        self.to.clear();
    }
}
