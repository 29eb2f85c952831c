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

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// Identifies a session at the start of each of its log lines, e.g.
/// `smtp+tls:192.0.2.1[alice@example.com helo=mx.example]`.
///
/// Clones share their state, so details learnt later in the session show up
/// everywhere the prefix was handed out.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Details>>,
}

#[derive(Default)]
struct Details {
    protocol: String,
    peer: Option<IpAddr>,
    user: Option<String>,
    helo: Option<String>,
    tls: bool,
}

/// Client-supplied text is cut off after this many characters.
const MAX_CLIENT_TEXT: usize = 64;

impl LogPrefix {
    pub fn new(protocol: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Details {
                protocol,
                ..Details::default()
            })),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Details)) {
        f(&mut self.inner.lock().unwrap());
    }

    pub fn set_peer(&self, peer: IpAddr) {
        self.update(|d| d.peer = Some(peer));
    }

    pub fn set_user(&self, user: String) {
        self.update(|d| d.user = Some(clean(user)));
    }

    pub fn clear_user(&self) {
        self.update(|d| d.user = None);
    }

    pub fn set_helo(&self, helo: String) {
        self.update(|d| d.helo = Some(clean(helo)));
    }

    pub fn set_tls(&self, tls: bool) {
        self.update(|d| d.tls = tls);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let details = self.inner.lock().unwrap();
        f.write_str(&details.protocol)?;
        if details.tls {
            f.write_str("+tls")?;
        }
        if let Some(peer) = details.peer {
            write!(f, ":{peer}")?;
        }

        let mut tags = Vec::with_capacity(2);
        if let Some(ref user) = details.user {
            tags.push(user.clone());
        }
        if let Some(ref helo) = details.helo {
            tags.push(format!("helo={helo}"));
        }
        if !tags.is_empty() {
            write!(f, "[{}]", tags.join(" "))?;
        }

        Ok(())
    }
}

/// Drops control characters and truncates to `MAX_CLIENT_TEXT`.
fn clean(s: String) -> String {
    s.chars()
        .filter(|c| !c.is_control())
        .take(MAX_CLIENT_TEXT)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formatting() {
        let prefix = LogPrefix::new("smtp".to_owned());
        assert_eq!("smtp", prefix.to_string());

        prefix.set_peer("192.0.2.1".parse().unwrap());
        assert_eq!("smtp:192.0.2.1", prefix.to_string());

        prefix.set_helo("mx.\x07example".to_owned());
        assert_eq!("smtp:192.0.2.1[helo=mx.example]", prefix.to_string());

        let shared = prefix.clone();
        prefix.set_user("alice@example.com\r\n".to_owned());
        prefix.set_tls(true);
        assert_eq!(
            "smtp+tls:192.0.2.1[alice@example.com helo=mx.example]",
            shared.to_string(),
        );

        prefix.clear_user();
        assert_eq!("smtp+tls:192.0.2.1[helo=mx.example]", shared.to_string());
    }

    #[test]
    fn long_values_truncated() {
        let prefix = LogPrefix::new("pop3".to_owned());
        prefix.set_user("x".repeat(200));
        assert_eq!(format!("pop3[{}]", "x".repeat(64)), prefix.to_string());
    }
}
