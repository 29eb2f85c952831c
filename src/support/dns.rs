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

//! DNS lookups as used by the courier and the admission hooks.
//!
//! Everything goes through the `Dns` trait so that tests can substitute a
//! fixed set of records for the system resolver.

use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
pub use hickory_resolver::Name;

pub type Resolver = hickory_resolver::AsyncResolver<
    hickory_resolver::name_server::GenericConnector<
        hickory_resolver::name_server::TokioRuntimeProvider,
    >,
>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupError {
    /// The name exists but has no records of the requested type, or does not
    /// exist at all.
    NotFound,
    /// The lookup could not be completed. Usually transient.
    Failed(String),
}

pub type LookupResult<T> = Result<T, LookupError>;

/// An MX record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exchange {
    pub preference: u16,
    /// The host, without trailing dot.
    pub host: String,
}

pub trait Dns {
    fn mx(
        &self,
        domain: &str,
    ) -> LocalBoxFuture<'_, LookupResult<Vec<Exchange>>>;
    fn ipv4(
        &self,
        host: &str,
    ) -> LocalBoxFuture<'_, LookupResult<Vec<Ipv4Addr>>>;
    /// Both A and AAAA records of `host`.
    fn ip(&self, host: &str) -> LocalBoxFuture<'_, LookupResult<Vec<IpAddr>>>;
    /// Each TXT record with its strings concatenated.
    fn txt(&self, name: &str) -> LocalBoxFuture<'_, LookupResult<Vec<String>>>;
}

/// Lookups through the resolver configured in `/etc/resolv.conf`.
#[derive(Clone)]
pub struct SystemDns {
    resolver: Rc<Resolver>,
}

impl SystemDns {
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        Ok(Self {
            resolver: Rc::new(
                hickory_resolver::AsyncResolver::tokio_from_system_conf()?,
            ),
        })
    }
}

/// Makes `name` fully-qualified so that search domains are never applied.
fn fqdn(name: &str) -> LookupResult<Name> {
    let mut name = Name::from_utf8(name)
        .map_err(|e| LookupError::Failed(format!("{name:?}: {e}")))?;
    name.set_fqdn(true);
    Ok(name)
}

fn to_result<T>(r: Result<T, ResolveError>) -> LookupResult<T> {
    r.map_err(|e| match *e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => LookupError::NotFound,
        _ => LookupError::Failed(e.to_string()),
    })
}

fn nonempty<T>(v: Vec<T>) -> LookupResult<Vec<T>> {
    if v.is_empty() {
        Err(LookupError::NotFound)
    } else {
        Ok(v)
    }
}

impl Dns for SystemDns {
    fn mx(
        &self,
        domain: &str,
    ) -> LocalBoxFuture<'_, LookupResult<Vec<Exchange>>> {
        let name = fqdn(domain);
        async move {
            let lookup = to_result(self.resolver.mx_lookup(name?).await)?;
            nonempty(
                lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_ascii();
                        Exchange {
                            preference: mx.preference(),
                            host: host
                                .strip_suffix('.')
                                .unwrap_or(&host)
                                .to_owned(),
                        }
                    })
                    .collect(),
            )
        }
        .boxed_local()
    }

    fn ipv4(
        &self,
        host: &str,
    ) -> LocalBoxFuture<'_, LookupResult<Vec<Ipv4Addr>>> {
        let name = fqdn(host);
        async move {
            let lookup = to_result(self.resolver.ipv4_lookup(name?).await)?;
            nonempty(lookup.iter().map(|a| a.0).collect())
        }
        .boxed_local()
    }

    fn ip(&self, host: &str) -> LocalBoxFuture<'_, LookupResult<Vec<IpAddr>>> {
        let name = fqdn(host);
        async move {
            let lookup = to_result(self.resolver.lookup_ip(name?).await)?;
            nonempty(lookup.iter().collect())
        }
        .boxed_local()
    }

    fn txt(&self, name: &str) -> LocalBoxFuture<'_, LookupResult<Vec<String>>> {
        let name = fqdn(name);
        async move {
            let lookup = to_result(self.resolver.txt_lookup(name?).await)?;
            nonempty(
                lookup
                    .iter()
                    .map(|txt| {
                        let mut combined = Vec::<u8>::new();
                        for part in txt.iter() {
                            combined.extend_from_slice(part);
                        }
                        String::from_utf8_lossy(&combined).into_owned()
                    })
                    .collect(),
            )
        }
        .boxed_local()
    }
}

/// Reverses the octets of an IPv4 address or the nibbles of an IPv6 address
/// into the form used by reverse and blocklist zones, with a trailing dot.
///
/// `127.0.0.2` becomes `2.0.0.127.`.
pub fn reverse_ip(ip: IpAddr) -> String {
    let mut out = String::new();
    match ip {
        IpAddr::V4(v4) => {
            for octet in v4.octets().iter().rev() {
                out.push_str(&octet.to_string());
                out.push('.');
            }
        },
        IpAddr::V6(v6) => {
            for octet in v6.octets().iter().rev() {
                for nibble in [octet & 0xF, octet >> 4] {
                    out.push(
                        char::from_digit(nibble.into(), 16).unwrap_or('0'),
                    );
                    out.push('.');
                }
            }
        },
    }
    out
}
