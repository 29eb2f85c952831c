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

//! An evaluator for SPF (RFC 7208) `check_host()`.
//!
//! Macro expansion is not supported; any record which uses a macro evaluates
//! to `permerror`. The `exp` modifier is ignored, and `ptr` never matches
//! (though it still counts towards the lookup limit) as the RFC discourages
//! its use.

use std::fmt;
use std::net::IpAddr;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::support::dns::{Dns, LookupError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        })
    }
}

/// The number of terms causing DNS lookups allowed in one evaluation.
const MAX_LOOKUPS: u32 = 10;
/// The number of MX hosts an `mx` mechanism may consider.
const MAX_MX_HOSTS: usize = 10;

/// Determines whether `ip` may send mail from `domain`.
pub async fn check_host(dns: &dyn Dns, ip: IpAddr, domain: &str) -> SpfResult {
    let mut evaluator = Evaluator {
        dns,
        ip,
        lookups: 0,
    };
    evaluator.check(domain.to_owned()).await
}

struct Evaluator<'a> {
    dns: &'a dyn Dns,
    ip: IpAddr,
    lookups: u32,
}

/// The outcome of evaluating one term.
enum Outcome {
    Match,
    NoMatch,
    Abort(SpfResult),
}

impl<'a> Evaluator<'a> {
    fn check(&mut self, domain: String) -> LocalBoxFuture<'_, SpfResult> {
        async move {
            if !is_valid_domain(&domain) {
                return SpfResult::None;
            }

            let record = match self.fetch_record(&domain).await {
                Ok(Some(record)) => record,
                Ok(None) => return SpfResult::None,
                Err(result) => return result,
            };

            self.evaluate(&domain, &record).await
        }
        .boxed_local()
    }

    async fn fetch_record(
        &self,
        domain: &str,
    ) -> Result<Option<String>, SpfResult> {
        let txt = match self.dns.txt(domain).await {
            Ok(txt) => txt,
            Err(LookupError::NotFound) => return Ok(None),
            Err(LookupError::Failed(_)) => return Err(SpfResult::TempError),
        };

        let mut records = txt.into_iter().filter(|r| is_spf_record(r));
        let record = records.next();
        if records.next().is_some() {
            return Err(SpfResult::PermError);
        }
        Ok(record)
    }

    async fn evaluate(&mut self, domain: &str, record: &str) -> SpfResult {
        let mut redirect = None::<String>;

        // Skip the version tag
        for term in record.split_ascii_whitespace().skip(1) {
            if let Some((name, value)) = modifier(term) {
                if value.contains('%') {
                    return SpfResult::PermError;
                }
                if name.eq_ignore_ascii_case("redirect") {
                    if redirect.is_some() {
                        return SpfResult::PermError;
                    }
                    redirect = Some(value.to_owned());
                }
                // Unknown modifiers and `exp` are ignored.
                continue;
            }

            let (qualifier, mechanism) = match term.as_bytes()[0] {
                b'+' => (SpfResult::Pass, &term[1..]),
                b'-' => (SpfResult::Fail, &term[1..]),
                b'~' => (SpfResult::SoftFail, &term[1..]),
                b'?' => (SpfResult::Neutral, &term[1..]),
                _ => (SpfResult::Pass, term),
            };

            match self.mechanism(domain, mechanism).await {
                Outcome::Match => return qualifier,
                Outcome::NoMatch => (),
                Outcome::Abort(result) => return result,
            }
        }

        if let Some(target) = redirect {
            if let Err(result) = self.count_lookup() {
                return result;
            }
            return match self.check(target).await {
                SpfResult::None => SpfResult::PermError,
                result => result,
            };
        }

        SpfResult::Neutral
    }

    async fn mechanism(&mut self, domain: &str, mechanism: &str) -> Outcome {
        let split = mechanism.find([':', '/']).unwrap_or(mechanism.len());
        let (name, rest) = mechanism.split_at(split);
        let name = name.to_ascii_lowercase();

        if rest.contains('%') {
            return Outcome::Abort(SpfResult::PermError);
        }

        match &*name {
            "all" if rest.is_empty() => Outcome::Match,

            "include" => {
                let Some(target) = rest.strip_prefix(':') else {
                    return Outcome::Abort(SpfResult::PermError);
                };
                if let Err(result) = self.count_lookup() {
                    return Outcome::Abort(result);
                }
                match self.check(target.to_owned()).await {
                    SpfResult::Pass => Outcome::Match,
                    SpfResult::Fail
                    | SpfResult::SoftFail
                    | SpfResult::Neutral => Outcome::NoMatch,
                    SpfResult::TempError => {
                        Outcome::Abort(SpfResult::TempError)
                    },
                    SpfResult::PermError | SpfResult::None => {
                        Outcome::Abort(SpfResult::PermError)
                    },
                }
            },

            "a" => {
                let Some((target, cidr)) = target_and_cidr(domain, rest)
                else {
                    return Outcome::Abort(SpfResult::PermError);
                };
                if let Err(result) = self.count_lookup() {
                    return Outcome::Abort(result);
                }
                self.host_matches(&target, cidr).await
            },

            "mx" => {
                let Some((target, cidr)) = target_and_cidr(domain, rest)
                else {
                    return Outcome::Abort(SpfResult::PermError);
                };
                if let Err(result) = self.count_lookup() {
                    return Outcome::Abort(result);
                }

                let exchanges = match self.dns.mx(&target).await {
                    Ok(exchanges) => exchanges,
                    Err(LookupError::NotFound) => return Outcome::NoMatch,
                    Err(LookupError::Failed(_)) => {
                        return Outcome::Abort(SpfResult::TempError);
                    },
                };
                if exchanges.len() > MAX_MX_HOSTS {
                    return Outcome::Abort(SpfResult::PermError);
                }

                for exchange in exchanges {
                    match self.host_matches(&exchange.host, cidr).await {
                        Outcome::NoMatch => continue,
                        outcome => return outcome,
                    }
                }
                Outcome::NoMatch
            },

            "ptr" => {
                if let Err(result) = self.count_lookup() {
                    return Outcome::Abort(result);
                }
                Outcome::NoMatch
            },

            "ip4" | "ip6" => {
                let Some(spec) = rest.strip_prefix(':') else {
                    return Outcome::Abort(SpfResult::PermError);
                };
                let (addr, prefix) = match spec.split_once('/') {
                    Some((addr, prefix)) => (addr, Some(prefix)),
                    None => (spec, None),
                };
                let Ok(net) = addr.parse::<IpAddr>() else {
                    return Outcome::Abort(SpfResult::PermError);
                };
                let max_prefix = if net.is_ipv4() { 32 } else { 128 };
                if (net.is_ipv4()) != ("ip4" == name) {
                    return Outcome::Abort(SpfResult::PermError);
                }
                let prefix = match prefix.map(str::parse::<u8>) {
                    None => max_prefix,
                    Some(Ok(p)) if p <= max_prefix => p,
                    Some(_) => return Outcome::Abort(SpfResult::PermError),
                };

                if in_network(self.ip, net, prefix) {
                    Outcome::Match
                } else {
                    Outcome::NoMatch
                }
            },

            "exists" => {
                let Some(target) = rest.strip_prefix(':') else {
                    return Outcome::Abort(SpfResult::PermError);
                };
                if let Err(result) = self.count_lookup() {
                    return Outcome::Abort(result);
                }
                match self.dns.ipv4(target).await {
                    Ok(_) => Outcome::Match,
                    Err(LookupError::NotFound) => Outcome::NoMatch,
                    Err(LookupError::Failed(_)) => {
                        Outcome::Abort(SpfResult::TempError)
                    },
                }
            },

            _ => Outcome::Abort(SpfResult::PermError),
        }
    }

    async fn host_matches(&self, host: &str, cidr: DualCidr) -> Outcome {
        let addresses = match self.dns.ip(host).await {
            Ok(addresses) => addresses,
            Err(LookupError::NotFound) => return Outcome::NoMatch,
            Err(LookupError::Failed(_)) => {
                return Outcome::Abort(SpfResult::TempError);
            },
        };

        let prefix = if self.ip.is_ipv4() { cidr.v4 } else { cidr.v6 };
        if addresses
            .into_iter()
            .filter(|a| a.is_ipv4() == self.ip.is_ipv4())
            .any(|a| in_network(self.ip, a, prefix))
        {
            Outcome::Match
        } else {
            Outcome::NoMatch
        }
    }

    fn count_lookup(&mut self) -> Result<(), SpfResult> {
        self.lookups += 1;
        if self.lookups > MAX_LOOKUPS {
            Err(SpfResult::PermError)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DualCidr {
    v4: u8,
    v6: u8,
}

/// Parses the `[:domain][/v4][//v6]` tail of an `a` or `mx` mechanism.
fn target_and_cidr(domain: &str, rest: &str) -> Option<(String, DualCidr)> {
    let (target, cidr) = match rest.strip_prefix(':') {
        Some(spec) => {
            let slash = spec.find('/').unwrap_or(spec.len());
            (spec[..slash].to_owned(), &spec[slash..])
        },
        None => (domain.to_owned(), rest),
    };

    if target.is_empty() {
        return None;
    }

    let mut out = DualCidr { v4: 32, v6: 128 };
    let (v4, v6) = match cidr.find("//") {
        Some(ix) => (&cidr[..ix], Some(&cidr[ix + 2..])),
        None => (cidr, None),
    };
    if let Some(v4) = v4.strip_prefix('/') {
        out.v4 = v4.parse().ok().filter(|&p| p <= 32)?;
    } else if !v4.is_empty() {
        return None;
    }
    if let Some(v6) = v6 {
        out.v6 = v6.parse().ok().filter(|&p| p <= 128)?;
    }

    Some((target, out))
}

/// Splits a modifier term into name and value. Mechanisms return `None`.
fn modifier(term: &str) -> Option<(&str, &str)> {
    let (name, value) = term.split_once('=')?;
    if name.is_empty()
        || !name.as_bytes()[0].is_ascii_alphabetic()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_.".contains(&b))
    {
        return None;
    }
    Some((name, value))
}

fn is_spf_record(txt: &str) -> bool {
    let Some(version) = txt.get(..6) else {
        return false;
    };
    version.eq_ignore_ascii_case("v=spf1")
        && txt[6..].chars().next().map_or(true, |c| ' ' == c)
}

fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain
            .trim_end_matches('.')
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= 63)
}

fn in_network(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask =
                u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(ip) & mask == u32::from(net) & mask
        },
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask =
                u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(ip) & mask == u128::from(net) & mask
        },
        _ => false,
    }
}
