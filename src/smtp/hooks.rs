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

//! Admission hooks, which get to veto a transaction after `MAIL FROM` or
//! after `DATA`, and to add header lines to the stored message.

use std::net::IpAddr;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use log::info;

use super::codes::*;
use super::spf::{self, SpfResult};
use crate::mail::address::Address;
use crate::support::buffer::BufferReader;
use crate::support::dns::{self, Dns, LookupError};
use crate::support::error::Error;

/// What a hook decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Go on, prepending these header lines (each without line ending) to
    /// the message.
    Accept(Vec<String>),
    /// Refuse the transaction with this reply.
    Reject(Rejection),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub code: PrimaryCode,
    pub subject: SubjectCode,
    pub text: String,
}

/// What a `FromHook` gets to see.
#[derive(Clone, Copy, Debug)]
pub struct FromContext<'a> {
    pub is_submission: bool,
    pub remote_ip: IpAddr,
    pub helo: &'a str,
    /// `None` for the null reverse-path.
    pub from: Option<&'a Address>,
}

/// A hook run after `MAIL FROM` is otherwise accepted.
///
/// An `Err` result means the hook could not reach a decision; the session
/// replies with a temporary failure.
pub trait FromHook {
    fn check<'a>(
        &'a self,
        cx: FromContext<'a>,
    ) -> LocalBoxFuture<'a, Result<Verdict, Error>>;
}

/// A hook run after the message body has been received.
///
/// `body` is positioned at the start of the message and may be read to the
/// end; the caller rewinds it afterwards.
pub trait DataHook {
    fn check<'a>(
        &'a self,
        is_submission: bool,
        body: &'a mut BufferReader,
    ) -> LocalBoxFuture<'a, Result<Verdict, Error>>;
}

/// Checks the sender domain's SPF policy on relay sessions.
pub struct SpfHook {
    dns: Rc<dyn Dns>,
    hostname: String,
}

impl SpfHook {
    pub fn new(dns: Rc<dyn Dns>, hostname: String) -> Self {
        Self { dns, hostname }
    }
}

impl FromHook for SpfHook {
    fn check<'a>(
        &'a self,
        cx: FromContext<'a>,
    ) -> LocalBoxFuture<'a, Result<Verdict, Error>> {
        async move {
            if cx.is_submission {
                return Ok(Verdict::Accept(Vec::new()));
            }

            let sender = match cx.from {
                Some(from) => from.to_string(),
                None => format!("postmaster@{}", cx.helo),
            };
            let domain = sender
                .rsplit_once('@')
                .map(|(_, domain)| domain)
                .unwrap_or_default();

            let result =
                spf::check_host(&*self.dns, cx.remote_ip, domain).await;
            info!(
                "SPF result for {sender} from {}: {result}",
                cx.remote_ip,
            );

            if SpfResult::Fail == result {
                return Ok(Verdict::Reject(Rejection {
                    code: pc::ActionNotTakenPermanent,
                    subject: sc::SpfValidationFailed,
                    text: format!(
                        "SPF check failed: {} is not allowed to send \
                         mail for {domain}",
                        cx.remote_ip,
                    ),
                }));
            }

            Ok(Verdict::Accept(vec![format!(
                "Received-SPF: {result} ({}: domain of {sender} is {result} \
                 for {}) client-ip={}; envelope-from=\"{sender}\"; \
                 helo={};",
                self.hostname, cx.remote_ip, cx.remote_ip, cx.helo,
            )]))
        }
        .boxed_local()
    }
}

/// Rejects relay clients listed in a DNS blocklist zone.
pub struct DnsblHook {
    dns: Rc<dyn Dns>,
    zone: String,
}

impl DnsblHook {
    pub fn new(dns: Rc<dyn Dns>, zone: String) -> Self {
        Self { dns, zone }
    }
}

impl FromHook for DnsblHook {
    fn check<'a>(
        &'a self,
        cx: FromContext<'a>,
    ) -> LocalBoxFuture<'a, Result<Verdict, Error>> {
        async move {
            if cx.is_submission {
                return Ok(Verdict::Accept(Vec::new()));
            }

            let name = format!(
                "{}{}.",
                dns::reverse_ip(cx.remote_ip),
                self.zone.trim_end_matches('.'),
            );
            match self.dns.ipv4(&name).await {
                Ok(records) => {
                    info!(
                        "{} is listed in {} ({:?})",
                        cx.remote_ip, self.zone, records,
                    );
                    Ok(Verdict::Reject(Rejection {
                        code: pc::ActionNotTakenPermanent,
                        subject: sc::DeliveryNotAuthorised,
                        text: format!(
                            "{} is listed in {}",
                            cx.remote_ip, self.zone,
                        ),
                    }))
                },
                Err(LookupError::NotFound) => Ok(Verdict::Accept(Vec::new())),
                Err(LookupError::Failed(e)) => Err(Error::Dns(e)),
            }
        }
        .boxed_local()
    }
}

/// A `DataHook` which rejects bodies containing a fixed string.
#[cfg(test)]
pub struct RejectContaining(pub &'static str);

#[cfg(test)]
impl DataHook for RejectContaining {
    fn check<'a>(
        &'a self,
        _is_submission: bool,
        body: &'a mut BufferReader,
    ) -> LocalBoxFuture<'a, Result<Verdict, Error>> {
        use std::io::Read as _;

        async move {
            let mut content = String::new();
            body.read_to_string(&mut content)?;
            if content.contains(self.0) {
                Ok(Verdict::Reject(Rejection {
                    code: pc::TransactionFailed,
                    subject: sc::DeliveryNotAuthorised,
                    text: "message content rejected".to_owned(),
                }))
            } else {
                Ok(Verdict::Accept(vec!["X-Checked: yes".to_owned()]))
            }
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::support::dns::fake::FakeDns;

    fn block_on<T>(f: impl std::future::Future<Output = T>) -> T {
        futures::executor::block_on(f)
    }

    fn cx<'a>(
        is_submission: bool,
        ip: &str,
        from: Option<&'a Address>,
    ) -> FromContext<'a> {
        FromContext {
            is_submission,
            remote_ip: ip.parse().unwrap(),
            helo: "client.foo.test",
            from,
        }
    }

    #[test]
    fn dnsbl() {
        let mut dns = FakeDns::default();
        dns.a.insert(
            "2.0.0.127.zen.spamhaus.org".to_owned(),
            vec![Ipv4Addr::new(127, 0, 0, 2)],
        );
        dns.failing.push("3.0.0.127.zen.spamhaus.org".to_owned());
        let hook = DnsblHook::new(Rc::new(dns), "zen.spamhaus.org".to_owned());

        assert_matches!(
            Ok(Verdict::Reject(Rejection {
                code: pc::ActionNotTakenPermanent,
                ..
            })),
            block_on(hook.check(cx(false, "127.0.0.2", None))),
        );
        assert_eq!(
            Verdict::Accept(vec![]),
            block_on(hook.check(cx(false, "127.0.0.1", None))).unwrap(),
        );
        assert_matches!(
            Err(Error::Dns(_)),
            block_on(hook.check(cx(false, "127.0.0.3", None))),
        );
        // Submission sessions are never checked
        assert_eq!(
            Verdict::Accept(vec![]),
            block_on(hook.check(cx(true, "127.0.0.2", None))).unwrap(),
        );
    }

    #[test]
    fn spf() {
        let mut dns = FakeDns::default();
        dns.txt.insert(
            "foo.test".to_owned(),
            vec!["v=spf1 ip4:192.0.2.0/24 -all".to_owned()],
        );
        dns.txt.insert(
            "client.foo.test".to_owned(),
            vec!["v=spf1 ip4:192.0.2.7 -all".to_owned()],
        );
        let hook = SpfHook::new(Rc::new(dns), "mx.example.com".to_owned());
        let sender = Address::parse("ext@foo.test").unwrap();

        match block_on(hook.check(cx(false, "192.0.2.1", Some(&sender))))
            .unwrap()
        {
            Verdict::Accept(headers) => {
                assert_eq!(1, headers.len());
                assert!(
                    headers[0].starts_with("Received-SPF: pass "),
                    "unexpected header: {}",
                    headers[0],
                );
                assert!(headers[0].contains("client-ip=192.0.2.1;"));
            },
            v => panic!("unexpected verdict: {v:?}"),
        }

        assert_matches!(
            Ok(Verdict::Reject(Rejection {
                code: pc::ActionNotTakenPermanent,
                subject: sc::SpfValidationFailed,
                ..
            })),
            block_on(hook.check(cx(false, "198.51.100.1", Some(&sender)))),
        );

        // The null reverse-path is checked against the HELO identity
        assert_matches!(
            Ok(Verdict::Accept(_)),
            block_on(hook.check(cx(false, "192.0.2.7", None))),
        );
        assert_matches!(
            Ok(Verdict::Reject(_)),
            block_on(hook.check(cx(false, "192.0.2.8", None))),
        );

        assert_eq!(
            Verdict::Accept(vec![]),
            block_on(hook.check(cx(true, "198.51.100.1", Some(&sender))))
                .unwrap(),
        );
    }
}
