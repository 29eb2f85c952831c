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

//! Delivery of queued mail to foreign servers.
//!
//! Each call to `Courier::send` makes one attempt at every pending recipient
//! of a mail, grouping them by destination domain so that each group is sent
//! in a single SMTP transaction.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use bitflags::bitflags;
use futures::future::{FutureExt, LocalBoxFuture};
use log::{error, info, warn};

use super::transact::{self, Message, RecipientOutcome};
use crate::mail::address::Address;
use crate::mail::blobs::BlobStore;
use crate::mail::store::{
    self, Mail, Recipient, RecipientId, RecipientStatus, StoreRef,
    UnixTimestamp,
};
use crate::mail::Services;
use crate::support::{
    async_io::ServerIo,
    dns::{Dns, Exchange, LookupError},
    error::Error,
    log_prefix::LogPrefix,
};

/// After this many attempts, recipients still pending are given up on.
pub const MAX_ATTEMPTS: u32 = 30;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

bitflags! {
    /// What happened to the recipients handled by one `send` call.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SendResult: u8 {
        const SOME_PENDING = 1 << 0;
        const SOME_FAILED = 1 << 1;
        const SOME_SUCCESS = 1 << 2;
    }
}

/// Opens connections to foreign mail servers.
pub trait Connector {
    /// Connects to the SMTP port of `ip`, which is an address of `host`.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        ip: IpAddr,
    ) -> LocalBoxFuture<'a, io::Result<ServerIo>>;
}

/// Connects to port 25 over TCP.
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        _host: &'a str,
        ip: IpAddr,
    ) -> LocalBoxFuture<'a, io::Result<ServerIo>> {
        async move {
            let addr = SocketAddr::from((ip, 25));
            let sock = tokio::time::timeout(
                CONNECT_TIMEOUT,
                tokio::net::TcpStream::connect(addr),
            )
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
            })??;
            // ServerIo manages the low-level tokio registration itself.
            let sock = sock.into_std()?;
            ServerIo::new_owned_socket(sock).map_err(|e| {
                io::Error::new(io::ErrorKind::Other, e.to_string())
            })
        }
        .boxed_local()
    }
}

pub struct Courier {
    store: StoreRef,
    blobs: Rc<BlobStore>,
    dns: Rc<dyn Dns>,
    connector: Rc<dyn Connector>,
    hostname: String,
}

impl Courier {
    pub fn new(
        services: &Services,
        dns: Rc<dyn Dns>,
        connector: Rc<dyn Connector>,
    ) -> Self {
        Self {
            store: Rc::clone(&services.store),
            blobs: Rc::clone(&services.blobs),
            dns,
            connector,
            hostname: services.hostname.clone(),
        }
    }

    /// Makes one delivery attempt for every pending recipient of `mail`.
    ///
    /// Only store errors are returned; delivery problems are recorded in the
    /// recipients' statuses.
    pub async fn send(&self, mail: &Mail) -> Result<SendResult, Error> {
        let log_prefix = LogPrefix::new("courier".to_owned());
        log_prefix.set_user(mail.id.to_string());

        let recipients = {
            let mut store = self.store.borrow_mut();
            let tx = store.read_tx()?;
            store::fetch_recipients(
                &tx,
                mail.id,
                Some(RecipientStatus::Pending),
            )?
        };

        let mut updates = Vec::<(RecipientId, RecipientStatus)>::new();
        let mut groups = Vec::<(String, Vec<Recipient>)>::new();
        for recipient in recipients {
            let domain = Address::parse(&recipient.forward_path)
                .ok()
                .and_then(|a| a.ascii_domain());
            let Some(domain) = domain else {
                warn!(
                    "{log_prefix} Unusable forward path {:?}",
                    recipient.forward_path,
                );
                updates.push((recipient.id, RecipientStatus::Failed));
                continue;
            };

            match groups.iter_mut().find(|g| g.0 == domain) {
                Some(group) => group.1.push(recipient),
                None => groups.push((domain, vec![recipient])),
            }
        }
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        for (domain, recipients) in &groups {
            let forward_paths = recipients
                .iter()
                .map(|r| r.forward_path.as_str())
                .collect::<Vec<_>>();
            let statuses = self
                .send_group(&log_prefix, mail, domain, &forward_paths)
                .await;
            updates.extend(recipients.iter().map(|r| r.id).zip(statuses));
        }

        self.write_back(&log_prefix, mail, &updates)
    }

    fn write_back(
        &self,
        log_prefix: &LogPrefix,
        mail: &Mail,
        updates: &[(RecipientId, RecipientStatus)],
    ) -> Result<SendResult, Error> {
        let mut result = SendResult::empty();
        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;

        let attempts =
            store::record_attempt(&tx, mail.id, UnixTimestamp::now())?;
        for &(recipient, status) in updates {
            match status {
                RecipientStatus::Pending => {
                    result |= SendResult::SOME_PENDING;
                    continue;
                },
                RecipientStatus::Delivered => {
                    result |= SendResult::SOME_SUCCESS
                },
                RecipientStatus::Failed => result |= SendResult::SOME_FAILED,
                RecipientStatus::Inboxed => {
                    error!("{log_prefix} BUG: courier produced Inboxed");
                    continue;
                },
            }
            store::set_recipient_status(&tx, recipient, status)?;
        }

        if attempts >= MAX_ATTEMPTS {
            let expired = store::fail_pending_recipients(&tx, mail.id)?;
            if expired > 0 {
                info!(
                    "{log_prefix} Giving up on {expired} recipient(s) after \
                     {attempts} attempts",
                );
                result.remove(SendResult::SOME_PENDING);
                result |= SendResult::SOME_FAILED;
            }
        }

        tx.commit()?;
        Ok(result)
    }

    /// Tries the mail exchangers of `domain` in order until one reaches a
    /// decision about the recipients in `forward_paths`.
    ///
    /// The result is parallel to `forward_paths`.
    async fn send_group(
        &self,
        log_prefix: &LogPrefix,
        mail: &Mail,
        domain: &str,
        forward_paths: &[&str],
    ) -> Vec<RecipientStatus> {
        let all = |status| vec![status; forward_paths.len()];

        let exchanges = match self.dns.mx(domain).await {
            Ok(mut exchanges) => {
                exchanges.sort_by_key(|e| e.preference);
                exchanges
            },
            // RFC 5321 § 5.1: the domain itself is the implicit MX
            Err(LookupError::NotFound) => vec![Exchange {
                preference: 0,
                host: domain.to_owned(),
            }],
            Err(LookupError::Failed(e)) => {
                info!("{log_prefix} MX lookup for {domain} failed: {e}");
                return all(RecipientStatus::Pending);
            },
        };

        for exchange in &exchanges {
            let ips = match self.dns.ip(&exchange.host).await {
                Ok(ips) => ips,
                Err(e) => {
                    info!(
                        "{log_prefix} Address lookup for {} failed: {e:?}",
                        exchange.host,
                    );
                    continue;
                },
            };

            for ip in ips {
                let result = self
                    .try_server(
                        log_prefix,
                        mail,
                        &exchange.host,
                        ip,
                        forward_paths,
                    )
                    .await;
                match result {
                    Ok(outcomes) => {
                        return outcomes
                            .into_iter()
                            .map(|o| match o {
                                RecipientOutcome::Delivered => {
                                    RecipientStatus::Delivered
                                },
                                RecipientOutcome::TempFail => {
                                    RecipientStatus::Pending
                                },
                                RecipientOutcome::PermFail => {
                                    RecipientStatus::Failed
                                },
                            })
                            .collect();
                    },
                    Err(transact::Error::TryNextServer) => {},
                    Err(transact::Error::TempFailure(outcomes)) => {
                        return deferred(forward_paths.len(), &outcomes);
                    },
                    Err(transact::Error::TotalFailure) => {
                        return all(RecipientStatus::Failed)
                    },
                }
            }
        }

        info!("{log_prefix} No server for {domain} could be reached");
        all(RecipientStatus::Pending)
    }

    async fn try_server(
        &self,
        log_prefix: &LogPrefix,
        mail: &Mail,
        host: &str,
        ip: IpAddr,
        forward_paths: &[&str],
    ) -> Result<Vec<RecipientOutcome>, transact::Error> {
        info!("{log_prefix} Connecting to {host} ({ip})");
        let cxn = match self.connector.connect(host, ip).await {
            Ok(cxn) => cxn,
            Err(e) => {
                info!("{log_prefix} Failed to connect to {ip}: {e}");
                return Err(transact::Error::TryNextServer);
            },
        };

        let file = match self.blobs.open(mail.id) {
            Ok(file) => file,
            Err(e) => {
                error!("{log_prefix} Failed to open blob: {e}");
                return Err(transact::Error::TempFailure(Vec::new()));
            },
        };
        let mut data = io::BufReader::new(file);

        let outcomes = transact::execute(
            cxn,
            log_prefix,
            Message {
                return_path: &mail.return_path,
                size: mail.size,
                data: &mut data,
            },
            forward_paths,
            host,
            &self.hostname,
        )
        .await?;

        info!("{log_prefix} Transaction with {host} complete: {outcomes:?}");
        Ok(outcomes)
    }
}

/// Statuses for a group whose mail was deferred as a whole.
///
/// Recipients the server already refused permanently at `RCPT TO` fail now;
/// the rest are retried.
fn deferred(
    count: usize,
    outcomes: &[RecipientOutcome],
) -> Vec<RecipientStatus> {
    (0..count)
        .map(|ix| match outcomes.get(ix) {
            Some(RecipientOutcome::PermFail) => RecipientStatus::Failed,
            _ => RecipientStatus::Pending,
        })
        .collect()
}

#[cfg(test)]
pub(super) mod test {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::unix::net::UnixStream;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    use super::*;
    use crate::mail::envelope::Envelope;
    use crate::mail::store::MailId;
    use crate::mail::test_fixture::Fixture;
    use crate::support::dns::fake::FakeDns;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Behaviour {
        /// Greets with 421 and hangs up.
        Busy,
        /// Greets with 554 and hangs up.
        Hostile,
        /// Accepts everything except recipients whose local part is
        /// `later` (450) or `nobody` (550).
        Friendly,
        /// Like `Friendly`, but answers `DATA` with 451.
        DeferData,
    }

    /// Connects to in-process fake mail servers, one per IP in `servers`.
    /// Connections to any other IP are refused.
    #[derive(Default)]
    pub struct ScriptedConnector {
        pub servers: HashMap<IpAddr, Behaviour>,
        pub connections: RefCell<Vec<IpAddr>>,
        pub commands: Rc<RefCell<Vec<String>>>,
    }

    impl Connector for ScriptedConnector {
        fn connect<'a>(
            &'a self,
            _host: &'a str,
            ip: IpAddr,
        ) -> LocalBoxFuture<'a, io::Result<ServerIo>> {
            async move {
                self.connections.borrow_mut().push(ip);
                let Some(&behaviour) = self.servers.get(&ip) else {
                    return Err(io::Error::from(
                        io::ErrorKind::ConnectionRefused,
                    ));
                };

                let (server, client) = UnixStream::pair()?;
                let server = ServerIo::new_owned_socket(server).unwrap();
                let client = ServerIo::new_owned_socket(client).unwrap();
                let commands = Rc::clone(&self.commands);
                tokio::task::spawn_local(async move {
                    let _ = serve(behaviour, server, commands).await;
                });
                Ok(client)
            }
            .boxed_local()
        }
    }

    async fn serve(
        behaviour: Behaviour,
        io: ServerIo,
        commands: Rc<RefCell<Vec<String>>>,
    ) -> io::Result<()> {
        let mut writer = io.clone();
        let mut reader = tokio::io::BufReader::new(io);

        match behaviour {
            Behaviour::Busy => {
                writer.write_all(b"421 too busy\r\n").await?;
                return Ok(());
            },
            Behaviour::Hostile => {
                writer.write_all(b"554 go away\r\n").await?;
                return Ok(());
            },
            Behaviour::Friendly | Behaviour::DeferData => {
                writer.write_all(b"220 hello\r\n").await?;
            },
        }

        let mut line = String::new();
        loop {
            line.clear();
            if 0 == reader.read_line(&mut line).await? {
                return Ok(());
            }

            let command = line.trim_end().to_owned();
            commands.borrow_mut().push(command.clone());

            let reply: &[u8] = if command.starts_with("RCPT")
                && command.contains("<later@")
            {
                b"450 try later\r\n"
            } else if command.starts_with("RCPT")
                && command.contains("<nobody@")
            {
                b"550 no such user\r\n"
            } else if "DATA" == command
                && Behaviour::DeferData == behaviour
            {
                b"451 try again later\r\n"
            } else if "DATA" == command {
                writer.write_all(b"354 go ahead\r\n").await?;
                loop {
                    line.clear();
                    if 0 == reader.read_line(&mut line).await? {
                        return Ok(());
                    }
                    if ".\r\n" == line {
                        break;
                    }
                }
                b"250 ok\r\n"
            } else if "QUIT" == command {
                writer.write_all(b"221 bye\r\n").await?;
                return Ok(());
            } else {
                b"250 ok\r\n"
            };

            writer.write_all(reply).await?;
        }
    }

    pub fn submit(fixture: &Fixture, to: &[&str]) -> MailId {
        let mut envelope = Envelope::new(
            "client.example.com".to_owned(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        envelope.from = Some(Address::parse("alice@example.com").unwrap());
        envelope.to = to.iter().map(|s| Address::parse(s).unwrap()).collect();
        fixture
            .services
            .mailman
            .deliver(&envelope, &mut &b"Subject: hi\r\n\r\n.hello\r\n"[..])
            .unwrap()
    }

    pub fn fetch(fixture: &Fixture, id: MailId) -> (Mail, Vec<Recipient>) {
        let mut store = fixture.services.store.borrow_mut();
        let tx = store.read_tx().unwrap();
        (
            store::fetch_mail(&tx, id).unwrap(),
            store::fetch_recipients(&tx, id, None).unwrap(),
        )
    }

    pub fn statuses(recipients: &[Recipient]) -> Vec<RecipientStatus> {
        recipients.iter().map(|r| r.status).collect()
    }

    pub fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    pub fn remote_dns() -> FakeDns {
        let mut dns = FakeDns::default();
        dns.mx.insert(
            "remote.test".to_owned(),
            vec![
                Exchange {
                    preference: 20,
                    host: "h2.remote.test".to_owned(),
                },
                Exchange {
                    preference: 10,
                    host: "h1.remote.test".to_owned(),
                },
            ],
        );
        dns.a.insert(
            "h1.remote.test".to_owned(),
            vec![Ipv4Addr::new(192, 0, 2, 1)],
        );
        dns.a.insert(
            "h2.remote.test".to_owned(),
            vec![Ipv4Addr::new(192, 0, 2, 2)],
        );
        dns
    }

    pub fn courier(
        fixture: &Fixture,
        dns: FakeDns,
        connector: &Rc<ScriptedConnector>,
    ) -> Courier {
        Courier::new(
            &fixture.services,
            Rc::new(dns),
            Rc::clone(connector) as Rc<dyn Connector>,
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transient_then_permanent() {
        crate::init_test_log();
        let fixture = Fixture::new();
        let id = submit(&fixture, &["bob@remote.test"]);

        let connector = Rc::new(ScriptedConnector {
            servers: [(ip(1), Behaviour::Busy)].into_iter().collect(),
            ..ScriptedConnector::default()
        });
        let courier = courier(&fixture, remote_dns(), &connector);

        tokio::task::LocalSet::new()
            .run_until(async {
                let (mail, _) = fetch(&fixture, id);
                assert_eq!(
                    SendResult::SOME_PENDING,
                    courier.send(&mail).await.unwrap(),
                );
                // The 421 stops the attempt before h2 is tried.
                assert_eq!(vec![ip(1)], *connector.connections.borrow());

                let (mail, recipients) = fetch(&fixture, id);
                assert_eq!(1, mail.attempt_count);
                assert!(mail.last_attempted_at.is_some());
                assert_eq!(
                    vec![RecipientStatus::Pending],
                    statuses(&recipients),
                );

                for _ in 1..MAX_ATTEMPTS - 1 {
                    let (mail, _) = fetch(&fixture, id);
                    assert_eq!(
                        SendResult::SOME_PENDING,
                        courier.send(&mail).await.unwrap(),
                    );
                }

                let (mail, _) = fetch(&fixture, id);
                assert_eq!(MAX_ATTEMPTS - 1, mail.attempt_count);
                assert_eq!(
                    SendResult::SOME_FAILED,
                    courier.send(&mail).await.unwrap(),
                );
            })
            .await;

        let (mail, recipients) = fetch(&fixture, id);
        assert_eq!(MAX_ATTEMPTS, mail.attempt_count);
        assert_eq!(vec![RecipientStatus::Failed], statuses(&recipients));

        assert_eq!(1, fixture.services.cleaner.clean().unwrap());
        assert!(!fixture.services.blobs.exists(id));
        assert!(fetch(&fixture, id).0.deleted_at.is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mixed_recipients_and_mx_fallback() {
        crate::init_test_log();
        let fixture = Fixture::new();
        let id = submit(
            &fixture,
            &[
                "bob@remote.test",
                "later@remote.test",
                "nobody@remote.test",
            ],
        );

        // h1 refuses connections, so h2 gets the mail.
        let connector = Rc::new(ScriptedConnector {
            servers: [(ip(2), Behaviour::Friendly)].into_iter().collect(),
            ..ScriptedConnector::default()
        });
        let courier = courier(&fixture, remote_dns(), &connector);

        let result = tokio::task::LocalSet::new()
            .run_until(async {
                let (mail, _) = fetch(&fixture, id);
                courier.send(&mail).await.unwrap()
            })
            .await;

        assert_eq!(SendResult::all(), result);
        assert_eq!(vec![ip(1), ip(2)], *connector.connections.borrow());

        let (_, recipients) = fetch(&fixture, id);
        assert_eq!(
            vec![
                RecipientStatus::Delivered,
                RecipientStatus::Pending,
                RecipientStatus::Failed,
            ],
            statuses(&recipients),
        );

        let commands = connector.commands.borrow();
        assert_eq!("EHLO mx.example.com", commands[0]);
        assert_eq!("MAIL FROM:<alice@example.com>", commands[1]);
        assert_eq!("RCPT TO:<bob@remote.test>", commands[2]);
        assert_eq!("DATA", commands[5]);
        assert_eq!("QUIT", commands[6]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deferred_data_fails_refused_recipients() {
        crate::init_test_log();
        let fixture = Fixture::new();
        let id = submit(&fixture, &["bob@remote.test", "nobody@remote.test"]);

        let connector = Rc::new(ScriptedConnector {
            servers: [(ip(1), Behaviour::DeferData)].into_iter().collect(),
            ..ScriptedConnector::default()
        });
        let courier = courier(&fixture, remote_dns(), &connector);

        let result = tokio::task::LocalSet::new()
            .run_until(async {
                let (mail, _) = fetch(&fixture, id);
                courier.send(&mail).await.unwrap()
            })
            .await;

        assert_eq!(SendResult::SOME_PENDING | SendResult::SOME_FAILED, result);
        // The 451 is final for this attempt; h2 is not tried.
        assert_eq!(vec![ip(1)], *connector.connections.borrow());

        let (mail, recipients) = fetch(&fixture, id);
        assert_eq!(1, mail.attempt_count);
        assert_eq!(
            vec![RecipientStatus::Pending, RecipientStatus::Failed],
            statuses(&recipients),
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn groups_by_domain() {
        crate::init_test_log();
        let fixture = Fixture::new();
        let id = submit(
            &fixture,
            &["bob@remote.test", "carol@hostile.test", "dave@broken.test"],
        );

        let mut dns = remote_dns();
        // No MX: the domain itself is tried.
        dns.a.insert(
            "hostile.test".to_owned(),
            vec![Ipv4Addr::new(192, 0, 2, 3)],
        );
        dns.failing.push("broken.test".to_owned());

        let connector = Rc::new(ScriptedConnector {
            servers: [
                (ip(1), Behaviour::Friendly),
                (ip(3), Behaviour::Hostile),
            ]
            .into_iter()
            .collect(),
            ..ScriptedConnector::default()
        });
        let courier = courier(&fixture, dns, &connector);

        let result = tokio::task::LocalSet::new()
            .run_until(async {
                let (mail, _) = fetch(&fixture, id);
                courier.send(&mail).await.unwrap()
            })
            .await;

        assert_eq!(SendResult::all(), result);
        // broken.test never got as far as connecting; groups go in domain
        // order.
        assert_eq!(vec![ip(3), ip(1)], *connector.connections.borrow());

        let (mail, recipients) = fetch(&fixture, id);
        assert_eq!(1, mail.attempt_count);
        assert_eq!(
            vec![
                RecipientStatus::Delivered,
                RecipientStatus::Failed,
                RecipientStatus::Pending,
            ],
            statuses(&recipients),
        );
    }
}
