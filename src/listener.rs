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

//! Accepting TCP connections on the configured endpoints.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;

use crate::pop3::{serve_pop3, Pop3Service};
use crate::smtp::inbound::{serve_smtp, SmtpService};
use crate::support::{
    async_io::ServerIo, cert_source::CertSource, error::Error,
    log_prefix::LogPrefix,
};

/// The service behind a listening socket.
#[derive(Clone)]
pub enum Protocol {
    Smtp(Rc<SmtpService>),
    Pop3(Rc<Pop3Service>),
}

impl Protocol {
    fn name(&self) -> &'static str {
        match *self {
            Protocol::Smtp(_) => "smtp",
            Protocol::Pop3(_) => "pop3",
        }
    }
}

/// Binds a listening socket to `address` (`host:port`).
///
/// This is done outside the runtime so that failures can be reported
/// before anything else starts.
pub fn bind(address: &str) -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accepts connections on `listener` forever, serving each one on its own
/// local task.
///
/// Must be run within a `LocalSet`.
pub async fn run(
    listener: std::net::TcpListener,
    implicit_tls: bool,
    protocol: Protocol,
    certs: Rc<CertSource>,
) -> io::Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "{} listening on {}{}",
        protocol.name(),
        listener.local_addr()?,
        if implicit_tls { " (implicit TLS)" } else { "" },
    );

    loop {
        let (sock, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually file descriptor exhaustion; give other
                // connections a chance to finish.
                error!("{} accept failed: {e}", protocol.name());
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            },
        };

        tokio::task::spawn_local(serve_connection(
            sock,
            peer,
            implicit_tls,
            protocol.clone(),
            Rc::clone(&certs),
        ));
    }
}

async fn serve_connection(
    sock: tokio::net::TcpStream,
    peer: SocketAddr,
    implicit_tls: bool,
    protocol: Protocol,
    certs: Rc<CertSource>,
) {
    let peer = client_ip(peer);
    let log_prefix = LogPrefix::new(protocol.name().to_owned());
    log_prefix.set_peer(peer);
    info!("{log_prefix} Connection accepted");

    let io = match sock
        .into_std()
        .map_err(Error::from)
        .and_then(ServerIo::new_owned_socket)
    {
        Ok(io) => io,
        Err(e) => {
            warn!("{log_prefix} Failed to set up connection: {e}");
            return;
        },
    };

    let acceptor = match certs.acceptor() {
        Ok(acceptor) => acceptor,
        Err(e) => {
            error!("{log_prefix} TLS certificate unavailable: {e}");
            None
        },
    };

    let acceptor = if implicit_tls {
        match start_implicit_tls(&io, acceptor, &log_prefix).await {
            Ok(()) => None,
            Err(e) => {
                warn!("{log_prefix} TLS handshake failed: {e}");
                return;
            },
        }
    } else {
        acceptor
    };

    dispatch(io, protocol, log_prefix, acceptor, peer).await;
}

/// The address of the client, with IPv4-mapped IPv6 addresses (as seen on
/// dual-stack sockets) reduced to plain IPv4.
fn client_ip(peer: SocketAddr) -> IpAddr {
    peer.ip().to_canonical()
}

async fn start_implicit_tls(
    io: &ServerIo,
    acceptor: Option<SslAcceptor>,
    log_prefix: &LogPrefix,
) -> Result<(), Error> {
    let acceptor = acceptor.ok_or_else(|| {
        Error::TlsSource("no certificate for implicit TLS".to_owned())
    })?;
    io.ssl_accept(&acceptor).await?;
    log_prefix.set_tls(true);
    info!(
        "{log_prefix} TLS handshake completed: {}",
        io.ssl_string().unwrap_or_default(),
    );
    Ok(())
}

async fn dispatch(
    io: ServerIo,
    protocol: Protocol,
    log_prefix: LogPrefix,
    acceptor: Option<SslAcceptor>,
    peer: IpAddr,
) {
    match protocol {
        Protocol::Smtp(service) => {
            serve_smtp(io, service, log_prefix, acceptor, peer).await
        },
        Protocol::Pop3(service) => {
            serve_pop3(io, service, log_prefix, acceptor, peer).await
        },
    }
}

#[cfg(test)]
mod test {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{Ipv4Addr, Ipv6Addr, TcpStream};

    use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

    use super::*;
    use crate::mail::{test_fixture::Fixture, Services};
    use crate::pop3::lock::MailboxLocks;
    use crate::smtp::outbound::queue::QueueSignal;
    use crate::support::system_config::{
        SystemConfig, TlsConfig, TlsSourceKind,
    };
    use crate::test_data::{CERTIFICATE, CERTIFICATE_PRIVATE_KEY};

    /// Starts a server thread listening on an ephemeral port with both
    /// protocols, returning the SMTP and POP3 addresses.
    fn start_server(
        config: SystemConfig,
        queue: QueueSignal,
        implicit_tls: bool,
    ) -> (SocketAddr, SocketAddr) {
        let smtp = bind("127.0.0.1:0").unwrap();
        let pop3 = bind("127.0.0.1:0").unwrap();
        let addresses =
            (smtp.local_addr().unwrap(), pop3.local_addr().unwrap());

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, async move {
                let log_prefix = LogPrefix::new("listener-test".to_owned());
                let services = Rc::new(
                    Services::open(&log_prefix, &config, queue).unwrap(),
                );
                let certs = Rc::new(CertSource::new(&config.tls));
                let smtp_service = Rc::new(SmtpService {
                    services: Rc::clone(&services),
                    from_hooks: Vec::new(),
                    data_hooks: Vec::new(),
                });
                let pop3_service = Rc::new(Pop3Service {
                    services,
                    locks: MailboxLocks::new(),
                });

                tokio::task::spawn_local(run(
                    smtp,
                    false,
                    Protocol::Smtp(smtp_service),
                    Rc::clone(&certs),
                ));
                run(pop3, implicit_tls, Protocol::Pop3(pop3_service), certs)
                    .await
                    .unwrap();
            });
        });

        addresses
    }

    #[test]
    fn client_ip_unmaps_ipv4() {
        let mapped: SocketAddr = "[::ffff:192.0.2.7]:2525".parse().unwrap();
        assert_eq!(
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
            client_ip(mapped),
        );

        let v6: SocketAddr = "[2001:db8::7]:2525".parse().unwrap();
        assert_eq!(
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7)),
            client_ip(v6),
        );

        let v4: SocketAddr = "192.0.2.7:25".parse().unwrap();
        assert_eq!(v4.ip(), client_ip(v4));
    }

    fn with_tls_files(fixture: &Fixture) -> SystemConfig {
        let dir = fixture.tmpdir.path();
        std::fs::write(dir.join("tls.crt"), CERTIFICATE.to_pem().unwrap())
            .unwrap();
        std::fs::write(
            dir.join("tls.key"),
            CERTIFICATE_PRIVATE_KEY.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap();

        let mut config = fixture.config.clone();
        config.tls = TlsConfig {
            source: TlsSourceKind::Files,
            crt: dir.join("tls.crt"),
            key: dir.join("tls.key"),
            ..TlsConfig::default()
        };
        config
    }

    #[test]
    fn serves_plain_connections() {
        crate::init_test_log();
        let fixture = Fixture::new();
        let (smtp, pop3) =
            start_server(fixture.config.clone(), fixture.queue.clone(), false);

        let mut smtp = BufReader::new(TcpStream::connect(smtp).unwrap());
        let mut line = String::new();
        smtp.read_line(&mut line).unwrap();
        assert!(line.starts_with("220 mx.example.com "), "got {line:?}");
        smtp.get_mut().write_all(b"QUIT\r\n").unwrap();
        line.clear();
        smtp.read_line(&mut line).unwrap();
        assert!(line.starts_with("221 "), "got {line:?}");

        let mut pop3 = BufReader::new(TcpStream::connect(pop3).unwrap());
        line.clear();
        pop3.read_line(&mut line).unwrap();
        assert_eq!("+OK ready\r\n", line);
        pop3.get_mut().write_all(b"QUIT\r\n").unwrap();
        line.clear();
        pop3.read_line(&mut line).unwrap();
        assert_eq!("+OK bye\r\n", line);
    }

    #[test]
    fn implicit_tls_handshake_precedes_greeting() {
        crate::init_test_log();
        let fixture = Fixture::new();
        let config = with_tls_files(&fixture);
        let (_, pop3) = start_server(config, fixture.queue.clone(), true);

        let mut connector =
            SslConnector::builder(SslMethod::tls_client()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);
        let stream = connector
            .build()
            .connect("localhost", TcpStream::connect(pop3).unwrap())
            .unwrap();

        let mut pop3 = BufReader::new(stream);
        let mut line = String::new();
        pop3.read_line(&mut line).unwrap();
        assert_eq!("+OK ready\r\n", line);

        // STLS is meaningless once TLS is already in use
        pop3.get_mut().write_all(b"CAPA\r\n").unwrap();
        let mut capabilities = Vec::new();
        loop {
            line.clear();
            pop3.read_line(&mut line).unwrap();
            if ".\r\n" == line {
                break;
            }
            capabilities.push(line.clone());
        }
        assert!(!capabilities.contains(&"STLS\r\n".to_owned()));
    }

    #[test]
    fn implicit_tls_without_certificate_closes() {
        crate::init_test_log();
        let fixture = Fixture::new();
        let (_, pop3) =
            start_server(fixture.config.clone(), fixture.queue.clone(), true);

        let mut cxn = TcpStream::connect(pop3).unwrap();
        let mut rest = Vec::new();
        let _ = cxn.read_to_end(&mut rest);
        assert!(rest.is_empty());
    }
}
