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

use std::io::{self, BufRead, Read, Write};
use std::mem;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

use super::{serve_smtp, SmtpService};
use crate::mail::{test_fixture::Fixture, Services};
use crate::smtp::outbound::queue::QueueSignal;
use crate::support::{
    async_io::ServerIo, cert_source::test_acceptor, log_prefix::LogPrefix,
    system_config::SystemConfig,
};

/// The address every test client appears to connect from.
pub const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 3));

pub trait ReadWrite: Read + Write + std::fmt::Debug {}
impl<T: Read + Write + std::fmt::Debug + ?Sized> ReadWrite for T {}

/// Starts an SMTP session against the data directory of `fixture` on a
/// new thread and returns the client end.
///
/// The server thread opens its own `Services`, but shares the queue signal
/// with the fixture.
pub fn connect_smtp(fixture: &Fixture, name: &'static str) -> SmtpClient {
    let (server_io, client_io) = UnixStream::pair().unwrap();
    let config = fixture.config.clone();
    let queue = fixture.queue.clone();

    std::thread::spawn(move || run_server(config, queue, name, server_io));
    SmtpClient::new(name, client_io)
}

#[tokio::main(flavor = "current_thread")]
async fn run_server(
    config: SystemConfig,
    queue: QueueSignal,
    name: &'static str,
    server_io: UnixStream,
) {
    let log_prefix = LogPrefix::new(format!("smtp-{name}"));
    let services =
        Rc::new(Services::open(&log_prefix, &config, queue).unwrap());
    let service = Rc::new(SmtpService {
        services,
        from_hooks: Vec::new(),
        data_hooks: Vec::new(),
    });

    let io = ServerIo::new_owned_socket(server_io).unwrap();
    serve_smtp(io, service, log_prefix, Some(test_acceptor()), CLIENT_IP)
        .await;
}

/// A blocking SMTP client which panics on anything unexpected.
pub struct SmtpClient {
    name: &'static str,
    io: io::BufReader<Box<dyn ReadWrite>>,
}

impl SmtpClient {
    pub fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        let io: Box<dyn ReadWrite> = Box::new(io);
        Self {
            name,
            io: io::BufReader::new(io),
        }
    }

    fn log(&self, direction: &str, what: impl std::fmt::Debug) {
        println!("[{}] {direction} {what:?}", self.name);
    }

    /// Reads one reply, which may span several lines. Each element of the
    /// result is one line including its line ending.
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut lines = Vec::<String>::new();
        loop {
            let mut line = String::new();
            self.io.read_line(&mut line).unwrap();
            self.log(">>", &line);
            assert!(!line.is_empty(), "server hung up mid-reply");

            let more = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);
            if !more {
                return lines;
            }
        }
    }

    /// Returns whether the server has closed the connection, consuming
    /// anything it sent before doing so.
    pub fn at_eof(&mut self) -> bool {
        let mut rest = Vec::new();
        match self.io.read_to_end(&mut rest) {
            Ok(_) => true,
            Err(e) => io::ErrorKind::ConnectionReset == e.kind(),
        }
    }

    /// Sends `s`, which must consist of complete lines.
    pub fn write_line(&mut self, s: &str) {
        assert!(s.ends_with('\n'), "incomplete line: {s:?}");
        s.split_inclusive('\n').for_each(|line| self.log("<<", line));
        self.io.get_mut().write_all(s.as_bytes()).unwrap();
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.log("<<", format_args!("[{} bytes]", data.len()));
        self.io.get_mut().write_all(data).unwrap();
    }

    /// Consumes the greeting, then sends `cmd` and requires it to succeed.
    pub fn skip_pleasantries(&mut self, cmd: &str) {
        self.read_responses();
        self.expect_ok(cmd);
    }

    fn expect_ok(&mut self, cmd: &str) -> Vec<String> {
        self.write_line(&format!("{cmd}\r\n"));
        let reply = self.read_responses();
        assert!(reply[0].starts_with("250"), "{cmd} failed: {reply:?}");
        reply
    }

    /// Sends `command` and requires a single-line reply starting with
    /// `prefix`.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{command}\r\n"));
        match &self.read_responses()[..] {
            [line] => assert!(
                line.starts_with(prefix),
                "{command}: expected {prefix:?}, got {line:?}",
            ),
            reply => panic!("{command}: unexpected reply {reply:?}"),
        }
    }

    /// Replaces the cleartext stream with a TLS client stream.
    pub fn start_tls(&mut self) {
        assert!(self.io.buffer().is_empty(), "data ahead of TLS handshake");

        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);

        self.log("<>", "TLS handshake");
        let cleartext = mem::replace(self.io.get_mut(), Box::new(io::empty()));
        let tls = match connector.build().connect("localhost", cleartext) {
            Ok(tls) => tls,
            Err(e) => panic!("TLS handshake failed: {e}"),
        };
        *self.io.get_mut() = Box::new(tls);
    }

    /// Consumes the greeting, sends `command`, upgrades to TLS, and sends
    /// `command` again.
    pub fn skip_pleasantries_with_tls(&mut self, command: &str) {
        self.skip_pleasantries(command);
        self.simple_command("STARTTLS", "220 2.0.0");
        self.start_tls();
        self.expect_ok(command);
    }

    /// Does everything up to and including a successful `AUTH PLAIN` as
    /// `user`.
    pub fn quick_log_in(&mut self, helo: &str, user: &str, password: &str) {
        self.skip_pleasantries_with_tls(helo);
        let token = base64::encode(format!("\0{user}\0{password}"));
        self.simple_command(&format!("AUTH PLAIN {token}"), "235 ");
    }

    /// Sends `MAIL FROM`, `RCPT TO` for each recipient, and `DATA` with
    /// `body` (which must already be dot-stuffed), returning the final
    /// response.
    pub fn send_mail(
        &mut self,
        from: &str,
        to: &[&str],
        body: &str,
    ) -> String {
        self.simple_command(&format!("MAIL FROM:<{from}>"), "250 2.1.0");
        for to in to {
            self.simple_command(&format!("RCPT TO:<{to}>"), "250 2.1.5");
        }
        self.simple_command("DATA", "354 ");
        self.write_raw(body.as_bytes());
        self.write_line(".\r\n");

        let mut reply = self.read_responses();
        assert_eq!(1, reply.len(), "multi-line reply to message: {reply:?}");
        reply.remove(0)
    }
}
