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


//! The client side of one SMTP mail transaction.

use std::fmt::{self, Write as _};
use std::io;
use std::time::Duration;

use log::{debug, info};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;

use crate::support::{
    async_io::ServerIo, dot_stuffing::write_dot_stuffed, log_prefix::LogPrefix,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Nothing was decided on this connection; another server for the domain
    /// may do better.
    TryNextServer,
    /// The server refused the mail with a temporary error. Other servers
    /// are not tried.
    ///
    /// If the failure came after the recipients were sent, this holds the
    /// outcome of each `RCPT TO`; otherwise it is empty. Recipients refused
    /// permanently stay refused even though the mail as a whole is deferred.
    TempFailure(Vec<RecipientOutcome>),
    /// The server refused the mail permanently.
    TotalFailure,
}

/// The fate of one recipient in a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecipientOutcome {
    /// Accepted by `RCPT TO` and then by the final `DATA` reply.
    Delivered,
    TempFail,
    PermFail,
}

/// The message to be sent.
pub struct Message<'a> {
    /// The reverse-path, empty for the null path.
    pub return_path: &'a str,
    pub size: u64,
    pub data: &'a mut dyn io::BufRead,
}

/// Runs one mail transaction over `cxn`, from reading the greeting to
/// `QUIT`.
///
/// On success, the result has one element per element of `destinations`.
pub async fn execute(
    cxn: ServerIo,
    log_prefix: &LogPrefix,
    message: Message<'_>,
    destinations: &[&str],
    mx_host: &str,
    local_host_name: &str,
) -> Result<Vec<RecipientOutcome>, Error> {
    let mut client = Client {
        io: BufReader::new(cxn),
        log_prefix,
        mx_host,
        deadline: Instant::now() + COMMAND_TIMEOUT,
    };

    let result = client
        .converse(local_host_name, message, destinations)
        .await;
    client.close().await;
    result
}

const MAX_LINE: u64 = 1024;
/// A server sending more reply lines than this is assumed to be broken.
const MAX_REPLY_LINES: usize = 256;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a failure reply is taken to refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    /// The server as a whole, e.g. the greeting.
    Server,
    /// This particular mail.
    Mail,
}

/// A complete, possibly multi-line, reply.
#[derive(Debug, Default, PartialEq, Eq)]
struct Reply {
    code: u16,
    /// The text of each line, after the code and separator.
    lines: Vec<String>,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..=399).contains(&self.code)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Capabilities {
    starttls: bool,
    size: bool,
    max_size: Option<u64>,
}

impl Capabilities {
    fn from_ehlo(reply: &Reply) -> Self {
        let mut capabilities = Capabilities::default();

        // The first line is the server's greeting, not a keyword
        for line in reply.lines.iter().skip(1) {
            let (keyword, param) =
                line.split_once(' ').unwrap_or((line.as_str(), ""));
            if keyword.eq_ignore_ascii_case("STARTTLS") {
                capabilities.starttls = true;
            } else if keyword.eq_ignore_ascii_case("SIZE") {
                capabilities.size = true;
                // 0 means there is no limit
                capabilities.max_size =
                    param.trim().parse::<u64>().ok().filter(|&s| s > 0);
            }
        }

        capabilities
    }
}

struct Client<'a> {
    io: BufReader<ServerIo>,
    log_prefix: &'a LogPrefix,
    mx_host: &'a str,
    deadline: Instant,
}

impl Client<'_> {
    async fn converse(
        &mut self,
        local_host_name: &str,
        message: Message<'_>,
        destinations: &[&str],
    ) -> Result<Vec<RecipientOutcome>, Error> {
        self.expect(Scope::Server).await?;
        let capabilities = self.greet(local_host_name).await?;
        let capabilities = self.start_tls(local_host_name, capabilities).await?;
        let outcomes = self
            .transfer(capabilities, message, destinations)
            .await?;

        // Only courtesy from here on
        if self.send("QUIT").await.is_ok() {
            let _ = self.read_reply().await;
        }

        Ok(outcomes)
    }

    /// Sends the TLS close notification, if TLS is up, so the server sees a
    /// clean end of stream.
    async fn close(&mut self) {
        if !self.io.get_ref().is_ssl() {
            return;
        }

        let deadline = Instant::now() + CLOSE_TIMEOUT;
        match tokio::time::timeout_at(deadline, self.io.shutdown()).await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                debug!("{} TLS shutdown failed: {e}", self.log_prefix)
            },
            Err(_) => debug!("{} TLS shutdown timed out", self.log_prefix),
        }
    }

    /// Sends `EHLO`, falling back to `HELO` if the server does not
    /// understand it.
    async fn greet(
        &mut self,
        local_host_name: &str,
    ) -> Result<Capabilities, Error> {
        self.send(&format!("EHLO {local_host_name}")).await?;
        let reply = self.read_reply().await?;
        match reply.code {
            200..=299 => return Ok(Capabilities::from_ehlo(&reply)),
            500..=504 | 550 => (),
            code => return Err(self.failure(code, Scope::Server)),
        }

        self.send(&format!("HELO {local_host_name}")).await?;
        self.expect(Scope::Server).await?;
        Ok(Capabilities::default())
    }

    /// Upgrades to TLS if the server offers it, returning the capabilities
    /// that apply afterwards.
    ///
    /// Certificates are not verified, since MX hosts commonly present ones
    /// that would not pass.
    async fn start_tls(
        &mut self,
        local_host_name: &str,
        capabilities: Capabilities,
    ) -> Result<Capabilities, Error> {
        if !capabilities.starttls {
            self.note(format_args!("Server does not offer STARTTLS"));
            return Ok(capabilities);
        }

        self.send("STARTTLS").await?;
        let reply = self.read_reply().await?;
        if 220 != reply.code {
            self.note(format_args!(
                "STARTTLS refused with {}; staying in cleartext",
                reply.code,
            ));
            return Ok(capabilities);
        }

        if !self.io.buffer().is_empty() {
            self.note(format_args!("Server sent data before TLS handshake"));
            return Err(Error::TryNextServer);
        }

        let mut connector = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| self.tls_failure(e))?;
        connector.set_verify(SslVerifyMode::NONE);
        let config = connector
            .build()
            .configure()
            .map_err(|e| self.tls_failure(e))?;

        match tokio::time::timeout_at(
            self.deadline,
            self.io.get_ref().ssl_connect(config, self.mx_host),
        )
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(e)) => return Err(self.tls_failure(e)),
            Err(_) => return Err(self.tls_failure("timed out")),
        }

        self.note(format_args!(
            "TLS established: {}",
            self.io.get_ref().ssl_string().unwrap_or_default(),
        ));

        // Anything learnt before the handshake is void
        self.send(&format!("EHLO {local_host_name}")).await?;
        let reply = self.read_reply().await?;
        if (200..=299).contains(&reply.code) {
            Ok(Capabilities::from_ehlo(&reply))
        } else {
            Err(self.failure(reply.code, Scope::Server))
        }
    }

    /// Sends the envelope and, if any recipient was accepted, the message.
    async fn transfer(
        &mut self,
        capabilities: Capabilities,
        message: Message<'_>,
        destinations: &[&str],
    ) -> Result<Vec<RecipientOutcome>, Error> {
        if let Some(max_size) = capabilities.max_size {
            if message.size > max_size {
                self.note(format_args!(
                    "Message of {} bytes exceeds the server limit of {}",
                    message.size, max_size,
                ));
                return Err(Error::TotalFailure);
            }
        }

        let mut mail_from = format!("MAIL FROM:<{}>", message.return_path);
        if capabilities.size {
            let _ = write!(mail_from, " SIZE={}", message.size);
        }
        self.send(&mail_from).await?;
        self.expect(Scope::Mail).await?;

        let mut outcomes = Vec::with_capacity(destinations.len());
        for destination in destinations {
            self.send(&format!("RCPT TO:<{destination}>")).await?;
            let reply = self.read_reply().await?;
            outcomes.push(match reply.code {
                200..=299 => RecipientOutcome::Delivered,
                500..=599 => RecipientOutcome::PermFail,
                _ => RecipientOutcome::TempFail,
            });
        }

        if !outcomes.contains(&RecipientOutcome::Delivered) {
            self.note(format_args!("No recipient was accepted"));
            return Ok(outcomes);
        }

        match self.send_data(message).await {
            Ok(()) => Ok(outcomes),
            Err(Error::TempFailure(_)) => Err(Error::TempFailure(outcomes)),
            Err(e) => Err(e),
        }
    }

    async fn send_data(
        &mut self,
        mut message: Message<'_>,
    ) -> Result<(), Error> {
        self.send("DATA").await?;
        let reply = self.read_reply().await?;
        // Some servers answer DATA with 250 instead of 354
        if !reply.is_positive() {
            return Err(self.failure(reply.code, Scope::Mail));
        }

        // Allow for a transfer rate of 32 kbps on top of the usual timeout
        self.deadline = Instant::now()
            + COMMAND_TIMEOUT
            + Duration::from_millis(message.size / 4);
        match tokio::time::timeout_at(
            self.deadline,
            write_dot_stuffed(&mut self.io, &mut message.data),
        )
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                self.note(format_args!("I/O error sending message: {e}"));
                return Err(Error::TryNextServer);
            },
            Err(_) => {
                self.note(format_args!("Timed out sending message"));
                return Err(Error::TryNextServer);
            },
        }
        debug!("{} << [{} bytes]", self.log_prefix, message.size);

        self.expect(Scope::Mail).await?;
        Ok(())
    }

    /// Sends `command`, which excludes the line ending.
    async fn send(&mut self, command: &str) -> Result<(), Error> {
        debug!("{} << {command}", self.log_prefix);
        self.deadline = Instant::now() + COMMAND_TIMEOUT;

        let line = format!("{command}\r\n");
        let io = &mut self.io;
        let write = async move {
            io.write_all(line.as_bytes()).await?;
            io.flush().await
        };
        match tokio::time::timeout_at(self.deadline, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.note(format_args!("I/O error sending command: {e}"));
                Err(Error::TryNextServer)
            },
            Err(_) => {
                self.note(format_args!("Timed out sending command"));
                Err(Error::TryNextServer)
            },
        }
    }

    /// Reads a reply and fails unless it is positive.
    async fn expect(&mut self, scope: Scope) -> Result<Reply, Error> {
        let reply = self.read_reply().await?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(self.failure(reply.code, scope))
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, Error> {
        let mut reply = Reply::default();
        while reply.lines.len() < MAX_REPLY_LINES {
            let line = self.read_line().await?;
            let Some((code, last, text)) = parse_reply_line(&line) else {
                self.note(format_args!("Bad SMTP reply: {line:?}"));
                return Err(Error::TryNextServer);
            };

            if !reply.lines.is_empty() && code != reply.code {
                self.note(format_args!("Inconsistent multi-line reply"));
                return Err(Error::TryNextServer);
            }

            reply.code = code;
            reply.lines.push(text.to_owned());
            if last {
                return Ok(reply);
            }
        }

        self.note(format_args!("Reply has too many lines"));
        Err(Error::TryNextServer)
    }

    async fn read_line(&mut self) -> Result<String, Error> {
        let mut buffer = Vec::new();
        let mut limited = (&mut self.io).take(MAX_LINE);
        let read = limited.read_until(b'\n', &mut buffer);
        match tokio::time::timeout_at(self.deadline, read).await {
            Ok(Ok(0)) => {
                self.note(format_args!("Connection closed by server"));
                Err(Error::TryNextServer)
            },
            Ok(Ok(_)) if !buffer.ends_with(b"\n") => {
                self.note(format_args!("Reply line too long"));
                Err(Error::TryNextServer)
            },
            Ok(Ok(_)) => {
                let line = String::from_utf8_lossy(&buffer)
                    .trim_end_matches(['\r', '\n'])
                    .to_owned();
                debug!("{} >> {line:?}", self.log_prefix);
                Ok(line)
            },
            Ok(Err(e)) => {
                self.note(format_args!("I/O error reading reply: {e}"));
                Err(Error::TryNextServer)
            },
            Err(_) => {
                self.note(format_args!("Timed out waiting for reply"));
                Err(Error::TryNextServer)
            },
        }
    }

    /// Maps a negative reply code to an error, logging it.
    fn failure(&self, code: u16, scope: Scope) -> Error {
        match (code, scope) {
            (400..=499, Scope::Server) => {
                self.note(format_args!("Server unavailable ({code})"));
                Error::TempFailure(Vec::new())
            },
            (400..=499, Scope::Mail) => {
                self.note(format_args!("Mail deferred ({code})"));
                Error::TempFailure(Vec::new())
            },
            (500..=599, Scope::Server) => {
                self.note(format_args!("Server refuses service ({code})"));
                Error::TotalFailure
            },
            (500..=599, Scope::Mail) => {
                self.note(format_args!("Mail rejected ({code})"));
                Error::TotalFailure
            },
            _ => {
                self.note(format_args!("Unexpected reply code {code}"));
                Error::TryNextServer
            },
        }
    }

    fn tls_failure(&self, e: impl fmt::Display) -> Error {
        self.note(format_args!("TLS handshake failed: {e}"));
        Error::TryNextServer
    }

    fn note(&self, args: fmt::Arguments<'_>) {
        info!("{} [{}] {}", self.log_prefix, self.mx_host, args);
    }
}

/// Splits a reply line into its code, whether it is the last line, and its
/// text.
fn parse_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let code = line.get(..3)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let last = match line.get(3..4) {
        None | Some(" ") => true,
        Some("-") => false,
        Some(_) => return None,
    };

    Some((code.parse().ok()?, last, line.get(4..).unwrap_or("")))
}
