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

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::rc::Rc;
use std::str;
use std::time::Duration;

use chrono::prelude::*;
use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::super::{
    codes::*,
    hooks::{FromContext, Verdict},
    syntax::*,
};
use super::SmtpService;
use crate::mail::{
    address::{Address, AddressError},
    addressbook::Resolution,
    authenticator::AuthError,
    envelope::Envelope,
    store::MailboxId,
};
use crate::support::{
    async_io::ServerIo, buffer::BufferReader, dot_stuffing::read_dot_stuffed,
    error::Error, log_prefix::LogPrefix,
};

const MAX_LINE: usize = 1024;
const MAX_RECIPIENTS: usize = 100;
/// How much of an oversized message is read and discarded before giving up on
/// the connection.
const DRAIN_SLACK: u64 = 32 * 1024 * 1024;

const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DATA_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// No HELO yet.
    Init,
    /// HELO seen, no transaction in progress.
    Helo,
    /// Got MAIL FROM.
    Mail,
    /// Got at least one RCPT TO.
    Rcpt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

struct Server {
    io: BufStream<ServerIo>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    service: Rc<SmtpService>,

    ineffective_commands: u32,
    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,
    state: State,
    envelope: Envelope,
    /// Header lines produced by the `FromHook`s for the current transaction.
    hook_headers: Vec<String>,
    /// The mailbox the client authenticated as. `Some` makes this a
    /// submission session.
    mailbox: Option<MailboxId>,
}

pub(super) async fn run(
    io: ServerIo,
    service: Rc<SmtpService>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    peer: IpAddr,
) -> Result<(), Error> {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);
    log_prefix.set_peer(peer);
    log_prefix.set_tls(io.is_ssl());

    let mut server = Server {
        io: BufStream::new(io),
        log_prefix,
        ssl_acceptor,
        service,

        ineffective_commands: 0,
        deadline_tx,
        quit: false,
        state: State::Init,
        envelope: Envelope::new(String::new(), peer),
        hook_headers: Vec::new(),
        mailbox: None,
    };

    tokio::select! {
        r = server.run() => r,
        _ = idle_timer(deadline_rx) => {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Connection idle timer expired",
            )))
        },
    }
}

/// Accepts more message data until a limit is reached, then discards the
/// rest until a second limit is reached, after which it fails.
struct LimitedWriter<W> {
    inner: W,
    written: u64,
    limit: u64,
    drain_limit: u64,
    overflowed: bool,
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let end = self.written + src.len() as u64;
        if end > self.drain_limit {
            self.overflowed = true;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "message exceeds drain limit",
            ));
        }

        if end <= self.limit {
            self.inner.write_all(src)?;
        }
        self.written = end;
        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_greeting().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            if let Err(e) = self.run_command(&mut buffer).await {
                if !matches!(e, Error::Io(_)) {
                    error!("{} Aborting session: {e}", self.log_prefix);
                    let _ = self
                        .send_response(
                            Final,
                            pc::ActionAborted,
                            Some((cc::TempFail, sc::OtherMailSystem)),
                            Cow::Borrowed("local error"),
                        )
                        .await;
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        self.extend_deadline(IDLE_TIMEOUT).await;
        buffer.clear();

        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    Cow::Borrowed("Command line too long"),
                )
                .await?;

                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        self.ineffective_commands += 1;
        if self.ineffective_commands > 30 {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::ServiceNotAvailableClosing,
                Some((cc::TempFail, sc::OtherProtocolStatus)),
                Cow::Borrowed("Too many commands issued without sending mail"),
            )
            .await?;
            return Ok(());
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let command_line = &buffer[..buffer.len() - line_ending_len];
        if command_line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let Ok(command_line) = str::from_utf8(command_line) else {
            warn!("{} Non-UTF-8 command received", self.log_prefix);
            return self
                .send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    Cow::Borrowed("Malformed UTF-8"),
                )
                .await;
        };

        let command = match command_line.parse::<Command>() {
            Ok(c) => c,
            Err(e) => {
                let mut debug_line = command_line;
                if let Some((truncate_len, _)) =
                    debug_line.char_indices().nth(64)
                {
                    debug_line = &debug_line[..truncate_len];
                }

                warn!(
                    "{} Received bad command {debug_line:?}",
                    self.log_prefix,
                );

                return if ParseError::BadArguments == e {
                    self.send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommandArguments)),
                        Cow::Borrowed("Unknown command syntax"),
                    )
                    .await
                } else {
                    self.send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommand)),
                        Cow::Borrowed("Unrecognised command"),
                    )
                    .await
                };
            },
        };

        match command {
            Command::Helo(origin) => self.cmd_helo(false, origin).await,
            Command::Ehlo(origin) => self.cmd_helo(true, origin).await,
            Command::Auth(mechanism, data) => {
                self.cmd_auth(mechanism, data).await
            },
            Command::MailFrom(mail) => {
                for warning in mail.warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_mail_from(mail.path, mail.size).await
            },
            Command::Recipient(rcpt) => {
                for warning in rcpt.warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_recipient(rcpt.path).await
            },
            Command::Data => self.cmd_data().await,
            Command::Reset => self.cmd_reset().await,
            Command::Verify => self.cmd_verify().await,
            Command::Noop => self.cmd_noop().await,
            Command::Quit => self.cmd_quit().await,
            Command::StartTls => self.cmd_start_tls().await,
            Command::Http => {
                warn!(
                    "{} Remote is speaking HTTP, closing connection",
                    self.log_prefix,
                );
                self.quit = true;
                Ok(())
            },
        }
    }

    async fn cmd_helo(
        &mut self,
        extended: bool,
        origin: String,
    ) -> Result<(), Error> {
        self.log_prefix.set_helo(origin.clone());
        info!(
            "{} SMTP {}",
            self.log_prefix,
            if extended { "EHLO" } else { "HELO" },
        );

        self.reset_transaction();
        self.envelope.helo = origin;
        self.state = State::Helo;

        let hostname = self.service.services.hostname.clone();
        if !extended {
            return self
                .send_response(Final, pc::Ok, None, Cow::Owned(hostname))
                .await;
        }

        self.send_response(Delayable, pc::Ok, None, Cow::Owned(hostname))
            .await?;

        let mut extensions = vec![
            Cow::Borrowed("8BITMIME"), // RFC 6152
            Cow::Borrowed("AUTH PLAIN LOGIN"),
            Cow::Owned(format!(
                "SIZE {}",
                self.service.services.max_message_size,
            )),
        ];
        // RFC 3207 requires not sending STARTTLS after TLS has been
        // negotiated.
        if self.ssl_acceptor.is_some() && !self.io.get_ref().is_ssl() {
            extensions.push(Cow::Borrowed("STARTTLS"));
        }
        extensions.push(Cow::Borrowed("ENHANCEDSTATUSCODES")); // RFC 2034

        let n = extensions.len();
        for (ix, ext) in extensions.into_iter().enumerate() {
            let kind = Delayable.or_final(ix + 1 == n);
            self.send_response(kind, pc::Ok, None, ext).await?;
        }

        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        data: Option<String>,
    ) -> Result<(), Error> {
        if State::Init == self.state {
            return self.bad_sequence("Say hello first").await;
        }
        if State::Helo != self.state {
            return self
                .bad_sequence("Not allowed during a mail transaction")
                .await;
        }
        if self.mailbox.is_some() {
            return self.bad_sequence("Already authenticated").await;
        }

        let credentials = if mechanism.eq_ignore_ascii_case("PLAIN") {
            self.read_auth_plain(data).await?
        } else if mechanism.eq_ignore_ascii_case("LOGIN") {
            self.read_auth_login(data).await?
        } else {
            warn!(
                "{} Rejected attempt to auth with method {mechanism:?}",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    pc::CommandParemeterNotImplemented,
                    // RFC 4954 requires InvalidCommandArguments here.
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Unsupported AUTH mechanism"),
                )
                .await;
        };

        // The reply has already been sent if there are no credentials.
        let Some((name, password)) = credentials else {
            return Ok(());
        };

        let services = Rc::clone(&self.service.services);
        match services.authenticator.auth(&name, &password).await {
            Ok(mailbox) => {
                info!("{} Authenticated as {name}", self.log_prefix);
                self.log_prefix.set_user(name);
                self.mailbox = Some(mailbox);
                self.send_response(
                    Final,
                    pc::AuthSucceeded,
                    Some((cc::Success, sc::OtherSecurity)),
                    Cow::Borrowed("welcome"),
                )
                .await
            },

            Err(AuthError::WrongAddressPassword) => {
                warn!("{} Failed login as {name:?}", self.log_prefix);
                self.send_response(
                    Final,
                    pc::AuthCredentialsInvalid,
                    Some((cc::PermFail, sc::AuthCredentialsInvalid)),
                    Cow::Borrowed("wrong address or password"),
                )
                .await
            },

            Err(AuthError::Store(e)) => Err(e),
        }
    }

    /// Reads RFC 4616 `PLAIN` credentials from `data`, or from the next line
    /// if `data` is absent.
    ///
    /// If this returns `None`, the reply to the client has already been
    /// sent.
    async fn read_auth_plain(
        &mut self,
        data: Option<String>,
    ) -> Result<Option<(String, String)>, Error> {
        let data = match data {
            Some(data) if data != "=" => data,
            _ => match self.challenge("").await? {
                Some(data) => data,
                None => return Ok(None),
            },
        };

        let Some(data) = self.decode_auth_data(&data).await? else {
            return Ok(None);
        };

        // Format is <authorise-id>NUL<authenticate-id>NUL<password>
        // <authorise-id> is optional if it is the same as <authenticate-id>.
        let mut parts = data.split('\x00');
        let (Some(authorise), Some(authenticate), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Some((cc::PermFail, sc::SyntaxError)),
                Cow::Borrowed("Invalid auth syntax"),
            )
            .await?;
            return Ok(None);
        };

        if !authorise.is_empty() && authorise != authenticate {
            self.send_response(
                Final,
                pc::AuthCredentialsInvalid,
                Some((cc::PermFail, sc::AuthCredentialsInvalid)),
                Cow::Borrowed("authorise-id must match authenticate-id"),
            )
            .await?;
            return Ok(None);
        }

        Ok(Some((authenticate.to_owned(), password.to_owned())))
    }

    /// Reads `LOGIN` credentials, prompting for whatever `data` did not
    /// provide.
    async fn read_auth_login(
        &mut self,
        data: Option<String>,
    ) -> Result<Option<(String, String)>, Error> {
        let user = match data {
            Some(data) => data,
            None => match self.challenge("VXNlcm5hbWU6").await? {
                Some(data) => data,
                None => return Ok(None),
            },
        };
        let Some(user) = self.decode_auth_data(&user).await? else {
            return Ok(None);
        };

        let Some(password) = self.challenge("UGFzc3dvcmQ6").await? else {
            return Ok(None);
        };
        let Some(password) = self.decode_auth_data(&password).await? else {
            return Ok(None);
        };

        Ok(Some((user, password)))
    }

    /// Sends a `334` challenge and reads the client's answer.
    ///
    /// Returns `None` if the client cancelled the exchange, in which case
    /// the reply has been sent.
    async fn challenge(
        &mut self,
        prompt: &'static str,
    ) -> Result<Option<String>, Error> {
        self.send_response(
            Final,
            pc::AuthContinue,
            None,
            Cow::Borrowed(prompt),
        )
        .await?;

        let mut buffer = Vec::new();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buffer)
            .await?;

        if !buffer.ends_with(b"\n") {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Authentication line too long or truncated",
            )));
        }

        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }

        let answer = String::from_utf8_lossy(&buffer).into_owned();
        if "*" == answer {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Some((cc::PermFail, sc::OtherSecurity)),
                Cow::Borrowed("authentication cancelled"),
            )
            .await?;
            return Ok(None);
        }

        Ok(Some(answer))
    }

    async fn decode_auth_data(
        &mut self,
        data: &str,
    ) -> Result<Option<String>, Error> {
        let decoded = base64::decode(data)
            .ok()
            .and_then(|d| String::from_utf8(d).ok());
        if decoded.is_none() {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Some((cc::PermFail, sc::SyntaxError)),
                Cow::Borrowed("Invalid base64"),
            )
            .await?;
        }

        Ok(decoded)
    }

    async fn cmd_mail_from(
        &mut self,
        return_path: String,
        approx_size: Option<u64>,
    ) -> Result<(), Error> {
        match self.state {
            State::Helo | State::Mail => {},
            State::Init => return self.bad_sequence("Say hello first").await,
            State::Rcpt => {
                return self.bad_sequence("Already have recipients").await
            },
        }

        let from = if return_path.is_empty() {
            None
        } else {
            match Address::parse(&return_path) {
                Ok(address) => Some(address),
                Err(e) => {
                    return self
                        .reject_address(e, sc::BadSenderMailboxAddressSyntax)
                        .await
                },
            }
        };

        let services = Rc::clone(&self.service.services);
        let resolution = match from {
            Some(ref from) => services.addressbook.lookup(from)?,
            None => Resolution::NonLocal,
        };
        let plausible = match self.mailbox {
            Some(mailbox) => Resolution::Local(mailbox) == resolution,
            None => !resolution.is_local(),
        };
        if !plausible {
            warn!(
                "{} Rejected sender <{return_path}> (submission: {})",
                self.log_prefix,
                self.mailbox.is_some(),
            );
            return self
                .send_response(
                    Final,
                    pc::AuthRequired,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Borrowed("that does not sound like you"),
                )
                .await;
        }

        let max_size = services.max_message_size;
        if 0 != max_size && approx_size.unwrap_or(0) > max_size {
            return self
                .send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    Some((cc::PermFail, sc::MessageTooBigForSystem)),
                    Cow::Owned(format!(
                        "Maximum message size is {max_size} bytes",
                    )),
                )
                .await;
        }

        let service = Rc::clone(&self.service);
        let mut headers = Vec::new();
        for hook in &service.from_hooks {
            let cx = FromContext {
                is_submission: self.mailbox.is_some(),
                remote_ip: self.envelope.remote_ip,
                helo: &self.envelope.helo,
                from: from.as_ref(),
            };
            match hook.check(cx).await {
                Ok(Verdict::Accept(more)) => headers.extend(more),
                Ok(Verdict::Reject(rejection)) => {
                    info!(
                        "{} Sender <{return_path}> rejected: {}",
                        self.log_prefix, rejection.text,
                    );
                    return self
                        .send_response(
                            Final,
                            rejection.code,
                            Some((rejection.code.class(), rejection.subject)),
                            Cow::Owned(rejection.text),
                        )
                        .await;
                },
                Err(e) => {
                    warn!("{} Sender check failed: {e}", self.log_prefix);
                    return self
                        .send_response(
                            Final,
                            pc::ActionAborted,
                            Some((cc::TempFail, sc::DirectoryServerFailure)),
                            Cow::Borrowed("try again later"),
                        )
                        .await;
                },
            }
        }

        info!("{} Start mail transaction", self.log_prefix);
        self.ineffective_commands = 0;
        self.reset_transaction();
        self.envelope.from = from;
        self.hook_headers = headers;
        self.state = State::Mail;
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::OtherAddressStatus)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_recipient(
        &mut self,
        forward_path: String,
    ) -> Result<(), Error> {
        match self.state {
            State::Mail | State::Rcpt => {},
            State::Init | State::Helo => {
                return self.bad_sequence("Still waiting for MAIL FROM").await
            },
        }

        if self.envelope.to.len() >= MAX_RECIPIENTS {
            return self
                .send_response(
                    Final,
                    pc::InsufficientStorage,
                    Some((cc::TempFail, sc::TooManyRecipients)),
                    Cow::Borrowed("too many recipients"),
                )
                .await;
        }

        let to = match Address::parse(&forward_path) {
            Ok(to) => to,
            Err(e) => {
                return self
                    .reject_address(e, sc::BadDestinationMailboxAddressSyntax)
                    .await
            },
        };

        if self.mailbox.is_none() {
            let resolution = self.service.services.addressbook.lookup(&to)?;
            if !matches!(resolution, Resolution::Local(_)) {
                info!(
                    "{} Rejected recipient <{forward_path}>",
                    self.log_prefix,
                );
                return self
                    .send_response(
                        Final,
                        pc::ActionNotTakenPermanent,
                        Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
                        Cow::Borrowed("never heard of that person"),
                    )
                    .await;
            }
        }

        self.ineffective_commands = 0;
        self.envelope.to.push(to);
        self.state = State::Rcpt;
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::DestinationAddressValid)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        match self.state {
            State::Rcpt => {},
            State::Init | State::Helo => {
                return self.bad_sequence("Still waiting for MAIL FROM").await
            },
            State::Mail => return self.bad_sequence("No recipients").await,
        }

        self.ineffective_commands = 0;
        self.send_response(
            Final,
            pc::StartMailInput,
            None,
            Cow::Borrowed("go ahead"),
        )
        .await?;

        info!("{} Begin data transfer", self.log_prefix);
        self.envelope.date = Utc::now();
        self.extend_deadline(DATA_TIMEOUT).await;

        let services = Rc::clone(&self.service.services);
        let limit = match services.max_message_size {
            0 => u64::MAX,
            n => n,
        };
        let mut writer = LimitedWriter {
            inner: services.cache.writer(),
            written: 0,
            limit,
            drain_limit: limit.saturating_add(DRAIN_SLACK),
            overflowed: false,
        };

        let result = read_dot_stuffed(&mut writer, &mut self.io).await;
        if writer.overflowed {
            warn!(
                "{} Message exceeds {} bytes, giving up on the connection",
                self.log_prefix, writer.drain_limit,
            );
            self.send_response(
                Final,
                pc::ExceededStorageAllocation,
                Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                Cow::Borrowed("message too big"),
            )
            .await?;
            self.quit = true;
            return Ok(());
        }
        let size = result?;

        self.state = State::Helo;
        if size > limit {
            info!(
                "{} Rejected message of {size} bytes as too big",
                self.log_prefix,
            );
            self.reset_transaction();
            return self
                .send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                    Cow::Owned(format!(
                        "Maximum message size is {limit} bytes"
                    )),
                )
                .await;
        }

        let body = writer.inner.flip()?;
        let result = self.deliver(body).await;
        self.reset_transaction();
        result
    }

    /// Runs the `DataHook`s over `body`, then hands the message to the
    /// mailman and replies.
    async fn deliver(&mut self, mut body: BufferReader) -> Result<(), Error> {
        let service = Rc::clone(&self.service);
        let mut headers = std::mem::take(&mut self.hook_headers);
        for hook in &service.data_hooks {
            body.rewind()?;
            match hook.check(self.mailbox.is_some(), &mut body).await {
                Ok(Verdict::Accept(more)) => headers.extend(more),
                Ok(Verdict::Reject(rejection)) => {
                    info!(
                        "{} Message rejected: {}",
                        self.log_prefix, rejection.text,
                    );
                    return self
                        .send_response(
                            Final,
                            rejection.code,
                            Some((rejection.code.class(), rejection.subject)),
                            Cow::Owned(rejection.text),
                        )
                        .await;
                },
                Err(e) => {
                    warn!("{} Message check failed: {e}", self.log_prefix);
                    return self
                        .send_response(
                            Final,
                            pc::ActionAborted,
                            Some((cc::TempFail, sc::OtherMailSystem)),
                            Cow::Borrowed("try again later"),
                        )
                        .await;
                },
            }
        }
        body.rewind()?;

        let services = &service.services;
        headers.push(format!(
            "Received: from {} ({}) by {}; {}",
            self.envelope.helo,
            self.envelope.remote_ip,
            services.hostname,
            self.envelope.date.format("%a, %d %b %Y %H:%M:%S %z"),
        ));
        headers.push(format!("Return-Path: <{}>", self.envelope.return_path()));

        let mut prefix = String::new();
        for header in headers {
            prefix.push_str(&header);
            prefix.push_str("\r\n");
        }

        let mut content = Read::chain(io::Cursor::new(prefix.into_bytes()), body);
        match services.mailman.deliver(&self.envelope, &mut content) {
            Ok(id) => {
                info!(
                    "{} Accepted mail {id} from <{}> for {} recipient(s)",
                    self.log_prefix,
                    self.envelope.return_path(),
                    self.envelope.to.len(),
                );
                self.send_response(
                    Final,
                    pc::Ok,
                    Some((cc::Success, sc::Undefined)),
                    Cow::Owned(format!("queued as {id}")),
                )
                .await
            },

            Err(Error::UnknownLocalAddress(address)) => {
                info!(
                    "{} Message to unknown local address {address} refused",
                    self.log_prefix,
                );
                self.send_response(
                    Final,
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
                    Cow::Owned(format!("never heard of {address}")),
                )
                .await
            },

            Err(e) => Err(e),
        }
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        if State::Init != self.state {
            self.state = State::Helo;
        }
        self.reset_transaction();
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_verify(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::CannotVerify,
            Some((cc::Success, sc::OtherSecurity)),
            Cow::Borrowed("maybe"),
        )
        .await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .send_response(
                Final,
                pc::ServiceClosing,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("bye"),
            )
            .await;
        Ok(())
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        if self.io.get_ref().is_ssl() {
            return self
                .send_response(
                    Final,
                    pc::TemporaryAuthFailure,
                    Some((cc::TempFail, sc::OtherSecurity)),
                    Cow::Borrowed("Already using TLS"),
                )
                .await;
        }

        let Some(ssl_acceptor) = self.ssl_acceptor.take() else {
            return self
                .send_response(
                    Final,
                    pc::TemporaryAuthFailure,
                    Some((cc::TempFail, sc::SecurityFeaturesNotSupported)),
                    Cow::Borrowed("TLS not available"),
                )
                .await;
        };

        self.send_response(
            Final,
            pc::ServiceReady,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("ready"),
        )
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);
        self.io.get_mut().ssl_accept(&ssl_acceptor).await?;
        info!(
            "{} TLS handshake completed: {}",
            self.log_prefix,
            self.io.get_ref().ssl_string().unwrap_or_default(),
        );

        // RFC 3207: forget everything learnt before the handshake.
        self.log_prefix.set_tls(true);
        self.log_prefix.clear_user();
        self.state = State::Init;
        self.mailbox = None;
        self.envelope.helo.clear();
        self.reset_transaction();

        Ok(())
    }

    fn reset_transaction(&mut self) {
        self.envelope.clear();
        self.hook_headers.clear();
    }

    async fn reject_address(
        &mut self,
        error: AddressError,
        subject: SubjectCode,
    ) -> Result<(), Error> {
        let code = match error {
            AddressError::InvalidAddress => pc::MailboxNameNotAllowed,
            AddressError::PathTooLong => pc::ParameterSyntaxError,
        };
        self.send_response(
            Final,
            code,
            Some((cc::PermFail, subject)),
            Cow::Owned(error.to_string()),
        )
        .await
    }

    async fn bad_sequence(&mut self, message: &str) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::BadSequenceOfCommands,
            Some((cc::PermFail, sc::InvalidCommand)),
            Cow::Borrowed(message),
        )
        .await
    }

    async fn extend_deadline(&mut self, timeout: Duration) {
        let _ = self.deadline_tx.send(Instant::now() + timeout).await;
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        let greeting = format!("{} ready", self.service.services.hostname);
        self.send_response(Final, pc::ServiceReady, None, Cow::Owned(greeting))
            .await
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        primary_code: PrimaryCode,
        secondary_code: Option<(ClassCode, SubjectCode)>,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        if primary_code == pc::ServiceClosing
            || primary_code == pc::ServiceNotAvailableClosing
        {
            self.quit = true;
        }

        let mut s = String::new();
        let _ = write!(s, "{}{}", primary_code as u16, kind.indicator());
        if let Some((class, subject)) = secondary_code {
            let _ = write!(s, "{} ", EnhancedCode(class, subject));
        }

        let _ = write!(s, "{}\r\n", quip);

        self.io.write_all(s.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }
}

async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + IDLE_TIMEOUT;

    loop {
        match tokio::time::timeout_at(deadline, deadline_rx.recv()).await {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}
