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
use std::io;
use std::net::IpAddr;
use std::rc::Rc;
use std::str;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::lock::MailboxLock;
use super::syntax::{Command, ParseError};
use super::Pop3Service;
use crate::mail::{authenticator::AuthError, inboxer::Inbox};
use crate::support::{
    async_io::ServerIo, dot_stuffing::write_dot_stuffed, error::Error,
    log_prefix::LogPrefix,
};

/// RFC 2449 allows 255 octets; some clients send long passwords anyway.
const MAX_LINE: usize = 1024;
const TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Consecutive failed commands tolerated before hanging up.
const MAX_ERRORS: u32 = 20;

enum State {
    /// AUTHORIZATION state, no name given yet.
    Init,
    /// AUTHORIZATION state after `USER`.
    User(String),
    Transaction(Transaction),
}

struct Transaction {
    inbox: Inbox,
    _lock: MailboxLock,
}

struct Server {
    /// Declared first so that the mailbox lock is released before the
    /// connection is closed.
    state: State,
    io: BufStream<ServerIo>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    service: Rc<Pop3Service>,

    deadline_tx: mpsc::Sender<Instant>,
    errors: u32,
    quit: bool,
}

pub(super) async fn run(
    io: ServerIo,
    service: Rc<Pop3Service>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    peer: IpAddr,
) -> Result<(), Error> {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);
    log_prefix.set_peer(peer);
    log_prefix.set_tls(io.is_ssl());

    let mut server = Server {
        state: State::Init,
        io: BufStream::new(io),
        log_prefix,
        ssl_acceptor,
        service,

        deadline_tx,
        errors: 0,
        quit: false,
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

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        self.ok("ready").await?;

        let mut buffer = Vec::new();
        while !self.quit {
            if let Err(e) = self.run_command(&mut buffer).await {
                if !matches!(e, Error::Io(_)) {
                    error!("{} Aborting session: {e}", self.log_prefix);
                    let _ = self.err("local error").await;
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        self.extend_deadline().await;
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
            if buffer.len() < MAX_LINE {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }

            while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                buffer.clear();
                (&mut self.io)
                    .take(MAX_LINE as u64)
                    .read_until(b'\n', buffer)
                    .await?;
            }
            return self.err("line too long").await;
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let line = &buffer[..buffer.len() - line_ending_len];
        let Ok(line) = str::from_utf8(line) else {
            return self.err("malformed UTF-8").await;
        };

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(ParseError::UnknownCommand) => {
                let verb = line.split(' ').next().unwrap_or_default();
                warn!(
                    "{} Unknown command {:?}",
                    self.log_prefix,
                    verb.chars().take(16).collect::<String>(),
                );
                return self.err("unknown command").await;
            },
            Err(ParseError::BadArgument) => {
                return self.err("invalid argument").await;
            },
        };

        match command {
            Command::User(name) => self.cmd_user(name).await,
            Command::Pass(password) => self.cmd_pass(password).await,
            Command::Stat => self.cmd_stat().await,
            Command::List(msg) => self.cmd_list(msg, false).await,
            Command::Uidl(msg) => self.cmd_list(msg, true).await,
            Command::Retr(msg) => self.cmd_retr(msg).await,
            Command::Dele(msg) => self.cmd_dele(msg).await,
            Command::Rset => self.cmd_rset().await,
            Command::Noop => self.ok("").await,
            Command::Quit => self.cmd_quit().await,
            Command::Stls => self.cmd_stls().await,
            Command::Capa => self.cmd_capa().await,
        }
    }

    async fn cmd_user(&mut self, name: String) -> Result<(), Error> {
        if let State::Transaction(_) = self.state {
            return self.err("already logged in").await;
        }

        self.state = State::User(name);
        self.ok("").await
    }

    async fn cmd_pass(&mut self, password: String) -> Result<(), Error> {
        let name = match std::mem::replace(&mut self.state, State::Init) {
            State::User(name) => name,
            State::Init => return self.err("USER first").await,
            State::Transaction(t) => {
                self.state = State::Transaction(t);
                return self.err("already logged in").await;
            },
        };

        let service = Rc::clone(&self.service);
        let services = &service.services;
        let mailbox = match services.authenticator.auth(&name, &password).await
        {
            Ok(mailbox) => mailbox,
            Err(AuthError::WrongAddressPassword) => {
                warn!("{} Failed login as {name:?}", self.log_prefix);
                return self.err("wrong address or password").await;
            },
            Err(AuthError::Store(e)) => return Err(e),
        };

        let Some(lock) = service.locks.try_lock(mailbox) else {
            warn!(
                "{} Mailbox of {name} is already in use, closing",
                self.log_prefix,
            );
            self.quit = true;
            return self.err("there is two of you?").await;
        };

        let inbox = services.inboxer.inbox(mailbox)?;
        info!(
            "{} Logged in as {name}, {} message(s) waiting",
            self.log_prefix,
            inbox.count(),
        );
        self.log_prefix.set_user(name);
        self.state = State::Transaction(Transaction { inbox, _lock: lock });
        self.ok("welcome").await
    }

    async fn cmd_stat(&mut self) -> Result<(), Error> {
        let Some(inbox) = self.inbox() else {
            return self.err("not logged in").await;
        };

        let text = format!(
            "{} {}",
            inbox.effective_count(),
            inbox.effective_size(),
        );
        self.ok(&text).await
    }

    /// `LIST` or, if `uidl` is set, `UIDL`.
    async fn cmd_list(
        &mut self,
        msg: Option<usize>,
        uidl: bool,
    ) -> Result<(), Error> {
        let Some(inbox) = self.inbox() else {
            return self.err("not logged in").await;
        };

        let describe = |ix: usize| {
            let entry = inbox.entry(ix)?;
            Some(if uidl {
                format!("{} {}", ix + 1, entry.id)
            } else {
                format!("{} {}", ix + 1, entry.size)
            })
        };

        if let Some(msg) = msg {
            return match message_index(inbox, msg).and_then(describe) {
                Some(line) => self.ok(&line).await,
                None => self.err("no such message").await,
            };
        }

        let mut listing =
            format!("+OK {} messages\r\n", inbox.effective_count());
        for (ix, _) in inbox.entries() {
            if inbox.is_marked(ix) {
                continue;
            }
            if let Some(line) = describe(ix) {
                listing.push_str(&line);
                listing.push_str("\r\n");
            }
        }
        listing.push_str(".\r\n");

        self.io.write_all(listing.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn cmd_retr(&mut self, msg: usize) -> Result<(), Error> {
        let Some(inbox) = self.inbox() else {
            return self.err("not logged in").await;
        };
        let Some(entry) =
            message_index(inbox, msg).and_then(|ix| inbox.entry(ix))
        else {
            return self.err("no such message").await;
        };
        let entry = entry.clone();

        let file = match self.service.services.inboxer.open(&entry) {
            Ok(file) => file,
            Err(e) => {
                error!(
                    "{} Can't open blob of mail {}: {e}",
                    self.log_prefix, entry.id,
                );
                return self.err("message unavailable").await;
            },
        };

        self.ok("message coming").await?;
        self.extend_deadline().await;
        write_dot_stuffed(&mut self.io, &mut io::BufReader::new(file)).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn cmd_dele(&mut self, msg: usize) -> Result<(), Error> {
        let State::Transaction(ref mut transaction) = self.state else {
            return self.err("not logged in").await;
        };

        let inbox = &mut transaction.inbox;
        match message_index(inbox, msg) {
            Some(ix) if inbox.mark(ix) => self.ok("marked").await,
            _ => self.err("no such message").await,
        }
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        let State::Transaction(ref mut transaction) = self.state else {
            return self.err("not logged in").await;
        };

        transaction.inbox.reset();
        self.ok("").await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let State::Transaction(ref transaction) = self.state else {
            return self.ok("bye").await;
        };

        match self.service.services.inboxer.commit(&transaction.inbox) {
            Ok(()) => self.ok("bye").await,
            Err(e) => {
                error!("{} Failed to remove messages: {e}", self.log_prefix);
                self.err("some deleted messages not removed").await
            },
        }
    }

    async fn cmd_stls(&mut self) -> Result<(), Error> {
        if !matches!(self.state, State::Init) {
            return self.err("STLS is only allowed before USER").await;
        }
        if self.io.get_ref().is_ssl() {
            return self.err("already using TLS").await;
        }
        let Some(ssl_acceptor) = self.ssl_acceptor.take() else {
            return self.err("TLS not available").await;
        };

        self.ok("begin TLS negotiation").await?;
        info!("{} Start TLS handshake", self.log_prefix);
        self.io.get_mut().ssl_accept(&ssl_acceptor).await?;
        info!(
            "{} TLS handshake completed: {}",
            self.log_prefix,
            self.io.get_ref().ssl_string().unwrap_or_default(),
        );
        self.log_prefix.set_tls(true);
        Ok(())
    }

    async fn cmd_capa(&mut self) -> Result<(), Error> {
        let mut capabilities = String::from("+OK capability list follows\r\n");
        capabilities.push_str("USER\r\nUIDL\r\n");
        if self.ssl_acceptor.is_some()
            && !self.io.get_ref().is_ssl()
            && matches!(self.state, State::Init)
        {
            capabilities.push_str("STLS\r\n");
        }
        capabilities.push_str("IMPLEMENTATION Mailroom\r\n.\r\n");

        self.io.write_all(capabilities.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    fn inbox(&self) -> Option<&Inbox> {
        match self.state {
            State::Transaction(ref transaction) => Some(&transaction.inbox),
            State::Init | State::User(_) => None,
        }
    }

    async fn extend_deadline(&mut self) {
        let _ = self.deadline_tx.send(Instant::now() + TIMEOUT).await;
    }

    async fn ok(&mut self, text: &str) -> Result<(), Error> {
        self.errors = 0;
        self.send_response(true, Cow::Borrowed(text)).await
    }

    async fn err(&mut self, text: &str) -> Result<(), Error> {
        self.errors += 1;
        if self.errors > MAX_ERRORS {
            warn!(
                "{} Terminating connection after too many errors",
                self.log_prefix,
            );
            self.quit = true;
        }
        self.send_response(false, Cow::Borrowed(text)).await
    }

    async fn send_response(
        &mut self,
        ok: bool,
        text: Cow<'_, str>,
    ) -> Result<(), Error> {
        let status = if ok { "+OK" } else { "-ERR" };
        let line = if text.is_empty() {
            format!("{status}\r\n")
        } else {
            format!("{status} {text}\r\n")
        };

        self.io.write_all(line.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// Translates the 1-based message number `msg` into an index into `inbox`,
/// if it names an unmarked message.
fn message_index(inbox: &Inbox, msg: usize) -> Option<usize> {
    let ix = msg.checked_sub(1)?;
    (ix < inbox.count() && !inbox.is_marked(ix)).then_some(ix)
}

async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + TIMEOUT;

    loop {
        match tokio::time::timeout_at(deadline, deadline_rx.recv()).await {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}
