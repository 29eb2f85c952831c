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

//! The POP3 server (RFC 1939, with STLS from RFC 2595 and CAPA from
//! RFC 2449).

pub mod lock;
mod server;
mod syntax;


use std::net::IpAddr;
use std::rc::Rc;

use log::{info, warn};
use openssl::ssl::SslAcceptor;

use self::lock::MailboxLocks;
use crate::mail::Services;
use crate::support::{async_io::ServerIo, log_prefix::LogPrefix};

/// Everything the POP3 sessions of one server share.
pub struct Pop3Service {
    pub services: Rc<Services>,
    pub locks: MailboxLocks,
}

/// Runs one POP3 session on `io` to completion.
///
/// `ssl_acceptor` is `None` if TLS is not available or if `io` is already
/// using it.
pub async fn serve_pop3(
    io: ServerIo,
    service: Rc<Pop3Service>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    peer: IpAddr,
) {
    match server::run(io, service, log_prefix.clone(), ssl_acceptor, peer)
        .await
    {
        Ok(()) => info!("{log_prefix} Normal client disconnect"),
        Err(e) => warn!("{log_prefix} Abnormal client disconnect: {e}"),
    }
}
