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

//! The SMTP server, for both relay (unauthenticated, local recipients only)
//! and submission (authenticated, any recipient) sessions.
//!
//! Both kinds of session are served on the same endpoints; a session becomes
//! a submission session when the client authenticates.

mod server;

#[cfg(test)]
pub(crate) mod integration_test_common;
#[cfg(test)]
mod integration_tests;

use std::net::IpAddr;
use std::rc::Rc;

use log::{info, warn};
use openssl::ssl::SslAcceptor;

use super::hooks::{DataHook, FromHook};
use crate::mail::Services;
use crate::support::{async_io::ServerIo, log_prefix::LogPrefix};

/// Everything the SMTP sessions of one server share.
pub struct SmtpService {
    pub services: Rc<Services>,
    /// Run in order after `MAIL FROM`.
    pub from_hooks: Vec<Box<dyn FromHook>>,
    /// Run in order after the message body has been received.
    pub data_hooks: Vec<Box<dyn DataHook>>,
}

/// Runs one SMTP session on `io` to completion.
///
/// `ssl_acceptor` is `None` if TLS is not available or if `io` is already
/// using it.
pub async fn serve_smtp(
    io: ServerIo,
    service: Rc<SmtpService>,
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
