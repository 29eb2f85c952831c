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

//! Socket I/O that can switch from cleartext to TLS in the middle of a
//! session.
//!
//! Tokio's own TLS integrations want to own the stream type, which does not
//! fit protocols that upgrade in place (`STARTTLS`, `STLS`) while the
//! session state machine keeps hold of its reader and writer. `ServerIo`
//! instead drives OpenSSL directly over the raw file descriptor and swaps its
//! internal mode when a handshake completes.

use std::any::Any;
use std::cell::{RefCell, RefMut};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::{
    ConnectConfiguration, ErrorCode, HandshakeError, MidHandshakeSslStream,
    SslAcceptor, SslStream,
};
use tokio::io::{
    unix::{AsyncFd, AsyncFdReadyGuard},
    AsyncRead, AsyncWrite, Interest, ReadBuf,
};

use crate::support::error::Error;

/// An async connection, either cleartext or TLS.
///
/// Clones share the same connection and mode, so a clone can be used as a
/// separate reader or writer.
#[derive(Clone)]
pub struct ServerIo {
    fd: Rc<AsyncFd<RawFd>>,
    mode: Rc<RefCell<Mode>>,
    _owned: Rc<dyn Any>,
}

enum Mode {
    Cleartext(RawIo),
    Ssl(SslStream<RawIo>),
}

impl ServerIo {
    /// Wraps `sock`, which will be closed when the last clone is dropped.
    ///
    /// This only fails if making the socket non-blocking fails.
    pub fn new_owned_socket(sock: impl AsRawFd + Any) -> Result<Self, Error> {
        let raw = sock.as_raw_fd();
        nix::fcntl::fcntl(
            raw,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let fd = Rc::new(AsyncFd::with_interest(
            raw,
            Interest::READABLE | Interest::WRITABLE,
        )?);

        Ok(Self {
            mode: Rc::new(RefCell::new(Mode::Cleartext(RawIo(Rc::clone(
                &fd,
            ))))),
            fd,
            _owned: Rc::new(sock),
        })
    }

    pub fn is_ssl(&self) -> bool {
        matches!(*self.mode.borrow(), Mode::Ssl(_))
    }

    /// Describes the TLS session for logging, e.g. `TLSv1.3:TLS_AES_256:256`.
    pub fn ssl_string(&self) -> Option<String> {
        match *self.mode.borrow() {
            Mode::Cleartext(..) => None,
            Mode::Ssl(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{}:{}:{}",
                    ssl.version_str(),
                    cipher.map_or("NONE", |c| c.name()),
                    cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs the server side of a TLS handshake.
    ///
    /// Nothing else may use the connection until this completes.
    pub async fn ssl_accept(
        &self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        #[allow(clippy::await_holding_refcell_ref)] // intentional
        let mode = self.cleartext_mode()?;
        let result = acceptor.accept(RawIo(Rc::clone(&self.fd)));
        self.complete_ssl_handshake(mode, result).await
    }

    /// Performs the client side of a TLS handshake with `domain` as the SNI
    /// name.
    ///
    /// Nothing else may use the connection until this completes.
    pub async fn ssl_connect(
        &self,
        config: ConnectConfiguration,
        domain: &str,
    ) -> Result<(), Error> {
        #[allow(clippy::await_holding_refcell_ref)] // intentional
        let mode = self.cleartext_mode()?;
        let result = config.connect(domain, RawIo(Rc::clone(&self.fd)));
        self.complete_ssl_handshake(mode, result).await
    }

    fn cleartext_mode(&self) -> Result<RefMut<'_, Mode>, Error> {
        let mode = self.mode.borrow_mut();
        if matches!(*mode, Mode::Ssl(_)) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "TLS is already active",
            )));
        }
        Ok(mode)
    }

    #[allow(clippy::await_holding_refcell_ref)] // intentional
    async fn complete_ssl_handshake(
        &self,
        mut mode: RefMut<'_, Mode>,
        mut result: Result<SslStream<RawIo>, HandshakeError<RawIo>>,
    ) -> Result<(), Error> {
        // OpenSSL only tells us which direction it is blocked on after
        // trying. A guard obtained when Tokio believes the socket is ready
        // may be stale, so it is only cleared once OpenSSL reports
        // WANT_READ/WANT_WRITE again while it is held.
        let mut read_guard = None::<AsyncFdReadyGuard<'_, RawFd>>;
        let mut write_guard = None::<AsyncFdReadyGuard<'_, RawFd>>;

        loop {
            match result {
                Ok(stream) => {
                    *mode = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),
                Err(HandshakeError::Failure(mhss)) => {
                    return Err(handshake_error(mhss));
                },

                Err(HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        ErrorCode::WANT_READ => {
                            if let Some(mut guard) = read_guard.take() {
                                guard.clear_ready();
                            }
                            read_guard = Some(self.fd.readable().await?);
                        },

                        ErrorCode::WANT_WRITE => {
                            if let Some(mut guard) = write_guard.take() {
                                guard.clear_ready();
                            }
                            write_guard = Some(self.fd.writable().await?);
                        },

                        _ => return Err(handshake_error(mhss)),
                    }

                    result = mhss.handshake();
                },
            }
        }
    }

    /// Handles an error from `ssl_read` or `ssl_write`.
    ///
    /// This must be called immediately after the failed call, with no await
    /// point in between, so that `WANT_READ` or `WANT_WRITE` reliably means
    /// the socket has nothing to offer.
    fn on_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            ErrorCode::WANT_READ => {
                futures::ready!(self.fd.poll_read_ready(ctx))?.clear_ready();
                // Poll again so that Tokio registers interest.
                futures::ready!(self.fd.poll_read_ready(ctx))?.retain_ready();
                task::Poll::Ready(Ok(()))
            },

            ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd.poll_write_ready(ctx))?.clear_ready();
                futures::ready!(self.fd.poll_write_ready(ctx))?.retain_ready();
                task::Poll::Ready(Ok(()))
            },

            // EOF shows up as SYSCALL without an underlying I/O error.
            ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut raw) => Pin::new(raw).poll_read(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    // A clean TLS close is EOF.
                    Err(e) if ErrorCode::ZERO_RETURN == e.code() => {
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => futures::ready!(self.on_ssl_error(ctx, e))?,
                }
            },
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut raw) => Pin::new(raw).poll_write(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_ssl_error(ctx, e))?,
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // Neither OpenSSL nor the raw socket buffers anything.
        task::Poll::Ready(Ok(()))
    }

    /// Sends a TLS close notification if TLS is active. The socket itself
    /// stays open until dropped.
    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        if let Mode::Ssl(ref mut ssl) = *mode {
            loop {
                match ssl.shutdown() {
                    Ok(_) => break,
                    Err(e) if ErrorCode::ZERO_RETURN == e.code() => break,
                    Err(e) => futures::ready!(self.on_ssl_error(ctx, e))?,
                }
            }
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Synchronous and asynchronous I/O directly on the file descriptor.
///
/// OpenSSL sees the synchronous side, which reports `WouldBlock` instead of
/// blocking since the descriptor is non-blocking.
struct RawIo(Rc<AsyncFd<RawFd>>);

impl io::Read for RawIo {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(*self.0.get_ref(), dst).map_err(nix_to_io)
    }
}

impl io::Write for RawIo {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(*self.0.get_ref(), src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for RawIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;
            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },
                Ok(Err(e)) => return task::Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for RawIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;
            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf).map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn handshake_error<S>(mhss: MidHandshakeSslStream<S>) -> Error {
    let e = mhss.into_error();
    if let Some(stack) = e.ssl_error() {
        return Error::Ssl(stack.clone());
    }

    match e.into_io_error() {
        Ok(io) => Error::Io(io),
        Err(e) if ErrorCode::SYSCALL == e.code() => {
            Error::Io(io::ErrorKind::UnexpectedEof.into())
        },
        Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
    }
}
