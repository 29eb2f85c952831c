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

use std::net::TcpListener;
use std::rc::Rc;

use log::{error, info, warn};

use crate::listener::{self, Protocol};
use crate::mail::Services;
use crate::pop3::{lock::MailboxLocks, Pop3Service};
use crate::smtp::hooks::{DnsblHook, FromHook, SpfHook};
use crate::smtp::inbound::SmtpService;
use crate::smtp::outbound::courier::{Courier, TcpConnector};
use crate::smtp::outbound::queue::{self, QueueSignal};
use crate::support::{
    cert_source::CertSource, dns::SystemDns, error::Error,
    log_prefix::LogPrefix, sysexits::Sysexit, system_config::SystemConfig,
};

// Need to use this and not die! so that errors go to syslog/etc
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

struct Endpoint {
    listener: TcpListener,
    implicit_tls: bool,
    smtp: bool,
}

pub(super) fn serve(config: SystemConfig) {
    let smtp = config.smtp.iter().map(|e| (e, true));
    let pop3 = config.pop3.iter().map(|e| (e, false));
    let endpoints = smtp
        .chain(pop3)
        .map(|(endpoint, smtp)| match listener::bind(&endpoint.address) {
            Ok(listener) => Endpoint {
                listener,
                implicit_tls: endpoint.implicit_tls,
                smtp,
            },
            Err(e) => fatal!(
                EX_OSERR,
                "Failed to listen on {}: {}",
                endpoint.address,
                e
            ),
        })
        .collect::<Vec<_>>();

    if endpoints.is_empty() {
        warn!("No SMTP or POP3 endpoints configured");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => fatal!(EX_OSERR, "Failed to start runtime: {}", e),
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(config, endpoints));
}

async fn run(config: SystemConfig, endpoints: Vec<Endpoint>) {
    let log_prefix = LogPrefix::new("mailroom".to_owned());
    let services =
        match Services::open(&log_prefix, &config, QueueSignal::new()) {
            Ok(services) => Rc::new(services),
            Err(e) => fail("Failed to open data directory", e),
        };

    if let Err(e) = services.prepare_addressbook(&config) {
        fail("Failed to prepare address book", e);
    }

    match services.cleaner.clean() {
        Ok(0) => (),
        Ok(n) => info!("Cleaned up {n} finished mail(s)"),
        Err(e) => fail("Failed to clean up finished mail", e),
    }

    let dns = match SystemDns::from_system_conf() {
        Ok(dns) => Rc::new(dns),
        Err(e) => fatal!(EX_CONFIG, "Failed to set up DNS resolver: {}", e),
    };

    let certs = Rc::new(CertSource::new(&config.tls));
    if let Err(e) = certs.acceptor() {
        fail("Failed to load TLS certificate", e);
    }
    if !certs.is_enabled() {
        warn!("No TLS certificate configured; STARTTLS is unavailable");
    }

    let mut from_hooks: Vec<Box<dyn FromHook>> = Vec::new();
    if config.hook.spf.enable {
        from_hooks.push(Box::new(SpfHook::new(
            dns.clone(),
            services.hostname.clone(),
        )));
    }
    if config.hook.dnsbl.enable {
        from_hooks.push(Box::new(DnsblHook::new(
            dns.clone(),
            config.hook.dnsbl.server.clone(),
        )));
    }

    let smtp_service = Rc::new(SmtpService {
        services: Rc::clone(&services),
        from_hooks,
        data_hooks: Vec::new(),
    });
    let pop3_service = Rc::new(Pop3Service {
        services: Rc::clone(&services),
        locks: MailboxLocks::new(),
    });

    let courier = Courier::new(&services, dns, Rc::new(TcpConnector));
    tokio::task::spawn_local(queue::run(Rc::clone(&services), courier));

    let mut tasks = Vec::new();
    for endpoint in endpoints {
        let protocol = if endpoint.smtp {
            Protocol::Smtp(Rc::clone(&smtp_service))
        } else {
            Protocol::Pop3(Rc::clone(&pop3_service))
        };

        tasks.push(tokio::task::spawn_local(listener::run(
            endpoint.listener,
            endpoint.implicit_tls,
            protocol,
            Rc::clone(&certs),
        )));
    }

    info!("Mailroom started");
    for task in tasks {
        match task.await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => fatal!(EX_OSERR, "Listener failed: {}", e),
            Err(e) => fatal!(EX_SOFTWARE, "Listener task failed: {}", e),
        }
    }

    // Only reached if there are no endpoints; keep delivering the queue.
    std::future::pending::<()>().await;
}

fn fail(what: &str, e: Error) -> ! {
    error!("{what}: {e}");
    Sysexit::for_error(&e).exit()
}
