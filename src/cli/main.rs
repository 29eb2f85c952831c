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

use std::fs;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

const DEFAULT_CONFIG: &str = "/usr/local/etc/mailroom/mailroom.toml";

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// The configuration file. Relative paths within it are resolved
    /// against the directory containing it.
    #[structopt(long, parse(from_os_str), default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Run the SMTP and POP3 servers and the outbound queue.
    ///
    /// All configured endpoints are served by this one process. It runs
    /// until killed.
    Serve,
    /// Manage the domains this server accepts mail for.
    Domain(DomainSubcommand),
    /// Manage mailboxes and their passwords.
    Mailbox(MailboxSubcommand),
    /// Manage the addresses routed to mailboxes.
    Address(AddressSubcommand),
}

#[derive(StructOpt)]
pub(super) enum DomainSubcommand {
    /// Make a domain local.
    Add {
        /// The domain name, in Unicode or punycode.
        name: String,
    },
    /// Remove a local domain along with all its addresses.
    ///
    /// Mailboxes are left in place even if this leaves them with no
    /// addresses.
    Remove { name: String },
    /// List the local domains.
    List,
}

#[derive(StructOpt)]
pub(super) enum MailboxSubcommand {
    /// Create a new mailbox with one address.
    Add(MailboxAddSubcommand),
    /// Change the password of a mailbox.
    Passwd(MailboxPasswdSubcommand),
    /// List all mailboxes and their addresses.
    List,
}

#[derive(StructOpt)]
pub(super) struct MailboxAddSubcommand {
    /// Prompt for the password instead of generating one.
    #[structopt(long)]
    pub(super) prompt_password: bool,

    /// The name shown in listings. Defaults to the address.
    #[structopt(long)]
    pub(super) display_name: Option<String>,

    /// The first address of the mailbox. Its domain must already be local.
    pub(super) address: String,
}

#[derive(StructOpt)]
pub(super) struct MailboxPasswdSubcommand {
    /// Prompt for the password instead of generating one.
    #[structopt(long)]
    pub(super) prompt_password: bool,

    /// Any address of the mailbox.
    pub(super) address: String,
}

#[derive(StructOpt)]
pub(super) enum AddressSubcommand {
    /// Route a new address to an existing mailbox.
    Add {
        /// The new address. Its domain must already be local.
        address: String,
        /// Any existing address of the mailbox.
        mailbox: String,
    },
    /// Stop routing an address.
    Remove { address: String },
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options = Options::from_clap(&match Options::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    let config_path = options.config;
    let root = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_owned();
    let config = load_config(&config_path, &root);

    init_log(&root);

    match options.command {
        Command::Serve => super::serve::serve(config),
        Command::Domain(cmd) => super::admin::domain(config, cmd),
        Command::Mailbox(cmd) => super::admin::mailbox(config, cmd),
        Command::Address(cmd) => super::admin::address(config, cmd),
    }
}

fn load_config(path: &Path, root: &Path) -> SystemConfig {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => die!(EX_CONFIG, "Error reading '{}': {}", path.display(), e),
    };

    let mut config: SystemConfig = match toml::from_str(&text) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            path.display(),
            e
        ),
    };
    config.resolve_paths(root);
    config
}

fn init_log(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    // Either log4rs or syslog, since log4rs has no maintained syslog
    // appender.
    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::config::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let logger = match syslog::unix(formatter) {
            Ok(logger) => logger,
            Err(e) => die!(EX_OSERR, "Failed to connect to syslog: {}", e),
        };
        if let Err(e) =
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
        {
            die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
        }
    }
}
