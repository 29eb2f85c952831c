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

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{de, Deserialize, Deserializer};

/// The system-wide configuration for Mailroom.
///
/// This is stored in a file named `mailroom.toml`, which is typically under
/// `/usr/local/etc/mailroom` or `/etc/mailroom`. Relative paths within it are
/// interpreted relative to the directory containing that file.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct SystemConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub mail: MailConfig,
    /// The SMTP endpoints to listen on.
    #[serde(default)]
    pub smtp: Vec<EndpointConfig>,
    /// The POP3 endpoints to listen on.
    #[serde(default)]
    pub pop3: Vec<EndpointConfig>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub hook: HookConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub addressbook: AddressbookConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// The host name used in greetings, `Received` headers, and outbound
    /// `EHLO`.
    ///
    /// If unset, the system host name is used.
    pub hostname: String,
    /// Domains for which this server accepts mail. These are created in the
    /// database at startup if not already present.
    pub domains: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// The maximum accepted message size in bytes. 0 means unlimited.
    pub size: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            size: 32 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EndpointConfig {
    /// The socket address to bind, e.g. `0.0.0.0:25`.
    pub address: String,
    /// Whether to perform the TLS handshake immediately on connect instead of
    /// offering STARTTLS/STLS.
    #[serde(default)]
    pub implicit_tls: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsSourceKind {
    None,
    Files,
    Traefik,
}

impl Default for TlsSourceKind {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub source: TlsSourceKind,
    /// With `source = "files"`, the PEM certificate chain.
    pub crt: PathBuf,
    /// With `source = "files"`, the PEM private key.
    pub key: PathBuf,
    /// With `source = "traefik"`, the path to Traefik's `acme.json`.
    pub acme_json: PathBuf,
    /// With `source = "traefik"`, the main domain of the certificate to use.
    pub domain: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub spf: SpfHookConfig,
    pub dnsbl: DnsblHookConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SpfHookConfig {
    pub enable: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DnsblHookConfig {
    pub enable: bool,
    /// The DNSBL zone, e.g. `zen.spamhaus.org`.
    pub server: String,
}

impl Default for DnsblHookConfig {
    fn default() -> Self {
        Self {
            enable: false,
            server: "zen.spamhaus.org".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub argon2: Argon2Config,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Argon2Config {
    /// Number of passes.
    pub time: u32,
    /// Memory cost in KiB.
    pub memory: u32,
    /// Degree of parallelism.
    pub threads: u32,
    pub hash_length: u32,
    pub salt_length: u32,
}

impl Default for Argon2Config {
    fn default() -> Self {
        Self {
            time: 3,
            memory: 64 * 1024,
            threads: 1,
            hash_length: 32,
            salt_length: 16,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Every authentication attempt takes at least this long, whether or not
    /// it succeeds.
    #[serde(deserialize_with = "deserialize_duration")]
    pub min_duration: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: DatabaseConfig,
    pub blobs: BlobsConfig,
    pub cache: CacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub filename: PathBuf,
    /// The SQLite journal mode, e.g. `wal` or `delete`.
    pub journal_mode: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            filename: "mailroom.sqlite".into(),
            journal_mode: "wal".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BlobsConfig {
    pub folder_name: PathBuf,
}

impl Default for BlobsConfig {
    fn default() -> Self {
        Self {
            folder_name: "blobs".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub folder_name: PathBuf,
    /// Message bodies up to this many bytes are held in memory while being
    /// received; larger ones are spilled to a file under `folder_name`.
    pub memory_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            folder_name: "cache".into(),
            memory_limit: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AddressbookConfig {
    /// An optional TOML file listing mailboxes and addresses to create at
    /// startup.
    pub filename: Option<PathBuf>,
}

impl SystemConfig {
    /// Makes every relative path in the configuration relative to `root`.
    pub fn resolve_paths(&mut self, root: &Path) {
        fn fix(root: &Path, path: &mut PathBuf) {
            if !path.as_os_str().is_empty() && path.is_relative() {
                *path = root.join(&*path);
            }
        }

        fix(root, &mut self.tls.crt);
        fix(root, &mut self.tls.key);
        fix(root, &mut self.tls.acme_json);
        fix(root, &mut self.storage.database.filename);
        fix(root, &mut self.storage.blobs.folder_name);
        fix(root, &mut self.storage.cache.folder_name);
        if let Some(ref mut filename) = self.addressbook.filename {
            fix(root, filename);
        }
    }

    /// Returns the configured host name, falling back to the system host
    /// name.
    pub fn hostname(&self) -> String {
        if !self.general.hostname.is_empty() {
            return self.general.hostname.clone();
        }

        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned())
    }
}

/// Parses durations like `500ms`, `30s`, `5m`, `1h`, or `1m30s`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_owned());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
        if 0 == digits {
            return Err(format!("invalid duration {s:?}"));
        }

        let n = rest[..digits]
            .parse::<u64>()
            .map_err(|e| format!("invalid duration {s:?}: {e}"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n * 60),
            "h" => Duration::from_secs(n * 3600),
            _ => return Err(format!("unknown unit {unit:?} in {s:?}")),
        };
    }

    Ok(total)
}

fn deserialize_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration such as \"500ms\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative duration"))
        }
    }

    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(Ok(Duration::from_millis(500)), parse_duration("500ms"));
        assert_eq!(Ok(Duration::from_secs(2)), parse_duration("2s"));
        assert_eq!(Ok(Duration::from_secs(2)), parse_duration("2"));
        assert_eq!(Ok(Duration::from_secs(90)), parse_duration("1m30s"));
        assert_eq!(Ok(Duration::from_secs(3600)), parse_duration("1h"));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn parse_full_config() {
        let mut config: SystemConfig = toml::from_str(
            r#"
[general]
hostname = "mail.example.com"
domains = ["example.com", "example.org"]

[mail]
size = 1000

[[smtp]]
address = "0.0.0.0:25"

[[smtp]]
address = "0.0.0.0:465"
implicit_tls = true

[[pop3]]
address = "0.0.0.0:995"
implicit_tls = true

[tls]
source = "files"
crt = "tls.crt"
key = "/etc/tls.key"

[hook.spf]
enable = true

[hook.dnsbl]
enable = true
server = "dnsbl.example.net"

[crypto.argon2]
time = 1
memory = 1024

[security.auth]
min_duration = "250ms"

[storage.database]
journal_mode = "delete"

[storage.cache]
memory_limit = 4096

[addressbook]
filename = "book.toml"
"#,
        )
        .unwrap();
        config.resolve_paths(Path::new("/srv/mail"));

        assert_eq!("mail.example.com", config.hostname());
        assert_eq!(2, config.general.domains.len());
        assert_eq!(1000, config.mail.size);
        assert_eq!(2, config.smtp.len());
        assert!(!config.smtp[0].implicit_tls);
        assert!(config.smtp[1].implicit_tls);
        assert_eq!(1, config.pop3.len());
        assert_eq!(TlsSourceKind::Files, config.tls.source);
        assert_eq!(PathBuf::from("/srv/mail/tls.crt"), config.tls.crt);
        assert_eq!(PathBuf::from("/etc/tls.key"), config.tls.key);
        assert!(config.hook.spf.enable);
        assert_eq!("dnsbl.example.net", config.hook.dnsbl.server);
        assert_eq!(1, config.crypto.argon2.time);
        assert_eq!(1024, config.crypto.argon2.memory);
        assert_eq!(32, config.crypto.argon2.hash_length);
        assert_eq!(
            Duration::from_millis(250),
            config.security.auth.min_duration,
        );
        assert_eq!(
            PathBuf::from("/srv/mail/mailroom.sqlite"),
            config.storage.database.filename,
        );
        assert_eq!("delete", config.storage.database.journal_mode);
        assert_eq!(
            PathBuf::from("/srv/mail/blobs"),
            config.storage.blobs.folder_name,
        );
        assert_eq!(4096, config.storage.cache.memory_limit);
        assert_eq!(
            Some(PathBuf::from("/srv/mail/book.toml")),
            config.addressbook.filename,
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: SystemConfig = toml::from_str("").unwrap();
        assert_eq!(TlsSourceKind::None, config.tls.source);
        assert_eq!(32 * 1024 * 1024, config.mail.size);
        assert!(config.smtp.is_empty());
        assert!(!config.hook.dnsbl.enable);
        assert_eq!(
            Duration::from_millis(500),
            config.security.auth.min_duration,
        );
        assert!(config.addressbook.filename.is_none());
    }
}
