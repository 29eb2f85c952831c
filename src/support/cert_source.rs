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

//! Where the server's TLS certificate comes from.
//!
//! The certificate is loaded when first needed and reloaded whenever the
//! modification time of its source file advances, so renewed certificates
//! take effect without a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use log::{info, warn};
use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslAcceptorBuilder, SslFiletype, SslMethod};
use openssl::x509::X509;
use serde::Deserialize;

use super::error::Error;
use super::system_config::{TlsConfig, TlsSourceKind};

#[derive(Clone, Debug)]
enum Source {
    None,
    Files { crt: PathBuf, key: PathBuf },
    Traefik { acme_json: PathBuf, domain: String },
}

struct Loaded {
    acceptor: SslAcceptor,
    mtime: SystemTime,
}

pub struct CertSource {
    source: Source,
    loaded: Mutex<Option<Loaded>>,
}

impl CertSource {
    pub fn new(config: &TlsConfig) -> Self {
        let source = match config.source {
            TlsSourceKind::None => Source::None,
            TlsSourceKind::Files => Source::Files {
                crt: config.crt.clone(),
                key: config.key.clone(),
            },
            TlsSourceKind::Traefik => Source::Traefik {
                acme_json: config.acme_json.clone(),
                domain: config.domain.clone(),
            },
        };

        Self {
            source,
            loaded: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.source, Source::None)
    }

    /// Returns the acceptor for the current certificate, or `None` if TLS is
    /// not configured.
    ///
    /// If a reload fails after a certificate has been loaded successfully,
    /// the old certificate stays in use.
    pub fn acceptor(&self) -> Result<Option<SslAcceptor>, Error> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let mut loaded = self.loaded.lock().unwrap();
        let mtime = match self.mtime() {
            Ok(mtime) => mtime,
            Err(e) => match *loaded {
                Some(ref loaded) => {
                    warn!("Can't check TLS certificate for changes: {e}");
                    return Ok(Some(loaded.acceptor.clone()));
                },
                None => return Err(e),
            },
        };

        if let Some(ref loaded) = *loaded {
            if mtime <= loaded.mtime {
                return Ok(Some(loaded.acceptor.clone()));
            }
        }

        match self.load() {
            Ok(acceptor) => {
                info!("Loaded TLS certificate");
                *loaded = Some(Loaded {
                    acceptor: acceptor.clone(),
                    mtime,
                });
                Ok(Some(acceptor))
            },

            Err(e) => match *loaded {
                Some(ref mut loaded) => {
                    warn!("Failed to reload TLS certificate: {e}");
                    // Don't retry until the file changes again.
                    loaded.mtime = mtime;
                    Ok(Some(loaded.acceptor.clone()))
                },
                None => Err(e),
            },
        }
    }

    fn mtime(&self) -> Result<SystemTime, Error> {
        match self.source {
            Source::None => Ok(SystemTime::UNIX_EPOCH),
            Source::Files { ref crt, ref key } => {
                Ok(file_mtime(crt)?.max(file_mtime(key)?))
            },
            Source::Traefik { ref acme_json, .. } => file_mtime(acme_json),
        }
    }

    fn load(&self) -> Result<SslAcceptor, Error> {
        let mut acceptor = new_acceptor_builder()?;
        match self.source {
            Source::None => {
                return Err(Error::TlsSource("TLS is disabled".to_owned()))
            },

            Source::Files { ref crt, ref key } => {
                acceptor
                    .set_private_key_file(key, SslFiletype::PEM)
                    .map_err(|e| {
                        Error::TlsSource(format!(
                            "Unable to load TLS private key from '{}': {e}",
                            key.display(),
                        ))
                    })?;
                acceptor.set_certificate_chain_file(crt).map_err(|e| {
                    Error::TlsSource(format!(
                        "Unable to load TLS certificate chain from '{}': {e}",
                        crt.display(),
                    ))
                })?;
            },

            Source::Traefik {
                ref acme_json,
                ref domain,
            } => {
                let (chain, key) = read_acme_json(acme_json, domain)?;
                install_pem(&mut acceptor, &chain, &key)?;
            },
        }

        acceptor.check_private_key().map_err(|e| {
            Error::TlsSource(format!("TLS key seems to be invalid: {e}"))
        })?;
        Ok(acceptor.build())
    }
}

fn new_acceptor_builder() -> Result<SslAcceptorBuilder, Error> {
    Ok(SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?)
}

fn file_mtime(path: &Path) -> Result<SystemTime, Error> {
    fs::metadata(path).and_then(|md| md.modified()).map_err(|e| {
        Error::TlsSource(format!("Can't stat '{}': {e}", path.display()))
    })
}

#[derive(Deserialize)]
struct AcmeResolver {
    #[serde(rename = "Certificates", default)]
    certificates: Option<Vec<AcmeCertificate>>,
}

#[derive(Deserialize)]
struct AcmeCertificate {
    domain: AcmeDomain,
    /// Base64 of the PEM certificate chain.
    certificate: String,
    /// Base64 of the PEM private key.
    key: String,
}

#[derive(Deserialize)]
struct AcmeDomain {
    main: String,
    #[serde(default)]
    sans: Option<Vec<String>>,
}

/// Finds the certificate for `domain` in any resolver of Traefik's
/// `acme.json`, returning the PEM chain and key.
fn read_acme_json(
    path: &Path,
    domain: &str,
) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let data = fs::read(path).map_err(|e| {
        Error::TlsSource(format!("Can't read '{}': {e}", path.display()))
    })?;
    let resolvers: HashMap<String, AcmeResolver> =
        serde_json::from_slice(&data).map_err(|e| {
            Error::TlsSource(format!("Bad '{}': {e}", path.display()))
        })?;

    let found = resolvers
        .into_values()
        .flat_map(|r| r.certificates.unwrap_or_default())
        .find(|c| {
            c.domain.main.eq_ignore_ascii_case(domain)
                || c.domain
                    .sans
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(domain))
        })
        .ok_or_else(|| {
            Error::TlsSource(format!(
                "No certificate for {domain} in '{}'",
                path.display(),
            ))
        })?;

    let decode = |what: &str, s: &str| {
        base64::decode(s).map_err(|e| {
            Error::TlsSource(format!("Bad {what} for {domain}: {e}"))
        })
    };
    Ok((
        decode("certificate", &found.certificate)?,
        decode("key", &found.key)?,
    ))
}

fn install_pem(
    acceptor: &mut SslAcceptorBuilder,
    chain: &[u8],
    key: &[u8],
) -> Result<(), Error> {
    let key = PKey::private_key_from_pem(key)?;
    let mut chain = X509::stack_from_pem(chain)?.into_iter();
    let leaf = chain.next().ok_or_else(|| {
        Error::TlsSource("Certificate chain is empty".to_owned())
    })?;

    acceptor.set_private_key(&key)?;
    acceptor.set_certificate(&leaf)?;
    for intermediate in chain {
        acceptor.add_extra_chain_cert(intermediate)?;
    }

    Ok(())
}

/// An acceptor for the self-signed test certificate.
#[cfg(test)]
pub fn test_acceptor() -> SslAcceptor {
    use crate::test_data::{CERTIFICATE, CERTIFICATE_PRIVATE_KEY};

    let mut acceptor = new_acceptor_builder().unwrap();
    acceptor.set_private_key(&CERTIFICATE_PRIVATE_KEY).unwrap();
    acceptor.set_certificate(&CERTIFICATE).unwrap();
    acceptor.build()
}
