//! Client identity for mutual TLS
//!
//! A [`Credential`] bundles the certificate chain the agent presents, a
//! signing capability for the matching private key, and the CA certificates
//! that the collector's certificate must chain to.
//!
//! Two sources exist, selected by `sota.toml`:
//!
//! ```text
//! tls.pkey_source = "file"    → FileCredentialSource (PEM files on disk)
//! tls.pkey_source = "pkcs11"  → HsmCredentialSource  (key + cert on a token)
//! ```
//!
//! The CA bundle is always read from `import.tls_cacert_path`.

mod file;
mod pkcs11;

pub use file::FileCredentialSource;
pub use pkcs11::{HsmCredentialSource, HsmToken, TOKEN_LABEL};

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::sign::SigningKey;
use rustls::RootCertStore;

use crate::config::SourceKind;
use crate::error::{Error, Result};

/// A resolved client identity
#[derive(Debug)]
pub struct Credential {
    /// Leaf first, as presented during the handshake
    pub certificate_chain: Vec<CertificateDer<'static>>,
    /// Signs handshake transcripts with the client key
    pub private_key: Arc<dyn SigningKey>,
    /// Only these CAs are trusted for the collector's certificate
    pub trust_anchors: RootCertStore,
}

/// Validated credential source, produced by
/// [`SotaConfig::credential_source`](crate::config::SotaConfig::credential_source)
#[derive(Debug, Clone)]
pub enum CredentialSource {
    File(FileCredentialSource),
    Pkcs11(HsmCredentialSource),
}

impl CredentialSource {
    /// Load the identity.
    ///
    /// Any failure is a [`Error::Credential`]; there is no degraded mode.
    pub fn resolve(&self) -> Result<Credential> {
        match self {
            CredentialSource::File(source) => source.resolve(),
            CredentialSource::Pkcs11(source) => source.resolve(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            CredentialSource::File(_) => SourceKind::File,
            CredentialSource::Pkcs11(_) => SourceKind::Pkcs11,
        }
    }
}

/// Read every `CERTIFICATE` block of a PEM file.
fn read_pem_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .map_err(|e| Error::Credential(format!("unable to read {}: {}", path.display(), e)))?;

    CertificateDer::pem_slice_iter(&pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Credential(format!("unable to parse {}: {}", path.display(), e)))
}

/// Build a root store holding only the certificates of a PEM CA bundle.
pub(crate) fn load_ca_bundle(path: &Path) -> Result<RootCertStore> {
    let certs = read_pem_certificates(path)?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        tracing::warn!(
            path = %path.display(),
            ignored,
            "Skipped unparsable certificates in CA bundle"
        );
    }
    if added == 0 {
        return Err(Error::Credential(format!(
            "no usable CA certificate in {}",
            path.display()
        )));
    }

    tracing::debug!(path = %path.display(), count = added, "Loaded CA bundle");
    Ok(roots)
}
