//! PEM key and certificate files

use std::fs;
use std::path::PathBuf;

use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::PrivateKeyDer;

use crate::error::{Error, Result};

use super::{load_ca_bundle, read_pem_certificates, Credential};

/// Client certificate and key read from `import.*` paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCredentialSource {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

impl FileCredentialSource {
    /// Read the PEM files once. No handles stay open afterwards.
    pub fn resolve(&self) -> Result<Credential> {
        let certificate_chain = read_pem_certificates(&self.cert_path)?;
        if certificate_chain.is_empty() {
            return Err(Error::Credential(format!(
                "no certificate found in {}",
                self.cert_path.display()
            )));
        }

        let key_pem = fs::read(&self.key_path).map_err(|e| {
            Error::Credential(format!("unable to read {}: {}", self.key_path.display(), e))
        })?;
        let key_der = match PrivateKeyDer::from_pem_slice(&key_pem) {
            Ok(key) => key,
            Err(pem::Error::NoItemsFound) => {
                return Err(Error::Credential(format!(
                    "no private key found in {}",
                    self.key_path.display()
                )));
            }
            Err(e) => {
                return Err(Error::Credential(format!(
                    "unable to parse {}: {}",
                    self.key_path.display(),
                    e
                )));
            }
        };

        let private_key = rustls::crypto::ring::sign::any_supported_type(&key_der).map_err(|e| {
            Error::Credential(format!(
                "unsupported private key in {}: {}",
                self.key_path.display(),
                e
            ))
        })?;

        let trust_anchors = load_ca_bundle(&self.ca_path)?;

        tracing::info!(
            cert = %self.cert_path.display(),
            chain_len = certificate_chain.len(),
            "Loaded client credential from files"
        );

        Ok(Credential {
            certificate_chain,
            private_key,
            trust_anchors,
        })
    }
}
