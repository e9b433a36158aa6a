//! Mutual-TLS HTTP client construction
//!
//! The client presents the resolved credential, trusts only the configured CA
//! bundle (no platform roots) and never retries on its own: retrying is the
//! upload cycle's job.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, SignatureScheme};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Upper bound for one request, connect through response body
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Always presents the same client certificate
#[derive(Debug)]
struct ClientIdentity(Arc<CertifiedKey>);

impl ResolvesClientCert for ClientIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Build the rustls client configuration for a credential.
pub fn tls_config(credential: Credential) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let identity = CertifiedKey::new(credential.certificate_chain, credential.private_key);

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Credential(format!("unsupported TLS configuration: {}", e)))?
        .with_root_certificates(credential.trust_anchors)
        .with_client_cert_resolver(Arc::new(ClientIdentity(Arc::new(identity))));

    Ok(config)
}

/// Build the HTTP client used for every upload.
pub fn build_http_client(credential: Credential) -> Result<reqwest::Client> {
    let tls = tls_config(credential)?;

    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Credential(format!("failed to create HTTP client: {}", e)))
}
