//! Client key and certificate held on a PKCS#11 token
//!
//! The private key never leaves the token. Handshake signatures are computed
//! by the token through a dedicated session; digests are computed locally so
//! only the raw `CKM_ECDSA`, `CKM_RSA_PKCS` and `CKM_RSA_PKCS_PSS` mechanisms
//! are needed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as Pkcs11Error, RvError};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use rustls::pki_types::CertificateDer;
use rustls::sign::{Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};
use sha2::{Digest, Sha256, Sha384};

use crate::error::{Error, Result};
use crate::slot_id;

use super::{load_ca_bundle, Credential};

/// Label of the token aktualizr-lite provisions
pub const TOKEN_LABEL: &str = "aktualizr";

/// Client certificate and key looked up on a token via `p11.*` keys
#[derive(Clone)]
pub struct HsmCredentialSource {
    pub module: PathBuf,
    pub pin: String,
    /// Digit-string object id of the private key (`p11.tls_pkey_id`)
    pub key_id: String,
    /// Digit-string object id of the certificate (`p11.tls_clientcert_id`)
    pub cert_id: String,
    pub ca_path: PathBuf,
}

impl fmt::Debug for HsmCredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmCredentialSource")
            .field("module", &self.module)
            .field("pin", &"<redacted>")
            .field("key_id", &self.key_id)
            .field("cert_id", &self.cert_id)
            .field("ca_path", &self.ca_path)
            .finish()
    }
}

impl HsmCredentialSource {
    /// Open the token and locate the key and certificate.
    ///
    /// The returned credential's signing key owns the token sessions, so the
    /// token stays open for as long as the TLS configuration built from it.
    pub fn resolve(&self) -> Result<Credential> {
        let key_id = slot_id::decode(&self.key_id)
            .map_err(|e| Error::Credential(format!("p11.tls_pkey_id: {}", e)))?;
        let cert_id = slot_id::decode(&self.cert_id)
            .map_err(|e| Error::Credential(format!("p11.tls_clientcert_id: {}", e)))?;

        let token = Arc::new(HsmToken::open(&self.module, TOKEN_LABEL, &self.pin)?);

        let key = token.find_private_key(&key_id)?;
        let cert = token.find_certificate(&cert_id)?;
        let (key, cert) = match (key, cert) {
            (Some(key), Some(cert)) => (key, cert),
            (key, cert) => {
                tracing::error!(
                    key_found = key.is_some(),
                    cert_found = cert.is_some(),
                    "Missing objects on token"
                );
                return Err(Error::Credential(
                    "unable to load pkcs11 client certificate and/or private key".to_string(),
                ));
            }
        };

        let kind = token.key_kind(key)?;
        let trust_anchors = load_ca_bundle(&self.ca_path)?;

        tracing::info!(
            module = %self.module.display(),
            key_id = %self.key_id,
            cert_id = %self.cert_id,
            key_kind = ?kind,
            "Loaded client credential from PKCS#11 token"
        );

        Ok(Credential {
            certificate_chain: vec![cert],
            private_key: Arc::new(HsmSigningKey { token, key, kind }),
            trust_anchors,
        })
    }
}

/// An open, logged-in PKCS#11 token
///
/// Two sessions are held: one reserved for signing and one for object
/// lookups. Sessions close and the module is finalised when this is dropped.
pub struct HsmToken {
    label: String,
    slot: Slot,
    signing: Mutex<Session>,
    lookup: Mutex<Session>,
    // Declared last so the sessions close before the module is released
    _module: Pkcs11,
}

impl fmt::Debug for HsmToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmToken")
            .field("label", &self.label)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl HsmToken {
    /// Load `module`, find the token labelled `label` and log in with `pin`.
    pub fn open(module: &Path, label: &str, pin: &str) -> Result<Self> {
        let pkcs11 = Pkcs11::new(module).map_err(|e| {
            Error::Credential(format!(
                "unable to load PKCS#11 module {}: {}",
                module.display(),
                e
            ))
        })?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| p11_error("initialize", e))?;

        let slot = find_token_slot(&pkcs11, label)?;

        let signing = pkcs11
            .open_ro_session(slot)
            .map_err(|e| p11_error("open session", e))?;
        let lookup = pkcs11
            .open_ro_session(slot)
            .map_err(|e| p11_error("open session", e))?;

        // Login state is shared by every session of the application
        match signing.login(UserType::User, Some(&AuthPin::new(pin.to_string()))) {
            Ok(()) => {}
            Err(Pkcs11Error::Pkcs11(RvError::UserAlreadyLoggedIn, ..)) => {}
            Err(e) => return Err(p11_error("login", e)),
        }

        tracing::debug!(label, ?slot, "Opened PKCS#11 token");

        Ok(Self {
            label: label.to_string(),
            slot,
            signing: Mutex::new(signing),
            lookup: Mutex::new(lookup),
            _module: pkcs11,
        })
    }

    /// Find the private key with `CKA_ID == id`.
    pub fn find_private_key(&self, id: &[u8]) -> Result<Option<ObjectHandle>> {
        let session = lock(&self.lookup)?;
        let handles = session
            .find_objects(&[
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::Id(id.to_vec()),
            ])
            .map_err(|e| p11_error("find private key", e))?;
        Ok(handles.into_iter().next())
    }

    /// Find the certificate with `CKA_ID == id` and return its DER value.
    pub fn find_certificate(&self, id: &[u8]) -> Result<Option<CertificateDer<'static>>> {
        let session = lock(&self.lookup)?;
        let handles = session
            .find_objects(&[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::Id(id.to_vec()),
            ])
            .map_err(|e| p11_error("find certificate", e))?;

        let Some(handle) = handles.into_iter().next() else {
            return Ok(None);
        };

        let attributes = session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| p11_error("read certificate", e))?;
        let der = attributes.into_iter().find_map(|attr| match attr {
            Attribute::Value(bytes) if !bytes.is_empty() => Some(bytes),
            _ => None,
        });

        Ok(der.map(CertificateDer::from))
    }

    fn key_kind(&self, key: ObjectHandle) -> Result<HsmKeyKind> {
        let session = lock(&self.lookup)?;
        let attributes = session
            .get_attributes(key, &[AttributeType::KeyType])
            .map_err(|e| p11_error("read key type", e))?;

        let key_type = attributes.into_iter().find_map(|attr| match attr {
            Attribute::KeyType(kt) => Some(kt),
            _ => None,
        });

        match key_type {
            Some(kt) if kt == KeyType::RSA => Ok(HsmKeyKind::Rsa),
            Some(kt) if kt == KeyType::EC => {
                let attributes = session
                    .get_attributes(key, &[AttributeType::EcParams])
                    .map_err(|e| p11_error("read EC parameters", e))?;
                let params = attributes.into_iter().find_map(|attr| match attr {
                    Attribute::EcParams(p) => Some(p),
                    _ => None,
                });
                match params.as_deref().and_then(EcCurve::from_params) {
                    Some(curve) => Ok(HsmKeyKind::Ec(curve)),
                    None => Err(Error::Credential(
                        "unsupported EC curve on token key (expected P-256 or P-384)".to_string(),
                    )),
                }
            }
            Some(kt) => Err(Error::Credential(format!(
                "unsupported key type on token: {}",
                kt
            ))),
            None => Err(Error::Credential(
                "token key has no CKA_KEY_TYPE".to_string(),
            )),
        }
    }

    fn sign(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>> {
        let session = lock(&self.signing)?;
        session
            .sign(mechanism, key, data)
            .map_err(|e| p11_error("sign", e))
    }
}

fn find_token_slot(pkcs11: &Pkcs11, label: &str) -> Result<Slot> {
    let slots = pkcs11
        .get_slots_with_token()
        .map_err(|e| p11_error("list slots", e))?;

    for slot in slots {
        match pkcs11.get_token_info(slot) {
            Ok(info) if info.label().trim_end() == label => return Ok(slot),
            Ok(_) => {}
            Err(e) => tracing::debug!(?slot, error = %e, "Skipping slot"),
        }
    }

    Err(Error::Credential(format!(
        "no PKCS#11 token labelled {:?}",
        label
    )))
}

fn lock(session: &Mutex<Session>) -> Result<MutexGuard<'_, Session>> {
    session
        .lock()
        .map_err(|_| Error::Credential("PKCS#11 session lock poisoned".to_string()))
}

fn p11_error(operation: &str, err: cryptoki::error::Error) -> Error {
    Error::Credential(format!("PKCS#11 {} failed: {}", operation, err))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EcCurve {
    P256,
    P384,
}

// DER-encoded OIDs as stored in CKA_EC_PARAMS
const OID_P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const OID_P384: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];

impl EcCurve {
    fn from_params(params: &[u8]) -> Option<Self> {
        match params {
            OID_P256 => Some(EcCurve::P256),
            OID_P384 => Some(EcCurve::P384),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HsmKeyKind {
    Rsa,
    Ec(EcCurve),
}

impl HsmKeyKind {
    /// Schemes this key can produce, most preferred first
    fn schemes(&self) -> &'static [SignatureScheme] {
        match self {
            HsmKeyKind::Rsa => &[
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
            ],
            HsmKeyKind::Ec(EcCurve::P256) => &[SignatureScheme::ECDSA_NISTP256_SHA256],
            HsmKeyKind::Ec(EcCurve::P384) => &[SignatureScheme::ECDSA_NISTP384_SHA384],
        }
    }
}

/// rustls signing key backed by a token object
#[derive(Debug)]
struct HsmSigningKey {
    token: Arc<HsmToken>,
    key: ObjectHandle,
    kind: HsmKeyKind,
}

impl SigningKey for HsmSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = self
            .kind
            .schemes()
            .iter()
            .copied()
            .find(|scheme| offered.contains(scheme))?;

        Some(Box::new(HsmSigner {
            token: Arc::clone(&self.token),
            key: self.key,
            scheme,
        }))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        match self.kind {
            HsmKeyKind::Rsa => SignatureAlgorithm::RSA,
            HsmKeyKind::Ec(_) => SignatureAlgorithm::ECDSA,
        }
    }
}

#[derive(Debug)]
struct HsmSigner {
    token: Arc<HsmToken>,
    key: ObjectHandle,
    scheme: SignatureScheme,
}

impl Signer for HsmSigner {
    fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, rustls::Error> {
        let (mechanism, data) = signing_input(self.scheme, message)?;

        let signature = self
            .token
            .sign(&mechanism, self.key, &data)
            .map_err(|e| rustls::Error::General(e.to_string()))?;

        match self.scheme {
            SignatureScheme::ECDSA_NISTP256_SHA256 | SignatureScheme::ECDSA_NISTP384_SHA384 => {
                ecdsa_signature_to_der(&signature)
            }
            _ => Ok(signature),
        }
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

// DigestInfo headers for CKM_RSA_PKCS (RFC 8017, section 9.2)
const SHA256_DIGEST_INFO: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];
const SHA384_DIGEST_INFO: &[u8] = &[
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02,
    0x05, 0x00, 0x04, 0x30,
];

/// Pick the mechanism and the bytes handed to `C_Sign` for a scheme.
fn signing_input(
    scheme: SignatureScheme,
    message: &[u8],
) -> std::result::Result<(Mechanism<'static>, Vec<u8>), rustls::Error> {
    let sha256 = || Sha256::digest(message).to_vec();
    let sha384 = || Sha384::digest(message).to_vec();

    let input = match scheme {
        SignatureScheme::RSA_PSS_SHA256 => (
            Mechanism::RsaPkcsPss(PkcsPssParams {
                hash_alg: MechanismType::SHA256,
                mgf: PkcsMgfType::MGF1_SHA256,
                s_len: 32.into(),
            }),
            sha256(),
        ),
        SignatureScheme::RSA_PSS_SHA384 => (
            Mechanism::RsaPkcsPss(PkcsPssParams {
                hash_alg: MechanismType::SHA384,
                mgf: PkcsMgfType::MGF1_SHA384,
                s_len: 48.into(),
            }),
            sha384(),
        ),
        SignatureScheme::RSA_PKCS1_SHA256 => {
            (Mechanism::RsaPkcs, [SHA256_DIGEST_INFO, sha256().as_slice()].concat())
        }
        SignatureScheme::RSA_PKCS1_SHA384 => {
            (Mechanism::RsaPkcs, [SHA384_DIGEST_INFO, sha384().as_slice()].concat())
        }
        SignatureScheme::ECDSA_NISTP256_SHA256 => (Mechanism::Ecdsa, sha256()),
        SignatureScheme::ECDSA_NISTP384_SHA384 => (Mechanism::Ecdsa, sha384()),
        other => {
            return Err(rustls::Error::General(format!(
                "unsupported signature scheme {:?}",
                other
            )));
        }
    };

    Ok(input)
}

/// Convert a PKCS#11 ECDSA signature (`r || s`) into a DER `Ecdsa-Sig-Value`.
fn ecdsa_signature_to_der(raw: &[u8]) -> std::result::Result<Vec<u8>, rustls::Error> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(rustls::Error::General(format!(
            "malformed ECDSA signature of {} bytes",
            raw.len()
        )));
    }

    let (r, s) = raw.split_at(raw.len() / 2);
    let mut body = der_integer(r);
    body.extend(der_integer(s));

    let mut out = vec![0x30];
    push_der_length(&mut out, body.len());
    out.extend(body);
    Ok(out)
}

fn der_integer(mut bytes: &[u8]) -> Vec<u8> {
    while bytes.len() > 1 && bytes[0] == 0 {
        bytes = &bytes[1..];
    }
    let pad = bytes[0] & 0x80 != 0;

    let mut out = vec![0x02];
    push_der_length(&mut out, bytes.len() + usize::from(pad));
    if pad {
        out.push(0);
    }
    out.extend_from_slice(bytes);
    out
}

fn push_der_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend([0x81, len as u8]);
    } else {
        out.extend([0x82, (len >> 8) as u8, len as u8]);
    }
}
