//! Configuration loading and validation
//!
//! Two sources feed the agent:
//! - `sota.toml`, shared with aktualizr-lite, which says where the TLS client
//!   identity lives (`[tls]`, `[import]` and `[p11]` sections)
//! - runtime settings (spool directory, collector URL, interval, logging)
//!   assembled by the binary from its command line
//!
//! Both are validated up front. Every problem found here is fatal: the agent
//! must not start without a usable client identity.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::credential::{CredentialSource, FileCredentialSource, HsmCredentialSource};
use crate::error::{Error, Result};

/// Default spool directory
pub const DEFAULT_EVENTS_DIR: &str = "/var/run/events";

/// Default location of aktualizr-lite's configuration
pub const DEFAULT_SOTA_TOML: &str = "/var/sota/sota.toml";

/// Default seconds between upload cycles
pub const DEFAULT_INTERVAL_SECS: u64 = 10;

/// The `sota.toml` subset this agent reads
///
/// Sections and keys that are not listed here are ignored, the file belongs
/// to aktualizr-lite.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct SotaConfig {
    #[serde(default)]
    pub tls: TlsSection,

    #[serde(default)]
    pub import: ImportSection,

    #[serde(default)]
    pub p11: P11Section,
}

/// `[tls]` credential source selection
#[derive(Debug, Deserialize, Default, Clone)]
pub struct TlsSection {
    pub ca_source: Option<String>,
    pub pkey_source: Option<String>,
    pub cert_source: Option<String>,
}

/// `[import]` file paths
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ImportSection {
    pub tls_cacert_path: Option<String>,
    pub tls_clientcert_path: Option<String>,
    pub tls_pkey_path: Option<String>,
}

/// `[p11]` HSM module and object identifiers
#[derive(Deserialize, Default, Clone)]
pub struct P11Section {
    pub module: Option<String>,
    pub pass: Option<String>,
    pub tls_pkey_id: Option<String>,
    pub tls_clientcert_id: Option<String>,
}

impl fmt::Debug for P11Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P11Section")
            .field("module", &self.module)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("tls_pkey_id", &self.tls_pkey_id)
            .field("tls_clientcert_id", &self.tls_clientcert_id)
            .finish()
    }
}

/// Where the client key and certificate come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Pkcs11,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Pkcs11 => "pkcs11",
        }
    }

    fn parse(key: &str, value: &str) -> Result<Self> {
        match value {
            "file" => Ok(SourceKind::File),
            "pkcs11" => Ok(SourceKind::Pkcs11),
            other => Err(invalid_value(key, other, "expected \"file\" or \"pkcs11\"")),
        }
    }
}

impl SotaConfig {
    /// Load `sota.toml` from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Parse `sota.toml` content
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Validate the `[tls]` selection and gather the keys the chosen source needs.
    ///
    /// The CA bundle always comes from a file. The key and certificate must
    /// come from the same place.
    pub fn credential_source(&self) -> Result<CredentialSource> {
        let ca_source = required("tls.ca_source", &self.tls.ca_source)?;
        if ca_source != "file" {
            return Err(invalid_value(
                "tls.ca_source",
                ca_source,
                "only \"file\" is supported",
            ));
        }

        let pkey_source = SourceKind::parse(
            "tls.pkey_source",
            required("tls.pkey_source", &self.tls.pkey_source)?,
        )?;

        let cert_source = required("tls.cert_source", &self.tls.cert_source)?;
        if cert_source != pkey_source.as_str() {
            return Err(invalid_value(
                "tls.cert_source",
                cert_source,
                &format!("must match tls.pkey_source ({})", pkey_source.as_str()),
            ));
        }

        let source = match pkey_source {
            SourceKind::File => CredentialSource::File(FileCredentialSource {
                cert_path: required_path(
                    "import.tls_clientcert_path",
                    &self.import.tls_clientcert_path,
                )?,
                key_path: required_path("import.tls_pkey_path", &self.import.tls_pkey_path)?,
                ca_path: required_path("import.tls_cacert_path", &self.import.tls_cacert_path)?,
            }),
            SourceKind::Pkcs11 => CredentialSource::Pkcs11(HsmCredentialSource {
                module: required_path("p11.module", &self.p11.module)?,
                pin: required("p11.pass", &self.p11.pass)?.to_string(),
                key_id: required("p11.tls_pkey_id", &self.p11.tls_pkey_id)?.to_string(),
                cert_id: required("p11.tls_clientcert_id", &self.p11.tls_clientcert_id)?
                    .to_string(),
                ca_path: required_path("import.tls_cacert_path", &self.import.tls_cacert_path)?,
            }),
        };

        Ok(source)
    }
}

fn required<'a>(key: &str, value: &'a Option<String>) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Config(format!("missing {} in sota.toml", key))),
    }
}

fn required_path(key: &str, value: &Option<String>) -> Result<PathBuf> {
    required(key, value).map(PathBuf::from)
}

fn invalid_value(key: &str, value: &str, hint: &str) -> Error {
    Error::Config(format!(
        "invalid value {:?} in sota.toml for {}: {}",
        value, key, hint
    ))
}

/// What to do with spool files that could not be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnreadablePolicy {
    /// Leave them in place; they are retried next cycle
    #[default]
    Retain,
    /// Remove them together with the uploaded batch
    Delete,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Write rotated log files here instead of stderr
    pub directory: Option<PathBuf>,

    /// Maximum number of log files to keep
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Runtime settings of the upload loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Spool directory holding one file per event
    pub events_dir: PathBuf,

    /// Collector endpoint, e.g. `https://example.com/events`
    pub events_url: String,

    /// Sleep between cycles
    pub interval: Duration,

    /// Path to aktualizr-lite's `sota.toml`
    pub sota_toml: PathBuf,

    /// Handling of unreadable spool files after a successful upload
    pub unreadable: UnreadablePolicy,

    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            events_dir: PathBuf::from(DEFAULT_EVENTS_DIR),
            events_url: String::new(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            sota_toml: PathBuf::from(DEFAULT_SOTA_TOML),
            unreadable: UnreadablePolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.events_url.is_empty() {
            return Err(Error::Config("events url is required".to_string()));
        }

        let url = reqwest::Url::parse(&self.events_url).map_err(|e| {
            Error::Config(format!("invalid events url {:?}: {}", self.events_url, e))
        })?;
        if !matches!(url.scheme(), "https" | "http") || url.host_str().is_none() {
            return Err(Error::Config(format!(
                "events url must be an absolute http(s) URL: {}",
                self.events_url
            )));
        }

        if self.interval.is_zero() {
            return Err(Error::Config(
                "interval must be at least 1 second".to_string(),
            ));
        }

        match std::fs::metadata(&self.events_dir) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::Config(format!(
                "events dir {} is not a directory",
                self.events_dir.display()
            ))),
            Err(e) => Err(Error::Config(format!(
                "unable to access events dir {}: {}",
                self.events_dir.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_SOTA: &str = r#"
[tls]
server = "https://ota-lite.example.com:8443"
ca_source = "file"
pkey_source = "file"
cert_source = "file"

[provision]
server = "https://ota-lite.example.com:8443"

[import]
base_path = "/var/sota"
tls_cacert_path = "/var/sota/root.crt"
tls_clientcert_path = "/var/sota/client.pem"
tls_pkey_path = "/var/sota/pkey.pem"
"#;

    const P11_SOTA: &str = r#"
[tls]
ca_source = "file"
pkey_source = "pkcs11"
cert_source = "pkcs11"

[p11]
module = "/usr/lib/softhsm/libsofthsm2.so"
pass = "87654321"
tls_pkey_id = "01"
tls_clientcert_id = "03"

[import]
tls_cacert_path = "/var/sota/root.crt"
"#;

    #[test]
    fn test_file_source() {
        let config = SotaConfig::parse(FILE_SOTA).unwrap();
        match config.credential_source().unwrap() {
            CredentialSource::File(src) => {
                assert_eq!(src.cert_path, PathBuf::from("/var/sota/client.pem"));
                assert_eq!(src.key_path, PathBuf::from("/var/sota/pkey.pem"));
                assert_eq!(src.ca_path, PathBuf::from("/var/sota/root.crt"));
            }
            other => panic!("expected file source, got {:?}", other),
        }
    }

    #[test]
    fn test_pkcs11_source() {
        let config = SotaConfig::parse(P11_SOTA).unwrap();
        match config.credential_source().unwrap() {
            CredentialSource::Pkcs11(src) => {
                assert_eq!(src.module, PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"));
                assert_eq!(src.pin, "87654321");
                assert_eq!(src.key_id, "01");
                assert_eq!(src.cert_id, "03");
                assert_eq!(src.ca_path, PathBuf::from("/var/sota/root.crt"));
            }
            other => panic!("expected pkcs11 source, got {:?}", other),
        }
    }

    #[test]
    fn test_pin_is_not_printed() {
        let config = SotaConfig::parse(P11_SOTA).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("87654321"));

        let source = config.credential_source().unwrap();
        assert!(!format!("{:?}", source).contains("87654321"));
    }

    #[test]
    fn test_pkey_source_typo_is_config_error() {
        let content = P11_SOTA.replace("pkey_source = \"pkcs11\"", "pkey_source = \"pcks11\"");
        let config = SotaConfig::parse(&content).unwrap();
        let err = config.credential_source().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("tls.pkey_source"));
    }

    #[test]
    fn test_ca_source_must_be_file() {
        let content = FILE_SOTA.replace("ca_source = \"file\"", "ca_source = \"pkcs11\"");
        let err = SotaConfig::parse(&content)
            .unwrap()
            .credential_source()
            .unwrap_err();
        assert!(err.to_string().contains("tls.ca_source"));
    }

    #[test]
    fn test_cert_source_must_match_pkey_source() {
        let content = FILE_SOTA.replace("cert_source = \"file\"", "cert_source = \"pkcs11\"");
        let err = SotaConfig::parse(&content)
            .unwrap()
            .credential_source()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("tls.cert_source"));
    }

    #[test]
    fn test_missing_and_empty_keys() {
        let content = FILE_SOTA.replace("tls_pkey_path = \"/var/sota/pkey.pem\"", "");
        let err = SotaConfig::parse(&content)
            .unwrap()
            .credential_source()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: missing import.tls_pkey_path in sota.toml"
        );

        let content = P11_SOTA.replace("pass = \"87654321\"", "pass = \"\"");
        let err = SotaConfig::parse(&content)
            .unwrap()
            .credential_source()
            .unwrap_err();
        assert!(err.to_string().contains("missing p11.pass"));

        let err = SotaConfig::default().credential_source().unwrap_err();
        assert!(err.to_string().contains("missing tls.ca_source"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = SotaConfig::load_from(Path::new("/nonexistent/sota.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_from_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sota.toml");
        std::fs::write(&path, "[tls\nca_source = ").unwrap();
        let err = SotaConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.events_dir, PathBuf::from("/var/run/events"));
        assert_eq!(config.sota_toml, PathBuf::from("/var/sota/sota.toml"));
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.unreadable, UnreadablePolicy::Retain);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn test_agent_config_validation() {
        let dir = tempfile::tempdir().unwrap();

        // URL is required
        let config = AgentConfig {
            events_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            events_dir: dir.path().to_path_buf(),
            events_url: "https://collector.example.com/events".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let relative = AgentConfig {
            events_url: "/events".to_string(),
            ..config.clone()
        };
        assert!(relative.validate().is_err());

        let ftp = AgentConfig {
            events_url: "ftp://collector.example.com/events".to_string(),
            ..config.clone()
        };
        assert!(ftp.validate().is_err());

        let zero = AgentConfig {
            interval: Duration::ZERO,
            ..config.clone()
        };
        assert!(zero.validate().is_err());

        let missing_dir = AgentConfig {
            events_dir: dir.path().join("missing"),
            ..config
        };
        assert!(missing_dir.validate().is_err());
    }
}
