//! # eventship-core
//!
//! Core library for eventship - a device agent that ships spooled event
//! files to a remote collector over mutual TLS.
//!
//! This library provides:
//! - Client identity from PEM files or a PKCS#11 token
//! - A mutual-TLS HTTP client trusting only the configured CA bundle
//! - Spool directory collection and the upload cycle
//! - Configuration, error and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! sota.toml ─► SotaConfig ─► CredentialSource ─► Credential ─► CollectorClient
//!                                  │                                 │
//!                             slot_id::decode                        ▼
//! spool dir ─────────────────────► Spool ────────────────────► UploadCycle
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use eventship_core::{CollectorClient, Spool, SotaConfig, UploadCycle};
//!
//! # async fn run() -> eventship_core::Result<()> {
//! let sota = SotaConfig::load_from(Path::new("/var/sota/sota.toml"))?;
//! let credential = sota.credential_source()?.resolve()?;
//! let client = CollectorClient::new(credential, "https://collector.example.com/events")?;
//!
//! let spool = Spool::new("/var/run/events");
//! let mut cycle = UploadCycle::new(spool, client, Duration::from_secs(10));
//! cycle.run_once().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use collector::{CollectorClient, Event};
pub use config::{AgentConfig, LoggingConfig, SotaConfig, UnreadablePolicy};
pub use credential::{Credential, CredentialSource};
pub use cycle::{CycleOutcome, CycleState, CycleStats, UploadCycle};
pub use error::{Error, Result};
pub use spool::Spool;

// Public modules
pub mod collector;
pub mod config;
pub mod credential;
pub mod cycle;
pub mod error;
pub mod logging;
pub mod slot_id;
pub mod spool;
pub mod transport;
