//! Event records as sent to the collector

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One spool file, as uploaded
///
/// Field names match the collector's schema (`Time`, `Msg`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Last-modified time of the spool file, Unix seconds
    #[serde(rename = "Time")]
    pub timestamp: i64,

    /// Verbatim file content
    #[serde(rename = "Msg")]
    pub message: String,
}

impl Event {
    pub fn new(timestamp: i64, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }

    /// Build an event from raw file content and its modification time.
    ///
    /// Invalid UTF-8 sequences are replaced with U+FFFD since JSON strings
    /// cannot carry arbitrary bytes.
    pub fn from_file_content(modified: SystemTime, content: &[u8]) -> Self {
        Self {
            timestamp: unix_seconds(modified),
            message: String::from_utf8_lossy(content).into_owned(),
        }
    }
}

/// Seconds since the epoch, negative for times before 1970
fn unix_seconds(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp()
}
