//! HTTP client for the event collector

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::transport;

use super::events::Event;

/// Sends event batches to one collector URL
pub struct CollectorClient {
    http_client: reqwest::Client,
    url: String,
}

impl CollectorClient {
    /// Create a mutual-TLS client for `url`.
    pub fn new(credential: Credential, url: impl Into<String>) -> Result<Self> {
        let http_client = transport::build_http_client(credential)?;
        Ok(Self::with_http_client(http_client, url))
    }

    /// Use an already configured HTTP client.
    pub fn with_http_client(http_client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http_client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST a batch as a JSON array.
    ///
    /// Succeeds only on `200 OK` or `201 Created`. The response body is
    /// ignored on success and carried in [`Error::Server`] otherwise.
    pub async fn send_events(&self, events: &[Event]) -> Result<()> {
        let body = serde_json::to_vec(events)?;

        tracing::debug!(
            url = %self.url,
            events = events.len(),
            bytes = body.len(),
            "Sending events"
        );

        let response = self
            .http_client
            .post(&self.url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                Error::Network(format!("unable to POST {}: {}", self.url, error_chain(&e)))
            })?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(Error::Server {
            status: status.as_u16(),
            body,
        })
    }
}

/// reqwest hides TLS and connect failures in the source chain
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
