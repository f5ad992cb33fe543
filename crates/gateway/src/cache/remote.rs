//! Distributed L2 cache backend
//!
//! A thin client for a REST key-value store with TTL support (endpoint +
//! bearer token, Upstash-style). The gateway addresses entries under the
//! `tool-cache:` prefix. Every failure here is non-fatal; callers degrade to
//! L1-only behavior.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const KEY_PREFIX: &str = "tool-cache:";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum RemoteKvError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned status {0}")]
    Status(u16),

    #[error("Invalid backend payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Wire format of a stored entry
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredEntry {
    pub payload: Value,
    pub ttl_seconds: u64,
}

#[derive(Serialize)]
struct SetRequest<'a> {
    key: String,
    value: &'a StoredEntry,
    ttl_seconds: u64,
}

pub struct RemoteKv {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteKv {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RemoteKvError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn qualified(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<StoredEntry>, RemoteKvError> {
        let url = format!("{}/get/{}", self.base_url, Self::qualified(key));
        let mut builder = self.http.get(&url);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        match response.status().as_u16() {
            200 => {
                let entry: StoredEntry = serde_json::from_str(&response.text().await?)?;
                Ok(Some(entry))
            }
            404 => Ok(None),
            status => Err(RemoteKvError::Status(status)),
        }
    }

    pub async fn set(
        &self,
        key: &str,
        entry: &StoredEntry,
        ttl: Duration,
    ) -> Result<(), RemoteKvError> {
        let url = format!("{}/set", self.base_url);
        let mut builder = self.http.post(&url);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .json(&SetRequest {
                key: Self::qualified(key),
                value: entry,
                ttl_seconds: ttl.as_secs(),
            })
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RemoteKvError::Status(response.status().as_u16()))
        }
    }

    /// Liveness probe for /health reporting
    pub async fn ping(&self) -> bool {
        let url = format!("{}/ping", self.base_url);
        let mut builder = self.http.get(&url);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        matches!(builder.send().await, Ok(r) if r.status().is_success())
    }
}
