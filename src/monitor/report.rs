//! Usage reports for the billing collector
//!
//! One JSON record per report, POSTed to `{collector}/api/v0/put` with an
//! `Authorization` header holding the gateway's signature over the exact
//! body bytes.

use chrono::Utc;
use ed25519_dalek::SigningKey;
use hyper::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::auth::sign_base64;
use crate::types::{GatewayError, Result};

/// Report format version
pub const RECORD_VERSION: u32 = 1;

/// The signed request a report is billed against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedRequest {
    pub method: String,
    pub host: String,
    pub uri: String,
    /// `p3args` token as received
    pub args: String,
    /// `p3sig` signature as received
    pub sig: String,
}

/// One usage report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub version: u32,
    pub req: ReportedRequest,
    /// Signed content size change (pins add, unpins subtract)
    pub cid_size: i64,
    pub ingress: u64,
    pub egress: u64,
    /// Unix seconds
    pub at: i64,
}

impl UsageRecord {
    pub fn new(req: ReportedRequest, ingress: u64, egress: u64, cid_size: i64) -> Self {
        Self {
            version: RECORD_VERSION,
            req,
            cid_size,
            ingress,
            egress,
            at: Utc::now().timestamp(),
        }
    }
}

/// Delivers usage records to the billing collector
#[async_trait::async_trait]
pub trait Reporter: Send + Sync {
    async fn send(&self, record: &UsageRecord) -> Result<()>;
}

// =============================================================================
// HTTP collector
// =============================================================================

pub struct HttpReporter {
    client: reqwest::Client,
    endpoint: String,
    key: SigningKey,
}

impl HttpReporter {
    pub fn new(client: reqwest::Client, collector_url: &str, key: SigningKey) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/v0/put", collector_url.trim_end_matches('/')),
            key,
        }
    }
}

#[async_trait::async_trait]
impl Reporter for HttpReporter {
    async fn send(&self, record: &UsageRecord) -> Result<()> {
        let body = serde_json::to_vec(record)
            .map_err(|e| GatewayError::Reporting(format!("error marshaling record: {e}")))?;
        let sig = sign_base64(&body, &self.key);

        let resp = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, sig)
            .timeout(Duration::from_secs(30))
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::Reporting(format!("error making log request: {e}")))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let msg = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Reporting(format!(
                "unexpected status: [{status}] {msg}"
            )));
        }

        debug!(uri = %record.req.uri, ingress = record.ingress, egress = record.egress, "Usage reported");
        Ok(())
    }
}

// =============================================================================
// In-memory collector
// =============================================================================

/// Keeps records in memory; optionally rejects every send
#[derive(Debug, Default)]
pub struct MemoryReporter {
    records: Mutex<Vec<UsageRecord>>,
    failing: AtomicBool,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, Ordering::SeqCst);
    }

    /// Records accepted so far
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Reporter for MemoryReporter {
    async fn send(&self, record: &UsageRecord) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Reporting("collector unavailable".into()));
        }
        self.records
            .lock()
            .map_err(|_| GatewayError::Internal("reporter lock poisoned".into()))?
            .push(record.clone());
        Ok(())
    }
}
