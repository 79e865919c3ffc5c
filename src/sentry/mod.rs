//! Content sentry
//!
//! Streaming response filter that withholds HTML in bounded batches and
//! blocks delivery once a denylisted marker shows up. Bytes already
//! released cannot be recalled: a match after the first batch went out
//! only stops the rest of the stream.

pub mod middleware;
pub mod rules;

use bytes::{Bytes, BytesMut};

use crate::types::{GatewayError, Result};

pub use middleware::SentryMiddleware;
pub use rules::{check_sentry_rules, SentryRule, RULES};

/// Bytes held back before a clean batch is released
pub const BATCH_SIZE: usize = 64 * 1024;

/// Whether a response with this `Content-Type` is inspected
pub fn should_enable_detection(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => ct.is_empty() || ct.starts_with("text/html"),
    }
}

/// Per-response sentry state
#[derive(Debug)]
pub struct ContentSentry {
    enabled: bool,
    batch_size: usize,
    buf: BytesMut,
    /// Tail of the bytes already scanned, so markers split across writes match
    carry: Vec<u8>,
    carry_len: usize,
    flagged: Option<&'static str>,
}

impl ContentSentry {
    pub fn new(enabled: bool) -> Self {
        Self::with_batch_size(enabled, BATCH_SIZE)
    }

    pub fn with_batch_size(enabled: bool, batch_size: usize) -> Self {
        let max_rule = RULES.iter().map(|r| r.exact.len()).max().unwrap_or(1);
        Self {
            enabled,
            batch_size: batch_size.max(1),
            buf: BytesMut::new(),
            carry: Vec::new(),
            carry_len: max_rule.saturating_sub(1),
            flagged: None,
        }
    }

    /// Decide detection from the response `Content-Type`
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        Self::new(should_enable_detection(content_type))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Rule that flagged this response, if any
    pub fn flagged_rule(&self) -> Option<&'static str> {
        self.flagged
    }

    /// Feed response bytes.
    ///
    /// Returns bytes that may be released downstream. Fails with
    /// `BadContent` on the write that completes a marker and on every write
    /// after it.
    pub fn write(&mut self, data: &[u8]) -> Result<Option<Bytes>> {
        if let Some(rule) = self.flagged {
            return Err(GatewayError::BadContent(rule));
        }

        if !self.enabled {
            return Ok((!data.is_empty()).then(|| Bytes::copy_from_slice(data)));
        }

        let mut window = Vec::with_capacity(self.carry.len() + data.len());
        window.extend_from_slice(&self.carry);
        window.extend_from_slice(data);

        if let Some(rule) = check_sentry_rules(&window) {
            self.flagged = Some(rule);
            self.buf.clear();
            return Err(GatewayError::BadContent(rule));
        }

        let keep = window.len().min(self.carry_len);
        self.carry = window.split_off(window.len() - keep);

        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.batch_size {
            let full = self.buf.len() - self.buf.len() % self.batch_size;
            return Ok(Some(self.buf.split_to(full).freeze()));
        }
        Ok(None)
    }

    /// End of body: release whatever is still buffered
    pub fn finish(&mut self) -> Result<Option<Bytes>> {
        if let Some(rule) = self.flagged {
            return Err(GatewayError::BadContent(rule));
        }
        if self.buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}
