//! Signed argument bundle
//!
//! Query parameters, headers and a handful of gateway arguments travel
//! inside one opaque token (`p3args`) so that a single detached signature
//! (`p3sig`) covers all of them. Anything not carried in the token is
//! dropped by the auth layer before the request reaches the storage node.
//!
//! Multi-valued parameters and headers are joined with [`VALUE_DELIMITER`].
//! There is no escaping: a value that itself contains `;;;` is split on
//! decode. Callers must not send such values.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::{GatewayError, Result};

/// Query parameter carrying the encoded [`SignedArgs`]
pub const PARAM_ARGS: &str = "p3args";

/// Query parameter carrying the detached request signature
pub const PARAM_SIG: &str = "p3sig";

/// Query parameter the access code is re-injected into
pub const PARAM_ACCESS_CODE: &str = "p3ac";

/// Request-issue timestamp (unix seconds)
pub const ARG_UNIXTIME: &str = "unixtime";

/// Client identity
pub const ARG_NODE: &str = "node";

/// Optional byte cap for ingress and backing-store fetches
pub const ARG_SIZE: &str = "size";

/// Separator for multi-valued params and headers
pub const VALUE_DELIMITER: &str = ";;;";

/// Window accepted by the gateway around `unixtime`
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(10 * 60);

/// Parameters, headers and gateway arguments bundled into one signed token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedArgs {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl SignedArgs {
    /// Create args stamped with the current time and the client identity
    pub fn new(node: impl Into<String>) -> Self {
        Self::default()
            .with_arg(ARG_UNIXTIME, chrono::Utc::now().timestamp().to_string())
            .with_arg(ARG_NODE, node)
    }

    /// Bundle multi-valued params and headers for a client identity.
    ///
    /// Repeated keys are joined with [`VALUE_DELIMITER`] in iteration order.
    pub fn bundle<P, H, K, V>(params: P, headers: H, node: impl Into<String>) -> Self
    where
        P: IntoIterator<Item = (K, V)>,
        H: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut args = Self::new(node);
        for (k, v) in params {
            args.add_param(k, v.as_ref());
        }
        for (k, v) in headers {
            args.add_header(k, v.as_ref());
        }
        args
    }

    /// Set a query parameter, replacing earlier values
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set a header, replacing earlier values
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set a gateway argument
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Append a value to a query parameter
    pub fn add_param(&mut self, key: impl Into<String>, value: &str) {
        join_value(&mut self.params, key.into(), value);
    }

    /// Append a value to a header
    pub fn add_header(&mut self, key: impl Into<String>, value: &str) {
        join_value(&mut self.headers, key.into(), value);
    }

    /// All values of a query parameter
    pub fn param_values(&self, key: &str) -> Vec<&str> {
        self.params.get(key).map(|v| split_values(v).collect()).unwrap_or_default()
    }

    /// All values of a header
    pub fn header_values(&self, key: &str) -> Vec<&str> {
        self.headers.get(key).map(|v| split_values(v).collect()).unwrap_or_default()
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn unixtime(&self) -> Option<i64> {
        self.arg(ARG_UNIXTIME).and_then(|v| v.parse().ok())
    }

    pub fn node(&self) -> Option<&str> {
        self.arg(ARG_NODE)
    }

    /// Byte cap carried in the `size` argument.
    ///
    /// A missing, zero or non-numeric value means "no cap".
    pub fn size_cap(&self) -> Option<u64> {
        self.arg(ARG_SIZE)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|cap| *cap > 0)
    }

    /// Serialize into the opaque token carried in `p3args`
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| GatewayError::Internal(format!("Failed to serialize args: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Parse a token produced by [`SignedArgs::encode`]
    pub fn decode(token: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|e| GatewayError::Decode(format!("invalid base64: {e}")))?;
        let args: SignedArgs = serde_json::from_slice(&raw)
            .map_err(|e| GatewayError::Decode(format!("invalid json: {e}")))?;

        if args.unixtime().is_none() {
            return Err(GatewayError::Decode(format!("missing or invalid {ARG_UNIXTIME}")));
        }
        if args.node().is_none() {
            return Err(GatewayError::Decode(format!("missing {ARG_NODE}")));
        }

        Ok(args)
    }
}

fn join_value(map: &mut BTreeMap<String, String>, key: String, value: &str) {
    map.entry(key)
        .and_modify(|existing| {
            existing.push_str(VALUE_DELIMITER);
            existing.push_str(value);
        })
        .or_insert_with(|| value.to_string());
}

/// Split a joined value back into its parts
pub fn split_values(value: &str) -> impl Iterator<Item = &str> {
    value.split(VALUE_DELIMITER)
}

/// Check `unixtime` against the wall clock.
///
/// Returns the validated timestamp.
pub fn validate_timestamp(args: &SignedArgs, max_skew: Duration) -> Result<i64> {
    validate_timestamp_at(args, max_skew, chrono::Utc::now().timestamp())
}

/// Same as [`validate_timestamp`] against an explicit `now`
pub fn validate_timestamp_at(args: &SignedArgs, max_skew: Duration, now: i64) -> Result<i64> {
    let ts = args
        .unixtime()
        .ok_or_else(|| GatewayError::Timestamp(format!("missing {ARG_UNIXTIME}")))?;

    let skew = now.abs_diff(ts);
    if skew > max_skew.as_secs() {
        return Err(GatewayError::Timestamp(format!(
            "timestamp {ts} is {skew}s away from now"
        )));
    }

    Ok(ts)
}
