//! Error types for Tollgate
//!
//! One enum covers every failure a request can hit on its way through the
//! pipeline. Terminal variants map to a client-visible status; `Reporting`
//! never reaches a client and only shows up in logs and counters.

use hyper::StatusCode;

/// Main error type for gateway operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Signed token could not be decoded
    #[error("Malformed signed args: {0}")]
    Decode(String),

    /// Token timestamp is outside the accepted window
    #[error("Expired or future timestamp: {0}")]
    Timestamp(String),

    /// Signature absent; kept apart from `Auth` because it may redirect
    #[error("Request signature missing")]
    SignatureMissing,

    /// Bad signature or missing signed args
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Namespace is not whitelisted
    #[error("Namespace not whitelisted: {0}")]
    Whitelist(String),

    /// Request body or backing-store fetch exceeded the signed size cap
    #[error("Body size cap exceeded")]
    SizeCapExceeded,

    /// Response content matched a sentry rule
    #[error("Bad content (rule: {0})")]
    BadContent(&'static str),

    /// Usage report could not be delivered
    #[error("Reporting error: {0}")]
    Reporting(String),

    /// DAG traversal failed (missing or unreachable node)
    #[error("DAG traversal error: {0}")]
    Traversal(String),

    /// CID in a children update is not a direct link of the root
    #[error("CID is not a child from root: {0}")]
    NotAChild(String),

    /// Same (cid, recursive) pair both incremented and decremented
    #[error("Duplicated CID found: {0}")]
    DuplicateEntry(String),

    /// Root is not pinned
    #[error("Not pinned: {0}")]
    NotPinned(String),

    /// Pin index storage failed
    #[error("Pin index error: {0}")]
    Index(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request scope deadline fired
    #[error("Request timed out")]
    Timeout,

    /// Request scope was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Storage node returned an error or could not be reached
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::Timestamp(_) => StatusCode::BAD_REQUEST,
            Self::SignatureMissing => StatusCode::UNAUTHORIZED,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Whitelist(_) => StatusCode::NOT_FOUND,
            Self::SizeCapExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadContent(_) => StatusCode::GONE,
            Self::Reporting(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Traversal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotAChild(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateEntry(_) => StatusCode::BAD_REQUEST,
            Self::NotPinned(_) => StatusCode::BAD_REQUEST,
            Self::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<cid::Error> for GatewayError {
    fn from(err: cid::Error) -> Self {
        Self::BadRequest(format!("invalid CID: {}", err))
    }
}

impl From<sled::Error> for GatewayError {
    fn from(err: sled::Error) -> Self {
        Self::Index(err.to_string())
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
