//! Configuration for Tollgate
//!
//! CLI arguments and environment variable handling using clap. `Args` is
//! parsed once in `main`, validated, then turned into an immutable
//! [`GatewayConfig`] that every component receives by `Arc`.

use clap::Parser;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::signature::{decode_public_key, decode_secret_key};
use crate::auth::{SubdomainGateways, DEFAULT_MAX_SKEW};
use crate::types::{GatewayError, Result};

/// Namespaces served when `WHITELIST` is not set
pub const DEFAULT_WHITELIST: &str = "/ipfs,/ipns,/api/v0/add,/api/v0/cat,/api/v0/get,\
/api/v0/block/get,/api/v0/block/stat,/api/v0/dag/get,/api/v0/pin/add,/api/v0/pin/rm,\
/api/v0/pin/children_update,/api/v0/pin/count,/api/v0/pin/ls,/api/v0/status";

/// Tollgate - policy gateway for content-addressed storage nodes
#[derive(Parser, Debug, Clone)]
#[command(name = "tollgate")]
#[command(about = "Signed-request, content-sentry and metering gateway for a storage node")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Storage node RPC base URL (Kubo-compatible)
    #[arg(long, env = "UPSTREAM_URL", default_value = "http://127.0.0.1:5001")]
    pub upstream_url: String,

    /// Public hostname of this gateway, substituted on redirect
    #[arg(long, env = "PUBLIC_HOSTNAME", default_value = "localhost")]
    pub public_hostname: String,

    /// Base64 ed25519 key that request signatures are verified against
    #[arg(long, env = "VERIFY_PUBLIC_KEY")]
    pub verify_public_key: Option<String>,

    /// Base64 ed25519 seed this gateway signs usage reports with
    #[arg(long, env = "SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Disable request signature verification
    #[arg(long, env = "NO_AUTH", default_value = "false")]
    pub no_auth: bool,

    /// Redirect requests without a signature to the authority
    #[arg(long, env = "REDIRECT_ON_FAILURE", default_value = "false")]
    pub redirect_on_failure: bool,

    /// Authority URL unsigned requests are redirected to
    /// (e.g., "https://gw.example")
    #[arg(long, env = "AUTHORITY_URL")]
    pub authority_url: Option<String>,

    /// Comma-separated namespace whitelist
    #[arg(long, env = "WHITELIST", default_value = DEFAULT_WHITELIST)]
    pub whitelist: String,

    /// Comma-separated subdomain gateway hostnames; `*` matches one label
    #[arg(long, env = "SUBDOMAIN_GATEWAYS", default_value = "localhost")]
    pub subdomain_gateways: String,

    /// Usage collector base URL; metering is off when unset
    #[arg(long, env = "COLLECTOR_URL")]
    pub collector_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (pretty, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Prometheus exporter address; exporter is off when unset
    #[arg(long, env = "METRICS_LISTEN")]
    pub metrics_listen: Option<SocketAddr>,

    /// Default request deadline in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "600")]
    pub request_timeout_secs: u64,

    /// Deadline for /api/v0/pin/add in seconds
    #[arg(long, env = "PIN_ADD_TIMEOUT_SECS", default_value = "3600")]
    pub pin_add_timeout_secs: u64,

    /// Directory of the durable pin reference-count index
    #[arg(long, env = "PIN_INDEX_PATH", default_value = "data/pins.sled")]
    pub pin_index_path: PathBuf,

    /// Enable development mode (no auth, in-memory pin index)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,
}

impl Args {
    /// Whether signatures are checked
    pub fn auth_enabled(&self) -> bool {
        !self.no_auth && !self.dev_mode
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.auth_enabled() && self.verify_public_key.is_none() {
            return Err("VERIFY_PUBLIC_KEY is required unless NO_AUTH or DEV_MODE is set".to_string());
        }

        if self.collector_url.is_some() && self.secret_key.is_none() {
            return Err("SECRET_KEY is required when COLLECTOR_URL is set".to_string());
        }

        if self.redirect_on_failure && self.authority_url.is_none() {
            return Err("AUTHORITY_URL is required when REDIRECT_ON_FAILURE is set".to_string());
        }

        if !self.upstream_url.starts_with("http://") && !self.upstream_url.starts_with("https://") {
            return Err("UPSTREAM_URL must be an http(s) URL".to_string());
        }

        if self.request_timeout_secs == 0 || self.pin_add_timeout_secs == 0 {
            return Err("Request timeouts must be positive".to_string());
        }

        match self.log_format.as_str() {
            "pretty" | "json" => {}
            other => return Err(format!("Unknown LOG_FORMAT: {other}")),
        }

        Ok(())
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Effective gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub upstream_url: String,
    pub public_hostname: String,
    /// `None` disables signature verification
    pub verify_key: Option<VerifyingKey>,
    /// Signs usage reports
    pub secret_key: Option<SigningKey>,
    pub redirect_on_failure: bool,
    pub authority_url: Option<String>,
    pub whitelist: HashSet<String>,
    pub gateways: SubdomainGateways,
    /// `None` disables metering
    pub collector_url: Option<String>,
    pub max_skew: Duration,
    pub default_timeout: Duration,
    pub uri_timeouts: HashMap<String, Duration>,
    /// Ignored in development mode, where pins live in memory
    pub pin_index_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            upstream_url: "http://127.0.0.1:5001".to_string(),
            public_hostname: "localhost".to_string(),
            verify_key: None,
            secret_key: None,
            redirect_on_failure: false,
            authority_url: None,
            whitelist: split_list(DEFAULT_WHITELIST).map(str::to_string).collect(),
            gateways: SubdomainGateways::new(["localhost"]),
            collector_url: None,
            max_skew: DEFAULT_MAX_SKEW,
            default_timeout: Duration::from_secs(600),
            uri_timeouts: HashMap::from([(
                "/api/v0/pin/add".to_string(),
                Duration::from_secs(3600),
            )]),
            pin_index_path: PathBuf::from("data/pins.sled"),
            dev_mode: false,
        }
    }
}

impl GatewayConfig {
    /// Decode keys and derive the immutable configuration
    pub fn from_args(args: &Args) -> Result<Self> {
        let verify_key = match (&args.verify_public_key, args.auth_enabled()) {
            (Some(pk), true) => Some(decode_public_key(pk)?),
            (None, true) => {
                return Err(GatewayError::Config("VERIFY_PUBLIC_KEY is not set".into()));
            }
            (_, false) => None,
        };
        let secret_key = args.secret_key.as_deref().map(decode_secret_key).transpose()?;

        Ok(Self {
            listen: args.listen,
            upstream_url: args.upstream_url.trim_end_matches('/').to_string(),
            public_hostname: args.public_hostname.clone(),
            verify_key,
            secret_key,
            redirect_on_failure: args.redirect_on_failure,
            authority_url: args.authority_url.clone(),
            whitelist: split_list(&args.whitelist).map(str::to_string).collect(),
            gateways: SubdomainGateways::new(split_list(&args.subdomain_gateways)),
            collector_url: args
                .collector_url
                .as_deref()
                .map(|u| u.trim_end_matches('/').to_string()),
            max_skew: DEFAULT_MAX_SKEW,
            default_timeout: Duration::from_secs(args.request_timeout_secs),
            uri_timeouts: HashMap::from([(
                "/api/v0/pin/add".to_string(),
                Duration::from_secs(args.pin_add_timeout_secs),
            )]),
            pin_index_path: args.pin_index_path.clone(),
            dev_mode: args.dev_mode,
        })
    }

    /// Request deadline for a canonical URI
    pub fn timeout_for(&self, uri: &str) -> Duration {
        self.uri_timeouts
            .get(uri)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    pub fn metering_enabled(&self) -> bool {
        self.collector_url.is_some()
    }

    pub fn with_verify_key(mut self, key: VerifyingKey) -> Self {
        self.verify_key = Some(key);
        self
    }

    pub fn with_secret_key(mut self, key: SigningKey) -> Self {
        self.secret_key = Some(key);
        self
    }

    pub fn with_collector(mut self, url: impl Into<String>) -> Self {
        self.collector_url = Some(url.into());
        self
    }

    pub fn with_redirect(mut self, authority_url: impl Into<String>) -> Self {
        self.redirect_on_failure = true;
        self.authority_url = Some(authority_url.into());
        self
    }

    pub fn with_public_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.public_hostname = hostname.into();
        self
    }

    pub fn with_whitelist<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_gateways(mut self, gateways: SubdomainGateways) -> Self {
        self.gateways = gateways;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["tollgate"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_auth_requires_key() {
        let args = parse(&[]);
        if std::env::var("VERIFY_PUBLIC_KEY").is_err() && std::env::var("NO_AUTH").is_err() {
            assert!(args.validate().is_err());
        }
        assert!(parse(&["--no-auth"]).validate().is_ok());
        assert!(parse(&["--dev-mode"]).validate().is_ok());
    }

    #[test]
    fn test_collector_requires_secret() {
        let args = parse(&["--no-auth", "--collector-url", "http://collector"]);
        if std::env::var("SECRET_KEY").is_err() {
            assert!(args.validate().is_err());
        }
    }

    #[test]
    fn test_from_args_lists_and_timeouts() {
        let args = parse(&[
            "--dev-mode",
            "--whitelist",
            "/ipfs, /api/v0/cat,,",
            "--subdomain-gateways",
            "dweb.link,*.gw.example",
            "--pin-add-timeout-secs",
            "7200",
        ]);
        let cfg = GatewayConfig::from_args(&args).unwrap();

        assert!(cfg.verify_key.is_none());
        assert_eq!(cfg.whitelist.len(), 2);
        assert!(cfg.whitelist.contains("/api/v0/cat"));
        assert!(cfg.gateways.is_known_hostname("a.gw.example"));
        assert_eq!(cfg.timeout_for("/api/v0/pin/add"), Duration::from_secs(7200));
        assert_eq!(cfg.timeout_for("/api/v0/cat"), Duration::from_secs(600));

        let cfg = GatewayConfig::from_args(&parse(&["--no-auth", "--pin-index-path", "/var/lib/pins"]))
            .unwrap();
        assert_eq!(cfg.pin_index_path, PathBuf::from("/var/lib/pins"));
    }
}
