//! Tollgate - policy gateway for content-addressed storage nodes
//!
//! Tollgate sits in front of a storage node's RPC API and lets through only
//! requests an authority has signed. Every request passes the same chain:
//!
//! - **Auth**: verifies `p3args`/`p3sig`, restores the signed query, and
//!   enforces the namespace whitelist
//! - **Usage monitor**: meters ingress and egress bytes and reports them to
//!   the billing collector, enforcing the signed size cap
//! - **Content sentry**: scans HTML responses and blocks phishing pages
//! - **Router**: serves the extended pin API and proxies the rest

pub mod auth;
pub mod config;
pub mod context;
pub mod dag;
pub mod monitor;
pub mod pin;
pub mod sentry;
pub mod server;
pub mod types;

pub use config::{Args, GatewayConfig};
pub use server::{build_chain, run, Backends};
pub use types::{GatewayError, Result};
