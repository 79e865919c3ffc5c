//! Request authentication for Tollgate
//!
//! Provides:
//! - Signed argument tokens (`p3args`) and their codec
//! - Ed25519 request and report signatures
//! - Host access codes and subdomain gateway resolution
//! - The auth middleware that verifies requests and restores their args

pub mod access_code;
pub mod args;
pub mod hostname;
pub mod middleware;
pub mod signature;

pub use access_code::{extract_access_code, gen_access_code};
pub use args::{
    split_values, validate_timestamp, SignedArgs, DEFAULT_MAX_SKEW, PARAM_ACCESS_CODE,
    PARAM_ARGS, PARAM_SIG,
};
pub use hostname::{strip_port, SubdomainDetails, SubdomainGateways};
pub use middleware::AuthMiddleware;
pub use signature::{canonicalize_uri, sign_base64, sign_request, signed_query, verify_request};
