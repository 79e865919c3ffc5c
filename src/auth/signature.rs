//! Request signatures
//!
//! A client signs `(method, host, canonical path, p3args token)` with its
//! ed25519 key and puts the URL-safe base64 signature in `p3sig`. The
//! gateway verifies against the configured public key. The same key type
//! signs usage reports, where the signature covers the exact body bytes.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::args::{PARAM_ARGS, PARAM_SIG};
use super::hostname::strip_port;
use crate::types::{GatewayError, Result};

// =============================================================================
// Key handling
// =============================================================================

/// Ed25519 key length (32 bytes)
pub const KEY_LEN: usize = 32;

fn decode_key_bytes(encoded: &str, what: &str) -> Result<[u8; KEY_LEN]> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| GatewayError::Config(format!("{what} is not valid base64: {e}")))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        GatewayError::Config(format!("{what} must be {KEY_LEN} bytes, got {}", raw.len()))
    })
}

/// Decode a standard-base64 ed25519 public key
pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = decode_key_bytes(encoded, "public key")?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| GatewayError::Config(format!("invalid public key: {e}")))
}

/// Decode a standard-base64 ed25519 secret key (32-byte seed)
pub fn decode_secret_key(encoded: &str) -> Result<SigningKey> {
    Ok(SigningKey::from_bytes(&decode_key_bytes(encoded, "secret key")?))
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.to_bytes())
}

/// Sign arbitrary bytes, returning standard base64
pub fn sign_base64(payload: &[u8], key: &SigningKey) -> String {
    STANDARD.encode(key.sign(payload).to_bytes())
}

/// Verify a standard-base64 signature produced by [`sign_base64`]
pub fn verify_base64(payload: &[u8], signature: &str, key: &VerifyingKey) -> Result<()> {
    let sig = parse_signature(STANDARD.decode(signature.trim()))?;
    key.verify(payload, &sig)
        .map_err(|_| GatewayError::Auth("signature mismatch".into()))
}

fn parse_signature(raw: std::result::Result<Vec<u8>, base64::DecodeError>) -> Result<Signature> {
    let raw = raw.map_err(|e| GatewayError::Auth(format!("signature is not valid base64: {e}")))?;
    Signature::from_slice(&raw).map_err(|e| GatewayError::Auth(format!("invalid signature: {e}")))
}

// =============================================================================
// Canonical request
// =============================================================================

/// Normalize a URL path.
///
/// Always starts with `/`, has no empty or `.` segments, resolves `..`
/// without escaping the root, and carries no trailing slash (except `/`).
pub fn canonicalize_uri(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// The exact bytes a client signs
pub fn string_to_sign(method: &str, host: &str, path: &str, token: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        strip_port(host).to_ascii_lowercase(),
        canonicalize_uri(path),
        token
    )
}

/// Sign a request, returning `(p3args token, p3sig signature)`
pub fn sign_request(
    method: &str,
    host: &str,
    path: &str,
    args: &super::args::SignedArgs,
    key: &SigningKey,
) -> Result<(String, String)> {
    let token = args.encode()?;
    let message = string_to_sign(method, host, path, &token);
    let sig = URL_SAFE_NO_PAD.encode(key.sign(message.as_bytes()).to_bytes());
    Ok((token, sig))
}

/// Build the query string carrying a signed request
pub fn signed_query(
    method: &str,
    host: &str,
    path: &str,
    args: &super::args::SignedArgs,
    key: &SigningKey,
) -> Result<String> {
    let (token, sig) = sign_request(method, host, path, args, key)?;
    Ok(format!("{PARAM_ARGS}={token}&{PARAM_SIG}={sig}"))
}

/// Verify the signature carried by a request.
///
/// Returns the verified `p3args` token. A missing `p3sig` is reported as
/// [`GatewayError::SignatureMissing`] so the caller may redirect.
pub fn verify_request(
    method: &str,
    host: &str,
    path: &str,
    query: Option<&str>,
    key: &VerifyingKey,
) -> Result<String> {
    let mut token = None;
    let mut sig = None;
    for (k, v) in url_query_pairs(query) {
        match k.as_str() {
            PARAM_ARGS if token.is_none() => token = Some(v),
            PARAM_SIG if sig.is_none() => sig = Some(v),
            _ => {}
        }
    }

    let sig = sig.filter(|s| !s.is_empty()).ok_or(GatewayError::SignatureMissing)?;
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GatewayError::Auth(format!("missing {PARAM_ARGS}")))?;

    let signature = parse_signature(URL_SAFE_NO_PAD.decode(sig.trim_end_matches('=')))?;
    let message = string_to_sign(method, host, path, &token);
    key.verify(message.as_bytes(), &signature)
        .map_err(|_| GatewayError::Auth("signature mismatch".into()))?;

    Ok(token)
}

/// Decode query pairs, ignoring a malformed query
pub fn url_query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .unwrap_or_default()
}
