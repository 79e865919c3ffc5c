//! Host access codes
//!
//! An access code is a short random prefix on the `Host` header, e.g.
//! `a1b2c3d4e5--bafy.ipfs.gw.example`. The gateway strips it from the host
//! and hands it to the storage node as the `p3ac` query parameter.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random part of an access code
pub const ACCESS_CODE_BODY_LEN: usize = 10;

/// Marker separating the code from the real host
pub const ACCESS_CODE_SUFFIX: &str = "--";

/// Full prefix length (body plus suffix)
pub const ACCESS_CODE_LEN: usize = ACCESS_CODE_BODY_LEN + ACCESS_CODE_SUFFIX.len();

/// Generate a fresh access code, suffix included
pub fn gen_access_code() -> String {
    let body: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ACCESS_CODE_BODY_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{body}{ACCESS_CODE_SUFFIX}")
}

/// Split an access code off the front of a host.
///
/// Returns `(code, remaining_host)`; `None` when the host carries no code.
pub fn extract_access_code(host: &str) -> Option<(&str, &str)> {
    if host.len() <= ACCESS_CODE_LEN || !host.is_char_boundary(ACCESS_CODE_LEN) {
        return None;
    }
    let (code, rest) = host.split_at(ACCESS_CODE_LEN);
    let body = code.strip_suffix(ACCESS_CODE_SUFFIX)?;
    let valid = body
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    valid.then_some((code, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "k2jmtxwtq81s8hq26muw06qpx2b98ljg81uzzqmrzvtqsedthkv1yrnd.gw3.io";

    #[test]
    fn test_plain_host_has_no_code() {
        assert_eq!(extract_access_code(HOST), None);
        assert_eq!(extract_access_code("gw3.io"), None);
        assert_eq!(extract_access_code(""), None);
    }

    #[test]
    fn test_extract_generated_code() {
        let ac = gen_access_code();
        assert_eq!(ac.len(), ACCESS_CODE_LEN);

        let host = format!("{ac}{HOST}");
        let (code, rest) = extract_access_code(&host).unwrap();
        assert_eq!(code, ac);
        assert_eq!(rest, HOST);
    }

    #[test]
    fn test_rejects_uppercase_or_punctuation() {
        assert_eq!(extract_access_code("ABCDEFGHIJ--gw3.io"), None);
        assert_eq!(extract_access_code("abcde.ghij--gw3.io"), None);
        assert_eq!(extract_access_code("abcdefghij-xgw3.io"), None);
    }

    #[test]
    fn test_code_alone_is_not_a_host() {
        assert_eq!(extract_access_code("abcdefghij--"), None);
    }
}
