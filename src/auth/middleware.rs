//! Auth middleware
//!
//! Outermost pipeline stage. Verifies the request signature, enforces the
//! namespace whitelist, then rewrites the request so the inner stages only
//! see what the signed token carries.

use http_body_util::BodyExt;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::{HeaderMap, Method, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::access_code::extract_access_code;
use super::args::{
    split_values, validate_timestamp, SignedArgs, PARAM_ACCESS_CODE, PARAM_ARGS, PARAM_SIG,
};
use super::hostname::strip_port;
use super::signature::{canonicalize_uri, url_query_pairs, verify_request};
use crate::config::GatewayConfig;
use crate::context::{context_mut, RequestScope};
use crate::server::body::ScopedBody;
use crate::server::handler::{
    error_response, redirect_response, GatewayRequest, GatewayResponse, Handler,
};
use crate::types::{GatewayError, Result};

/// Headers kept from the raw request; everything else must come signed
const HEADER_WHITELIST: [HeaderName; 2] = [CONTENT_TYPE, HOST];

pub struct AuthMiddleware {
    config: Arc<GatewayConfig>,
    next: Arc<dyn Handler>,
}

impl AuthMiddleware {
    pub fn new(config: Arc<GatewayConfig>, next: Arc<dyn Handler>) -> Self {
        Self { config, next }
    }

    /// Map a canonical path to its whitelist namespace
    fn classify(&self, canonical: &str, host: &str) -> String {
        if canonical.starts_with("/ipfs/") {
            return "/ipfs".to_string();
        }
        if canonical.starts_with("/ipns/") {
            return "/ipns".to_string();
        }
        if !canonical.starts_with("/api/v0/") {
            if let Some(details) = self.config.gateways.known_subdomain_details(host) {
                match details.namespace.as_str() {
                    "ipfs" => return "/ipfs".to_string(),
                    "ipns" => return "/ipns".to_string(),
                    _ => {}
                }
            }
        }
        canonical.to_string()
    }

    /// Loopback requests keep their raw query when no key is configured
    fn is_local_passthrough(&self, host: &str) -> bool {
        self.config.verify_key.is_none()
            && (host.starts_with("localhost") || host.starts_with("127.0.0.1"))
    }

    /// Location on the authority for an unsigned request
    fn authority_location(&self, host: &str, uri: &Uri) -> Option<String> {
        let authority = self.config.authority_url.as_deref()?;
        let (scheme, target) = if let Some(rest) = authority.strip_prefix("http://") {
            ("http", rest)
        } else if let Some(rest) = authority.strip_prefix("https://") {
            ("https", rest)
        } else {
            ("https", authority)
        };
        let target = target.trim_end_matches('/');

        let new_host = strip_port(host).replacen(&self.config.public_hostname, target, 1);
        let path_and_query = uri.path_and_query().map(PathAndQuery::as_str).unwrap_or("/");
        Some(format!("{scheme}://{new_host}{path_and_query}"))
    }

    async fn authenticate(&self, mut req: GatewayRequest) -> GatewayResponse {
        let mut host = request_host(&req);

        let access_code = match extract_access_code(&host) {
            Some((code, rest)) => {
                let code = code.to_string();
                host = rest.to_string();
                Some(code)
            }
            None => None,
        };

        let canonical = canonicalize_uri(req.uri().path());
        let namespace = self.classify(&canonical, &host);
        if !self.config.whitelist.contains(&namespace) {
            debug!(namespace = %namespace, "Namespace not whitelisted");
            return error_response(&GatewayError::Whitelist(namespace));
        }

        if req.method() != Method::OPTIONS {
            if let Some(key) = self.config.verify_key.as_ref() {
                let verified = verify_request(
                    req.method().as_str(),
                    &host,
                    req.uri().path(),
                    req.uri().query(),
                    key,
                );
                match verified {
                    Ok(_) => {}
                    Err(GatewayError::SignatureMissing) if self.config.redirect_on_failure => {
                        if let Some(location) = self.authority_location(&host, req.uri()) {
                            debug!(location = %location, "Redirecting unsigned request");
                            return redirect_response(&location);
                        }
                        return error_response(&GatewayError::SignatureMissing);
                    }
                    Err(e) => {
                        debug!(error = %e, "Authentication failure");
                        return error_response(&e);
                    }
                }
            }
        }

        if let Err(e) = self.restore(&mut req, &host, access_code) {
            debug!(error = %e, "Failed to restore signed args");
            return error_response(&e);
        }

        self.next.handle(req).await
    }

    /// Rewrite query and headers from the signed token
    fn restore(
        &self,
        req: &mut GatewayRequest,
        host: &str,
        access_code: Option<String>,
    ) -> Result<()> {
        let original = url_query_pairs(req.uri().query());
        let token = original
            .iter()
            .find(|(k, _)| k == PARAM_ARGS)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty());

        let mut query: Vec<(String, String)> = if self.is_local_passthrough(host) {
            original
        } else {
            original
                .into_iter()
                .filter(|(k, _)| k == PARAM_ARGS || k == PARAM_SIG)
                .collect()
        };
        if let Some(code) = access_code {
            query.push((PARAM_ACCESS_CODE.to_string(), code));
        }

        let mut headers = HeaderMap::new();
        for name in HEADER_WHITELIST {
            for value in req.headers().get_all(&name) {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.insert(
            HOST,
            HeaderValue::from_str(host)
                .map_err(|_| GatewayError::BadRequest(format!("invalid host: {host}")))?,
        );

        let mut decoded = None;
        if let Some(token) = token {
            let args = SignedArgs::decode(&token)?;
            validate_timestamp(&args, self.config.max_skew)?;

            for (k, v) in &args.params {
                for part in split_values(v) {
                    query.push((k.clone(), part.to_string()));
                }
            }

            for (k, v) in &args.headers {
                let name = HeaderName::from_bytes(k.as_bytes())
                    .map_err(|_| GatewayError::Decode(format!("invalid header name: {k}")))?;
                if headers.contains_key(&name) {
                    continue;
                }
                for part in split_values(v) {
                    let value = HeaderValue::from_str(part).map_err(|_| {
                        GatewayError::Decode(format!("invalid value for header {k}"))
                    })?;
                    headers.append(name.clone(), value);
                }
            }

            decoded = Some(Arc::new(args));
        }

        *req.uri_mut() = rebuild_uri(req.uri(), &query)?;
        *req.headers_mut() = headers;

        let ctx = context_mut(req);
        ctx.no_auth = true;
        ctx.args = decoded;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler for AuthMiddleware {
    async fn handle(&self, mut req: GatewayRequest) -> GatewayResponse {
        let ctx = context_mut(&mut req).clone();
        if ctx.no_auth {
            return self.next.handle(req).await;
        }

        metrics::counter!("request_call_total").increment(1);

        let scope = ctx.scope.clone();
        let deadline = self.config.timeout_for(&canonicalize_uri(req.uri().path()));
        spawn_deadline(scope.clone(), deadline);

        let (resp, streaming) = tokio::select! {
            resp = self.authenticate(req) => (resp, true),
            _ = scope.cancelled() => {
                let reason = scope.reason();
                warn!(error = %reason, "Request scope ended before a response");
                (error_response(&reason), false)
            }
        };

        let blocked = Arc::clone(&ctx.blocked_rule);
        resp.map(move |body| {
            let body = ScopedBody::new(body, scope).on_drop(move || match blocked.get() {
                Some(rule) => {
                    metrics::counter!("request_blocked_total", "rule" => *rule).increment(1)
                }
                None => metrics::counter!("request_served_total").increment(1),
            });
            let body = if streaming { body } else { body.ignore_cancel() };
            body.boxed_unsync()
        })
    }
}

/// Cancel `scope` with `Timeout` unless it ends first
fn spawn_deadline(scope: RequestScope, deadline: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = scope.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                debug!(deadline_secs = deadline.as_secs(), "Request deadline reached");
                scope.cancel_with(GatewayError::Timeout);
            }
        }
    });
}

/// Host from the `Host` header, falling back to the URI authority
pub(crate) fn request_host<B>(req: &hyper::Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
}

fn rebuild_uri(uri: &Uri, query: &[(String, String)]) -> Result<Uri> {
    let path = uri.path();
    let path_and_query = if query.is_empty() {
        path.to_string()
    } else {
        let encoded = serde_urlencoded::to_string(query)
            .map_err(|e| GatewayError::Internal(format!("Failed to encode query: {e}")))?;
        format!("{path}?{encoded}")
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| GatewayError::BadRequest(format!("invalid path: {e}")))?,
    );
    Uri::from_parts(parts).map_err(|e| GatewayError::BadRequest(format!("invalid uri: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::signature::signed_query;
    use crate::context::RequestContext;
    use crate::server::handler::{empty_body, handler_fn, json_response};
    use ed25519_dalek::SigningKey;
    use hyper::{Request, StatusCode};
    use rand::rngs::OsRng;

    /// Echoes what the inner stage sees
    fn echo() -> Arc<dyn Handler> {
        handler_fn(|req: GatewayRequest| async move {
            let ctx = RequestContext::of(&req);
            let headers: Vec<(String, String)> = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect();
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "query": req.uri().query().unwrap_or_default(),
                    "headers": headers,
                    "no_auth": ctx.no_auth,
                    "node": ctx.args.as_ref().and_then(|a| a.node().map(str::to_string)),
                }),
            )
        })
    }

    async fn body_json(resp: GatewayResponse) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn signed_config() -> (SigningKey, Arc<GatewayConfig>) {
        let sk = SigningKey::generate(&mut OsRng);
        let cfg = GatewayConfig::default()
            .with_verify_key(sk.verifying_key())
            .with_public_hostname("xxx.gtw3.io");
        (sk, Arc::new(cfg))
    }

    fn get(uri: &str, host: &str) -> GatewayRequest {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, host)
            .header("X-Smuggled", "1")
            .header(CONTENT_TYPE, "text/plain")
            .body(empty_body())
            .unwrap()
    }

    #[tokio::test]
    async fn test_signed_request_is_restored() {
        let (sk, cfg) = signed_config();
        let mw = AuthMiddleware::new(cfg, echo());

        let args = SignedArgs::new("client-1")
            .with_param("arg", "bafy1;;;bafy2")
            .with_header("Accept", "text/html")
            .with_header("Content-Type", "application/json");
        let query = signed_query("GET", "gw.example", "/api/v0/cat", &args, &sk).unwrap();

        let req = get(&format!("/api/v0/cat?{query}&extra=1"), "gw.example");
        let resp = mw.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        let q = json["query"].as_str().unwrap();
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(q).unwrap();
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["p3args", "p3sig", "arg", "arg"]);
        assert!(pairs.contains(&("arg".into(), "bafy2".into())));

        let headers = json["headers"].as_array().unwrap();
        let names: Vec<&str> = headers.iter().map(|h| h[0].as_str().unwrap()).collect();
        assert!(names.contains(&"accept"));
        assert!(!names.contains(&"x-smuggled"));
        // whitelisted raw header wins over the signed one
        assert!(headers
            .iter()
            .any(|h| h[0] == "content-type" && h[1] == "text/plain"));
        assert_eq!(json["no_auth"], true);
        assert_eq!(json["node"], "client-1");
    }

    #[tokio::test]
    async fn test_whitelist_miss_is_not_found() {
        let (_, cfg) = signed_config();
        let mw = AuthMiddleware::new(cfg, echo());
        let resp = mw.handle(get("/api/v0/shutdown", "gw.example")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_subdomain_request_classified_as_ipfs() {
        let cfg = Arc::new(GatewayConfig::default().with_whitelist(["/ipfs"]));
        let mw = AuthMiddleware::new(cfg, echo());

        let resp = mw.handle(get("/index.html", "bafy.ipfs.localhost:8080")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = mw.handle(get("/index.html", "localhost:8080")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_or_missing_signature() {
        let (sk, cfg) = signed_config();
        let mw = AuthMiddleware::new(cfg, echo());

        let resp = mw.handle(get("/ipfs/bafy", "gw.example")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let args = SignedArgs::new("n");
        let query = signed_query("GET", "gw.example", "/ipfs/other", &args, &sk).unwrap();
        let resp = mw.handle(get(&format!("/ipfs/bafy?{query}"), "gw.example")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_options_skips_signature() {
        let (_, cfg) = signed_config();
        let mw = AuthMiddleware::new(cfg, echo());
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/ipfs/bafy")
            .header(HOST, "gw.example")
            .body(empty_body())
            .unwrap();
        assert_eq!(mw.handle(req).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stale_timestamp_is_bad_request() {
        let (sk, cfg) = signed_config();
        let mw = AuthMiddleware::new(cfg, echo());

        let stale = (chrono::Utc::now().timestamp() - 3600).to_string();
        let args = SignedArgs::new("n").with_arg(super::super::args::ARG_UNIXTIME, stale);
        let query = signed_query("GET", "gw.example", "/ipfs/bafy", &args, &sk).unwrap();
        let resp = mw.handle(get(&format!("/ipfs/bafy?{query}"), "gw.example")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_redirect_unsigned_to_authority() {
        let cases = [
            ("xxx.gtw3.io", "http://gw3.io", "http://gw3.io"),
            ("xxx.gtw3.io", "https://gw3.io", "https://gw3.io"),
            ("xxx.gtw3.io:8080", "https://gw3.io", "https://gw3.io"),
            ("mock_cid.ipfs.xxx.gtw3.io:8080", "https://gw3.io", "https://mock_cid.ipfs.gw3.io"),
            ("mock_cid.ipns.xxx.gtw3.io:8080", "https://gw3.io", "https://mock_cid.ipns.gw3.io"),
        ];
        let path = "/ipfs/mock_cid/file.txt?arg=value";

        for (host, authority, expected) in cases {
            let sk = SigningKey::generate(&mut OsRng);
            let cfg = GatewayConfig::default()
                .with_verify_key(sk.verifying_key())
                .with_public_hostname("xxx.gtw3.io")
                .with_redirect(authority);
            let mw = AuthMiddleware::new(Arc::new(cfg), echo());

            let resp = mw.handle(get(path, host)).await;
            assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT, "host: {host}");
            let location = resp.headers()[hyper::header::LOCATION].to_str().unwrap();
            assert_eq!(location, format!("{expected}{path}"), "host: {host}");
        }
    }

    #[tokio::test]
    async fn test_access_code_moves_to_query() {
        let cfg = Arc::new(GatewayConfig::default());
        let mw = AuthMiddleware::new(cfg, echo());

        let code = crate::auth::gen_access_code();
        let host = format!("{code}localhost:8080");
        let resp = mw.handle(get("/ipfs/bafy?x=1", &host)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        let q = json["query"].as_str().unwrap();
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(q).unwrap();
        // no key + loopback host keeps the raw query
        assert!(pairs.contains(&("x".into(), "1".into())));
        assert!(pairs.contains(&(PARAM_ACCESS_CODE.into(), code)));
        let headers = json["headers"].as_array().unwrap();
        assert!(headers.iter().any(|h| h[0] == "host" && h[1] == "localhost:8080"));
    }

    #[tokio::test]
    async fn test_already_authenticated_passes_through() {
        let (_, cfg) = signed_config();
        let mw = AuthMiddleware::new(cfg, echo());
        let mut req = get("/not/whitelisted?raw=1", "gw.example");
        context_mut(&mut req).no_auth = true;

        let resp = mw.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["query"], "raw=1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_request_timeout() {
        let cfg = Arc::new(GatewayConfig::default().with_timeout(Duration::from_secs(5)));
        let slow = handler_fn(|_req: GatewayRequest| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            json_response(StatusCode::OK, &serde_json::json!({}))
        });
        let mw = AuthMiddleware::new(cfg, slow);

        let resp = mw.handle(get("/ipfs/bafy", "localhost")).await;
        assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
        let body = resp.into_body().collect().await;
        assert!(body.is_ok());
    }
}
