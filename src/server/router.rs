//! Inner request router
//!
//! Serves the extended pin API and the status endpoint locally and hands
//! everything else to the storage node proxy.

use hyper::{Method, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::auth::canonicalize_uri;
use crate::auth::signature::encode_public_key;
use crate::config::GatewayConfig;
use crate::pin::PinHandlers;
use crate::server::handler::{
    error_response, json_response, GatewayRequest, GatewayResponse, Handler,
};
use crate::types::GatewayError;

/// Version string reported by `/api/v0/status`
pub fn version() -> String {
    format!(
        "{}-{}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_SHORT")
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    /// Key usage reports are signed with (empty when metering is off)
    pub public_key: String,
    pub version: String,
}

pub struct Router {
    pins: PinHandlers,
    proxy: Arc<dyn Handler>,
    status: StatusResponse,
}

impl Router {
    pub fn new(config: &GatewayConfig, pins: PinHandlers, proxy: Arc<dyn Handler>) -> Self {
        let public_key = config
            .secret_key
            .as_ref()
            .map(|key| encode_public_key(&key.verifying_key()))
            .unwrap_or_default();

        Self {
            pins,
            proxy,
            status: StatusResponse {
                status: "ok",
                public_key,
                version: version(),
            },
        }
    }
}

#[async_trait::async_trait]
impl Handler for Router {
    async fn handle(&self, req: GatewayRequest) -> GatewayResponse {
        let path = canonicalize_uri(req.uri().path());
        debug!(method = %req.method(), path = %path, "Routing request");

        match path.as_str() {
            "/api/v0/pin/add" => self.pins.add(req).await,
            "/api/v0/pin/rm" => self.pins.rm(req).await,
            "/api/v0/pin/children_update" => self.pins.children_update(req).await,
            "/api/v0/pin/count" => self.pins.count(req).await,
            "/api/v0/pin/ls" => self.pins.ls(req).await,
            "/api/v0/status" => match *req.method() {
                Method::GET | Method::POST => json_response(StatusCode::OK, &self.status),
                _ => error_response(&GatewayError::BadRequest(format!(
                    "method not allowed: {}",
                    req.method()
                ))),
            },
            _ => self.proxy.handle(req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::MemoryDagStore;
    use crate::pin::MemoryPinIndex;
    use crate::server::handler::{empty_body, handler_fn};
    use ed25519_dalek::SigningKey;
    use http_body_util::BodyExt;
    use hyper::{Request, Response};

    fn router(config: &GatewayConfig) -> Router {
        let upstream = handler_fn(|req: GatewayRequest| async move {
            let mut resp = Response::new(empty_body());
            *resp.status_mut() = StatusCode::ACCEPTED;
            resp.headers_mut()
                .insert("x-proxied", req.uri().path().parse().unwrap());
            resp
        });
        let pins = PinHandlers::new(
            Arc::new(MemoryPinIndex::new()),
            Arc::new(MemoryDagStore::new()),
            Arc::clone(&upstream),
        );
        Router::new(config, pins, upstream)
    }

    #[tokio::test]
    async fn test_status_reports_report_key() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let config = GatewayConfig::default().with_secret_key(key.clone());
        let req = Request::builder()
            .uri("/api/v0/status")
            .body(empty_body())
            .unwrap();

        let resp = router(&config).handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["public_key"], encode_public_key(&key.verifying_key()));
        assert!(json["version"]
            .as_str()
            .unwrap()
            .starts_with(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn test_unknown_paths_are_proxied() {
        let req = Request::builder()
            .uri("/api/v0/cat?arg=x")
            .body(empty_body())
            .unwrap();

        let resp = router(&GatewayConfig::default()).handle(req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.headers()["x-proxied"], "/api/v0/cat");
    }

    #[tokio::test]
    async fn test_pin_routes_are_local() {
        let req = Request::builder()
            .uri("/api/v0/pin/count?arg=nope&recursive=true")
            .body(empty_body())
            .unwrap();

        let resp = router(&GatewayConfig::default()).handle(req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.headers().get("x-proxied").is_none());
    }
}
