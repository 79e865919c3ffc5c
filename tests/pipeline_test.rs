//! End-to-end tests of the middleware chain with in-memory collaborators

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use http_body_util::BodyExt;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode};
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;

use tollgate::auth::{signed_query, SignedArgs};
use tollgate::config::GatewayConfig;
use tollgate::context::RequestContext;
use tollgate::dag::MemoryDagStore;
use tollgate::monitor::{MemoryReporter, UsageRecord};
use tollgate::pin::{MemoryPinIndex, PinIndex};
use tollgate::server::handler::{
    empty_body, error_response, full_body, handler_fn, GatewayBody, GatewayRequest,
    GatewayResponse, Handler,
};
use tollgate::{build_chain, Backends};

const HOST_NAME: &str = "gw.example";

struct Gateway {
    key: SigningKey,
    chain: Arc<dyn Handler>,
    content: Arc<MemoryDagStore>,
    pins: Arc<MemoryPinIndex>,
    reporter: Arc<MemoryReporter>,
}

/// Stand-in for the storage node RPC API
fn storage_node() -> Arc<dyn Handler> {
    handler_fn(|req: GatewayRequest| async move {
        let query = req.uri().query().unwrap_or_default().to_string();
        match req.uri().path() {
            "/api/v0/cat" => {
                let mut resp = Response::new(full_body(query));
                resp.headers_mut()
                    .insert(CONTENT_TYPE, "application/octet-stream".parse().unwrap());
                resp
            }
            "/ipfs/phish" => {
                let mut resp = Response::new(full_body(
                    "<html><form><input type=\"password\"></form></html>",
                ));
                resp.headers_mut()
                    .insert(CONTENT_TYPE, "text/html".parse().unwrap());
                resp
            }
            "/api/v0/add" => match req.into_body().collect().await {
                Ok(body) => Response::new(full_body(format!("{}", body.to_bytes().len()))),
                Err(e) => error_response(&e),
            },
            "/api/v0/pin/add" | "/api/v0/pin/rm" => {
                let arg = query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("arg="))
                    .unwrap_or_default()
                    .to_string();
                Response::new(full_body(format!("{{\"Pins\":[\"{arg}\"]}}\n")))
            }
            _ => {
                let mut resp = Response::new(empty_body());
                *resp.status_mut() = StatusCode::NOT_FOUND;
                resp
            }
        }
    })
}

fn gateway() -> Gateway {
    let key = SigningKey::generate(&mut OsRng);
    let config = Arc::new(
        GatewayConfig::default()
            .with_verify_key(key.verifying_key())
            .with_secret_key(SigningKey::generate(&mut OsRng))
            .with_collector("http://collector.example"),
    );

    let content = Arc::new(MemoryDagStore::new());
    let pins = Arc::new(MemoryPinIndex::new());
    let reporter = Arc::new(MemoryReporter::new());
    let chain = build_chain(
        config,
        Backends {
            content: content.clone(),
            pins: pins.clone(),
            upstream: storage_node(),
            reporter: Some(reporter.clone()),
        },
    );

    Gateway {
        key,
        chain,
        content,
        pins,
        reporter,
    }
}

impl Gateway {
    fn signed(&self, method: &str, path: &str, args: SignedArgs, body: GatewayBody) -> GatewayRequest {
        let query = signed_query(method, HOST_NAME, path, &args, &self.key).unwrap();
        let mut req = Request::builder()
            .method(method)
            .uri(format!("{path}?{query}&injected=1"))
            .header(HOST, HOST_NAME)
            .header("x-unlisted", "dropped")
            .body(body)
            .unwrap();
        req.extensions_mut().insert(RequestContext::default());
        req
    }

    async fn send(&self, req: GatewayRequest) -> (StatusCode, Bytes) {
        let resp: GatewayResponse = self.chain.handle(req).await;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();
        (status, body)
    }

    async fn wait_for_records(&self, n: usize) -> Vec<UsageRecord> {
        for _ in 0..500 {
            let records = self.reporter.records();
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.reporter.records()
    }
}

#[tokio::test]
async fn test_signed_request_reaches_storage_node_and_is_billed() {
    let gw = gateway();
    let args = SignedArgs::new("client-1").with_param("arg", "QmTarget");
    let req = gw.signed("POST", "/api/v0/cat", args, empty_body());

    let (status, body) = gw.send(req).await;
    assert_eq!(status, StatusCode::OK);

    let seen = String::from_utf8(body.to_vec()).unwrap();
    assert!(seen.contains("arg=QmTarget"));
    assert!(!seen.contains("injected"));

    let records = gw.wait_for_records(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].req.uri, "/api/v0/cat");
    assert_eq!(records[0].req.host, HOST_NAME);
    assert_eq!(records[0].egress, seen.len() as u64);
    assert_eq!(records[0].cid_size, 0);
}

#[tokio::test]
async fn test_unsigned_request_is_rejected() {
    let gw = gateway();
    let mut req = Request::builder()
        .uri("/api/v0/cat?arg=QmTarget")
        .header(HOST, HOST_NAME)
        .body(empty_body())
        .unwrap();
    req.extensions_mut().insert(RequestContext::default());

    let (status, _) = gw.send(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(gw.reporter.records().is_empty());
}

#[tokio::test]
async fn test_namespace_outside_whitelist_is_not_found() {
    let gw = gateway();
    let req = gw.signed(
        "POST",
        "/api/v0/config",
        SignedArgs::new("client-1"),
        empty_body(),
    );

    let (status, _) = gw.send(req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_phishing_page_is_gone() {
    let gw = gateway();
    let req = gw.signed("GET", "/ipfs/phish", SignedArgs::new("client-1"), empty_body());

    let (status, body) = gw.send(req).await;
    assert_eq!(status, StatusCode::GONE);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_request_body_over_cap_is_rejected() {
    let gw = gateway();
    let args = SignedArgs::new("client-1").with_arg("size", "100");
    let req = gw.signed("POST", "/api/v0/add", args, full_body(vec![0u8; 500]));

    let (status, _) = gw.send(req).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_pin_add_then_rm_bills_content_size() {
    let gw = gateway();
    let leaf = gw.content.put_leaf(b"leaf");
    let root = gw.content.put_node(&[leaf], b"root");
    let size = gw.content.block_size(&leaf).unwrap() + gw.content.block_size(&root).unwrap();

    let params = || {
        SignedArgs::new("client-1")
            .with_param("arg", root.to_string())
            .with_param("recursive", "true")
    };

    let req = gw.signed("POST", "/api/v0/pin/add", params(), empty_body());
    let (status, body) = gw.send(req).await;
    assert_eq!(status, StatusCode::OK);
    let result: serde_json::Value = serde_json::from_slice(body.trim_ascii()).unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["total_size"], size);
    assert_eq!(gw.pins.count(&root, true).await.unwrap(), 1);

    let records = gw.wait_for_records(1).await;
    assert_eq!(records[0].cid_size, size);
    assert!(records[0].ingress >= size as u64);

    let req = gw.signed("POST", "/api/v0/pin/rm", params(), empty_body());
    let (status, _) = gw.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gw.pins.count(&root, true).await.unwrap(), 0);

    let records = gw.wait_for_records(2).await;
    assert_eq!(records[1].req.uri, "/api/v0/pin/rm");
    assert_eq!(records[1].cid_size, -size);
}
