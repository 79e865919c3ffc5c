//! HTTP proxy to the storage node
//!
//! Requests that no local handler claims are replayed against the storage
//! node's RPC API. Both bodies are streamed so the pipeline's counters and
//! the sentry see bytes as they flow.

use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderMap, CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use hyper::Response;
use tracing::{debug, warn};

use crate::server::handler::{error_response, GatewayRequest, GatewayResponse, Handler};
use crate::types::{GatewayError, Result};

/// Forwards requests to `{base_url}{path}?{query}`
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamProxy {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn forward(&self, req: GatewayRequest) -> Result<GatewayResponse> {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path);

        let mut headers = parts.headers;
        strip_hop_headers(&mut headers);
        headers.remove(HOST);

        debug!(method = %parts.method, url = %url, "Forwarding to storage node");

        let resp = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("{url}: {e}")))?;

        let status = resp.status();
        let mut headers = resp.headers().clone();
        strip_hop_headers(&mut headers);

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(Frame::data).map_err(GatewayError::from));

        let mut out = Response::new(StreamBody::new(stream).boxed_unsync());
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in [CONNECTION, TRANSFER_ENCODING, UPGRADE] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[async_trait::async_trait]
impl Handler for UpstreamProxy {
    async fn handle(&self, req: GatewayRequest) -> GatewayResponse {
        match self.forward(req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "Storage node request failed");
                error_response(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::empty_body;
    use hyper::{Request, StatusCode};

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Port 9 (discard) on loopback is not expected to run an HTTP server
        let proxy = UpstreamProxy::new(reqwest::Client::new(), "http://127.0.0.1:9/");
        let req = Request::builder()
            .uri("/api/v0/cat?arg=x")
            .body(empty_body())
            .unwrap();

        let resp = proxy.handle(req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_strip_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "close".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-ipfs-path", "/ipfs/x".parse().unwrap());
        strip_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
    }
}
