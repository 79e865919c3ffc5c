//! Handler abstraction shared by the middleware chain
//!
//! Every layer is a [`Handler`] holding the next one as `Arc<dyn Handler>`.
//! Bodies are boxed so layers can wrap them without knowing what is inside.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::sync::Arc;

use crate::types::GatewayError;

/// Body type flowing through the pipeline in both directions
pub type GatewayBody = UnsyncBoxBody<Bytes, GatewayError>;

pub type GatewayRequest = Request<GatewayBody>;
pub type GatewayResponse = Response<GatewayBody>;

/// One stage of the request pipeline
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: GatewayRequest) -> GatewayResponse;
}

/// Adapter turning an async closure into a [`Handler`]
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a shared handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatewayResponse> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait::async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatewayResponse> + Send + 'static,
{
    async fn handle(&self, req: GatewayRequest) -> GatewayResponse {
        (self.0)(req).await
    }
}

// =============================================================================
// Bodies
// =============================================================================

pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

// =============================================================================
// Responses
// =============================================================================

/// JSON response with the given status
pub fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> GatewayResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut resp = Response::new(full_body(body));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => error_response(&GatewayError::Internal(format!(
            "Failed to serialize response: {e}"
        ))),
    }
}

/// Error response in the `{"error", "message"}` shape
pub fn error_response(err: &GatewayError) -> GatewayResponse {
    let status = err.status_code();
    let body = serde_json::json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": err.to_string(),
    });

    let mut resp = Response::new(full_body(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Temporary redirect to `location`
pub fn redirect_response(location: &str) -> GatewayResponse {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::TEMPORARY_REDIRECT;
    match HeaderValue::from_str(location) {
        Ok(value) => {
            resp.headers_mut().insert(hyper::header::LOCATION, value);
            resp
        }
        Err(_) => error_response(&GatewayError::Internal(format!(
            "invalid redirect location: {location}"
        ))),
    }
}
