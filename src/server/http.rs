//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo; every connection gets its own task and
//! every request enters the middleware chain with a fresh context.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::context::RequestContext;
use crate::server::handler::{GatewayRequest, GatewayResponse, Handler};
use crate::types::{GatewayError, Result};

/// Start the HTTP server
pub async fn run(config: Arc<GatewayConfig>, handler: Arc<dyn Handler>) -> Result<()> {
    let listener = TcpListener::bind(config.listen).await?;

    info!(
        listen = %config.listen,
        upstream = %config.upstream_url,
        "Tollgate listening"
    );

    if config.verify_key.is_none() {
        warn!("Signature verification disabled");
    }

    serve(listener, handler).await
}

/// Accept connections on `listener` until it fails for good
pub async fn serve(listener: TcpListener, handler: Arc<dyn Handler>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let io = hyper_util::rt::TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let handler = Arc::clone(&handler);
                        async move { Ok::<_, Infallible>(dispatch(handler.as_ref(), addr, req).await) }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        debug!(peer = %addr, error = ?err, "Error serving connection");
                    }
                });
            }
            Err(e) => {
                error!(error = ?e, "Error accepting connection");
            }
        }
    }
}

/// Box the incoming body and hand the request to the chain
pub async fn dispatch(
    handler: &dyn Handler,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> GatewayResponse {
    info!(peer = %addr, method = %req.method(), path = %req.uri().path(), "Request");

    let mut req: GatewayRequest =
        req.map(|body| body.map_err(GatewayError::from).boxed_unsync());
    req.extensions_mut().insert(RequestContext::default());

    handler.handle(req).await
}
