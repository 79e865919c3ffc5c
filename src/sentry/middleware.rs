//! Sentry pipeline stage
//!
//! Status and headers of an inspected response are held until the first
//! clean batch is released, so a marker found before that point still
//! turns the response into `410 Gone`.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use hyper::{Response, StatusCode};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};
use tracing::warn;

use super::ContentSentry;
use crate::context::RequestContext;
use crate::server::handler::{
    empty_body, error_response, GatewayBody, GatewayRequest, GatewayResponse, Handler,
};
use crate::types::{GatewayError, Result};

/// Headers describing content that must not survive a block
const STRIPPED_ON_GONE: [&str; 5] = [
    "content-length",
    "content-type",
    "etag",
    "x-ipfs-path",
    "x-ipfs-roots",
];

pub struct SentryMiddleware {
    next: Arc<dyn Handler>,
}

impl SentryMiddleware {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait::async_trait]
impl Handler for SentryMiddleware {
    async fn handle(&self, req: GatewayRequest) -> GatewayResponse {
        let blocked_rule = Arc::clone(&RequestContext::of(&req).blocked_rule);
        let resp = self.next.handle(req).await;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| v.to_str().unwrap_or_default());
        let sentry = ContentSentry::for_content_type(content_type);
        if !sentry.is_enabled() {
            return resp;
        }

        let (mut parts, body) = resp.into_parts();
        // Released bytes change the length
        parts.headers.remove(CONTENT_LENGTH);

        let mut body = SentryBody::new(body, sentry, blocked_rule);
        match body.prefetch().await {
            Ok(()) => Response::from_parts(parts, body.boxed_unsync()),
            Err(GatewayError::BadContent(_)) => {
                for name in STRIPPED_ON_GONE {
                    parts.headers.remove(HeaderName::from_static(name));
                }
                parts.status = StatusCode::GONE;
                Response::from_parts(parts, empty_body())
            }
            Err(e) => error_response(&e),
        }
    }
}

/// Response body filtered through a [`ContentSentry`]
pub struct SentryBody {
    inner: GatewayBody,
    sentry: ContentSentry,
    ready: VecDeque<Frame<Bytes>>,
    done: bool,
    blocked_rule: Arc<OnceLock<&'static str>>,
}

impl SentryBody {
    pub fn new(
        inner: GatewayBody,
        sentry: ContentSentry,
        blocked_rule: Arc<OnceLock<&'static str>>,
    ) -> Self {
        Self {
            inner,
            sentry,
            ready: VecDeque::new(),
            done: false,
            blocked_rule,
        }
    }

    /// Pull frames until something can be released or the body ends
    pub async fn prefetch(&mut self) -> Result<()> {
        while self.ready.is_empty() && !self.done {
            let frame = self.inner.frame().await;
            self.on_frame(frame)?;
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Option<Result<Frame<Bytes>>>) -> Result<()> {
        let outcome = match frame {
            None => {
                self.done = true;
                self.sentry.finish().map(|tail| self.release(tail))
            }
            Some(Err(e)) => Err(e),
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => self.sentry.write(&data).map(|out| self.release(out)),
                Err(trailers) => {
                    self.done = true;
                    let tail = self.sentry.finish();
                    tail.map(|tail| {
                        self.release(tail);
                        self.ready.push_back(trailers);
                    })
                }
            },
        };

        if let Err(GatewayError::BadContent(rule)) = outcome.as_ref() {
            if self.blocked_rule.set(*rule).is_ok() {
                warn!(rule = %rule, "Blocked response content");
            }
        }
        if outcome.is_err() {
            self.done = true;
            self.ready.clear();
        }
        outcome
    }

    fn release(&mut self, data: Option<Bytes>) {
        if let Some(data) = data {
            self.ready.push_back(Frame::data(data));
        }
    }
}

impl Body for SentryBody {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
            if let Err(e) = this.on_frame(frame) {
                return Poll::Ready(Some(Err(e)));
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done && self.ready.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
