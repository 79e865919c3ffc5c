//! Response body tied to a request's cancellation scope

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::{DropGuard, WaitForCancellationFutureOwned};

use super::handler::GatewayBody;
use crate::context::RequestScope;
use crate::types::GatewayError;

/// Ends the scope when the body is finished or dropped.
///
/// While streaming, a scope cancelled with a reason aborts the body with
/// that reason. Hyper then resets the connection.
pub struct ScopedBody {
    inner: GatewayBody,
    scope: RequestScope,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
    _guard: DropGuard,
}

impl ScopedBody {
    pub fn new(inner: GatewayBody, scope: RequestScope) -> Self {
        Self {
            cancelled: Some(Box::pin(scope.cancelled_owned())),
            _guard: scope.drop_guard(),
            inner,
            scope,
            on_drop: None,
        }
    }

    /// Stream the body to the end even if the scope is cancelled
    pub fn ignore_cancel(mut self) -> Self {
        self.cancelled = None;
        self
    }

    /// Run `f` once the body is dropped
    pub fn on_drop(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(f));
        self
    }
}

impl Body for ScopedBody {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(cancelled) = this.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                this.cancelled = None;
                if this.scope.has_reason() {
                    return Poll::Ready(Some(Err(this.scope.reason())));
                }
            }
        }

        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ScopedBody {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}
