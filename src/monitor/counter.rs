//! Byte-counting body adapters

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use crate::context::RequestScope;
use crate::server::handler::GatewayBody;
use crate::types::GatewayError;

/// Request body that counts bytes read and enforces the size cap.
///
/// Once the count passes the cap every further read fails with
/// `SizeCapExceeded` and the request scope is cancelled with that reason.
pub struct IngressCounter {
    inner: GatewayBody,
    read: Arc<AtomicU64>,
    cap: Option<u64>,
    scope: RequestScope,
    exceeded: bool,
}

impl IngressCounter {
    pub fn new(
        inner: GatewayBody,
        read: Arc<AtomicU64>,
        cap: Option<u64>,
        scope: RequestScope,
    ) -> Self {
        Self {
            inner,
            read,
            cap,
            scope,
            exceeded: false,
        }
    }
}

impl Body for IngressCounter {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.exceeded {
            return Poll::Ready(Some(Err(GatewayError::SizeCapExceeded)));
        }

        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        if let Some(Ok(frame)) = &frame {
            if let Some(data) = frame.data_ref() {
                let total = this.read.fetch_add(data.len() as u64, Ordering::Relaxed)
                    + data.len() as u64;
                if matches!(this.cap, Some(cap) if total > cap) {
                    this.exceeded = true;
                    this.scope.cancel_with(GatewayError::SizeCapExceeded);
                    return Poll::Ready(Some(Err(GatewayError::SizeCapExceeded)));
                }
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        !self.exceeded && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response body that counts bytes written
pub struct EgressCounter {
    inner: GatewayBody,
    written: Arc<AtomicU64>,
}

impl EgressCounter {
    pub fn new(inner: GatewayBody, written: Arc<AtomicU64>) -> Self {
        Self { inner, written }
    }
}

impl Body for EgressCounter {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        if let Some(Ok(frame)) = &frame {
            if let Some(data) = frame.data_ref() {
                this.written
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::full_body;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_ingress_counts_without_cap() {
        let read = Arc::new(AtomicU64::new(0));
        let body = IngressCounter::new(full_body(vec![0u8; 100]), read.clone(), None, RequestScope::new());
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes.len(), 100);
        assert_eq!(read.load(Ordering::Relaxed), 100);
    }

    #[tokio::test]
    async fn test_ingress_cap_cancels_scope() {
        let scope = RequestScope::new();
        let read = Arc::new(AtomicU64::new(0));
        let body = IngressCounter::new(full_body(vec![0u8; 100]), read, Some(99), scope.clone());

        assert!(matches!(body.collect().await, Err(GatewayError::SizeCapExceeded)));
        assert!(scope.is_cancelled());
        assert!(matches!(scope.reason(), GatewayError::SizeCapExceeded));
    }

    #[tokio::test]
    async fn test_ingress_cap_is_inclusive() {
        let scope = RequestScope::new();
        let read = Arc::new(AtomicU64::new(0));
        let body = IngressCounter::new(full_body(vec![0u8; 100]), read, Some(100), scope.clone());
        assert!(body.collect().await.is_ok());
        assert!(!scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_egress_counts() {
        let written = Arc::new(AtomicU64::new(0));
        let body = EgressCounter::new(full_body("hello world"), written.clone());
        body.collect().await.unwrap();
        assert_eq!(written.load(Ordering::Relaxed), 11);
    }
}
