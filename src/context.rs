//! Per-request state carried through the middleware chain
//!
//! Stored as a typed value in the request extensions. Middlewares read it
//! with [`RequestContext::of`] and mutate it with [`context_mut`].

use hyper::Request;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};

use crate::auth::SignedArgs;
use crate::dag::DagStats;
use crate::types::GatewayError;

// =============================================================================
// Cancellation scope
// =============================================================================

/// Cancellation scope of one request.
///
/// The first cancellation reason wins and is shared with child scopes, so
/// whoever observes the cancellation can map it to the right status.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    token: CancellationToken,
    reason: Arc<OnceLock<GatewayError>>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope cancelled together with this one, sharing its reason
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::clone(&self.reason),
        }
    }

    /// Cancel with a terminal reason (ignored if one is already recorded)
    pub fn cancel_with(&self, reason: GatewayError) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    /// Cancel because the request finished
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded reason, or `Cancelled` when the scope simply ended
    pub fn reason(&self) -> GatewayError {
        self.reason.get().cloned().unwrap_or(GatewayError::Cancelled)
    }

    /// Whether a terminal reason was recorded
    pub fn has_reason(&self) -> bool {
        self.reason.get().is_some()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    /// Guard that ends the scope when dropped
    pub fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

// =============================================================================
// Request context
// =============================================================================

/// Typed per-request carry-bag
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Set once auth succeeded; internal re-dispatch skips auth
    pub no_auth: bool,
    /// Set once the monitor is attached; internal re-dispatch is not metered
    pub no_report: bool,
    /// Decoded signed args, when the request carried a token
    pub args: Option<Arc<SignedArgs>>,
    /// Bytes fetched from the backing store while serving this request
    pub fetched_bytes: Option<Arc<AtomicU64>>,
    /// Aggregate DAG stats folded in by pin handlers
    pub dag_stats: Option<Arc<DagStats>>,
    /// Sentry rule that blocked the response, if any
    pub blocked_rule: Arc<OnceLock<&'static str>>,
    pub scope: RequestScope,
}

impl RequestContext {
    /// Snapshot of the context attached to a request (default when absent)
    pub fn of<B>(req: &Request<B>) -> Self {
        req.extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default()
    }

    pub fn size_cap(&self) -> Option<u64> {
        self.args.as_deref().and_then(SignedArgs::size_cap)
    }
}

/// Mutable access to the request's context, attaching a fresh one if needed
pub fn context_mut<B>(req: &mut Request<B>) -> &mut RequestContext {
    req.extensions_mut().get_or_insert_default::<RequestContext>()
}
