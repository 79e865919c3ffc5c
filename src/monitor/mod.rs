//! Usage monitor
//!
//! Meters every request that made it through auth: bytes read from the
//! request body, bytes written to the response and bytes the request made
//! the gateway fetch from the storage node. A background task enforces
//! the signed `size` cap on fetched bytes, reports long fetches while they
//! run and sends the final report once the response body is gone.
//!
//! Reporting never affects the response. Failed reports are logged and
//! counted; the fetched-bytes watermark only moves on a successful send, so
//! unreported bytes roll into the next report.

pub mod counter;
pub mod report;

use http_body_util::BodyExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::auth::middleware::request_host;
use crate::auth::signature::url_query_pairs;
use crate::auth::{canonicalize_uri, PARAM_ARGS, PARAM_SIG};
use crate::context::{context_mut, RequestContext, RequestScope};
use crate::dag::{dag_stats_for, parse_cid, DagStats, DagStore};
use crate::pin::parse_recursive;
use crate::server::body::ScopedBody;
use crate::server::handler::{error_response, GatewayRequest, GatewayResponse, Handler};
use crate::types::GatewayError;

pub use counter::{EgressCounter, IngressCounter};
pub use report::{HttpReporter, MemoryReporter, ReportedRequest, Reporter, UsageRecord};

/// Period of the cap check and interim reporting
pub const TICK: Duration = Duration::from_secs(1);

/// Unreported fetched bytes that trigger an interim report
pub const INTERIM_REPORT_BYTES: u64 = 1 << 20;

/// Sign applied to the content size of a request, 0 when not billed
pub fn content_size_weight(uri: &str) -> i64 {
    match uri {
        "/api/v0/pin/add" => 1,
        "/api/v0/pin/rm" => -1,
        _ => 0,
    }
}

pub struct UsageMonitor {
    reporter: Arc<dyn Reporter>,
    /// Unmetered store used to size pin targets the handler left unsized
    content: Arc<dyn DagStore>,
    next: Arc<dyn Handler>,
}

impl UsageMonitor {
    pub fn new(
        reporter: Arc<dyn Reporter>,
        content: Arc<dyn DagStore>,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            reporter,
            content,
            next,
        }
    }
}

#[async_trait::async_trait]
impl Handler for UsageMonitor {
    async fn handle(&self, mut req: GatewayRequest) -> GatewayResponse {
        let ctx = RequestContext::of(&req);
        if ctx.no_report {
            return self.next.handle(req).await;
        }

        // Ends on response completion, or on an early return of this future
        let scope = ctx.scope.child();
        let pending = scope.drop_guard();

        let fetched = Arc::new(AtomicU64::new(0));
        let dag_stats = Arc::new(DagStats::new());
        {
            let ctx = context_mut(&mut req);
            ctx.no_report = true;
            ctx.fetched_bytes = Some(Arc::clone(&fetched));
            ctx.dag_stats = Some(Arc::clone(&dag_stats));
            ctx.scope = scope.clone();
        }

        let query = url_query_pairs(req.uri().query());
        let request = ReportedRequest {
            method: req.method().to_string(),
            host: request_host(&req),
            uri: canonicalize_uri(req.uri().path()),
            args: query_value(&query, PARAM_ARGS).unwrap_or_default(),
            sig: query_value(&query, PARAM_SIG).unwrap_or_default(),
        };

        let ingress = Arc::new(AtomicU64::new(0));
        let egress = Arc::new(AtomicU64::new(0));
        let succeeded = Arc::new(AtomicBool::new(false));
        let cap = ctx.size_cap();

        let task = UsageTask {
            reporter: Arc::clone(&self.reporter),
            content: Arc::clone(&self.content),
            arg: query_value(&query, "arg"),
            recursive: parse_recursive(query_value(&query, "recursive").as_deref())
                .unwrap_or(true),
            request,
            ingress: Arc::clone(&ingress),
            egress: Arc::clone(&egress),
            fetched,
            cap,
            dag_stats,
            succeeded: Arc::clone(&succeeded),
            scope: scope.clone(),
        };
        tokio::spawn(task.run());

        let body_scope = scope.clone();
        let req = req.map(|body| IngressCounter::new(body, ingress, cap, body_scope).boxed_unsync());

        let (resp, streaming) = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                let reason = scope.reason();
                warn!(error = %reason, "Request cancelled while metering");
                (error_response(&reason), false)
            }
            resp = self.next.handle(req) => (resp, true),
        };
        succeeded.store(streaming && resp.status().is_success(), Ordering::Relaxed);

        let resp = resp.map(move |body| {
            let body = ScopedBody::new(EgressCounter::new(body, egress).boxed_unsync(), scope);
            let body = if streaming { body } else { body.ignore_cancel() };
            body.boxed_unsync()
        });
        let _ = pending.disarm();
        resp
    }
}

fn query_value(query: &[(String, String)], key: &str) -> Option<String> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Background half of the monitor, one per metered request
struct UsageTask {
    reporter: Arc<dyn Reporter>,
    content: Arc<dyn DagStore>,
    request: ReportedRequest,
    arg: Option<String>,
    recursive: bool,
    ingress: Arc<AtomicU64>,
    egress: Arc<AtomicU64>,
    fetched: Arc<AtomicU64>,
    cap: Option<u64>,
    dag_stats: Arc<DagStats>,
    succeeded: Arc<AtomicBool>,
    scope: RequestScope,
}

impl UsageTask {
    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reported = 0u64;

        loop {
            tokio::select! {
                _ = self.scope.cancelled() => break,
                _ = ticker.tick() => {
                    let head = self.fetched.load(Ordering::Relaxed);
                    if matches!(self.cap, Some(cap) if head > cap) {
                        debug!(uri = %self.request.uri, fetched = head, "Fetch size cap exceeded");
                        self.scope.cancel_with(GatewayError::SizeCapExceeded);
                        break;
                    }

                    let delta = head.saturating_sub(reported);
                    if delta > INTERIM_REPORT_BYTES && self.report(delta, 0, 0, true).await {
                        reported = head;
                    }
                }
            }
        }

        let cid_size = self.content_size().await;
        let ingress = self.ingress.load(Ordering::Relaxed)
            + self.fetched.load(Ordering::Relaxed).saturating_sub(reported);
        let egress = self.egress.load(Ordering::Relaxed);
        self.report(ingress, egress, cid_size, false).await;
    }

    /// Send one report; true when the collector accepted it
    async fn report(&self, ingress: u64, egress: u64, cid_size: i64, interim: bool) -> bool {
        metrics::counter!("request_log_total").increment(1);

        let record = UsageRecord::new(self.request.clone(), ingress, egress, cid_size);
        match self.reporter.send(&record).await {
            Ok(()) => {
                metrics::counter!("ingress_bytes").increment(ingress);
                metrics::counter!("egress_bytes").increment(egress);
                true
            }
            Err(e) => {
                metrics::counter!("request_log_err_total").increment(1);
                if interim {
                    error!(uri = %self.request.uri, error = %e, "Error making in-progress usage report");
                } else {
                    error!(uri = %self.request.uri, error = %e, "Error making usage report");
                }
                false
            }
        }
    }

    /// Content size billed with the final report
    async fn content_size(&self) -> i64 {
        let weight = content_size_weight(&self.request.uri);
        if weight == 0 {
            return 0;
        }
        let aggregate = self.dag_stats.snapshot();
        if aggregate.total_count != 0 {
            return aggregate.total_size.abs() * weight;
        }
        if !self.succeeded.load(Ordering::Relaxed) {
            return 0;
        }

        let Some(arg) = self.arg.as_deref() else {
            return 0;
        };
        let sized = async {
            let cid = parse_cid(arg.trim_start_matches("/ipfs/"))?;
            dag_stats_for(self.content.as_ref(), &cid, self.recursive).await
        }
        .await;

        match sized {
            Ok(stats) => stats.total_size.load(Ordering::Relaxed) * weight,
            Err(e) => {
                warn!(arg = %arg, error = %e, "Content size unavailable for report");
                0
            }
        }
    }
}
