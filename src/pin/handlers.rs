//! Pin API request handlers

use bytes::{Bytes, BytesMut};
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use super::index::{PinIndex, PinnedCid, UpdateCount};
use super::{
    parse_pin_params, parse_recursive, ChildrenUpdateRequest, ChildrenUpdateResult, CidCount,
    PinAddResult, PinListResult, PinRmResult, PinnedCountResult, PIN_LIST_BATCH,
};
use crate::auth::signature::url_query_pairs;
use crate::context::RequestContext;
use crate::dag::{calculate_dag_stats, parse_cid, DagStats, DagStore, MeteredDagStore};
use crate::server::handler::{
    error_response, json_response, GatewayBody, GatewayRequest, GatewayResponse, Handler,
};
use crate::types::{GatewayError, Result};

pub struct PinHandlers {
    index: Arc<dyn PinIndex>,
    content: Arc<dyn DagStore>,
    /// Storage node API that performs the actual pin and unpin
    upstream: Arc<dyn Handler>,
}

impl PinHandlers {
    pub fn new(
        index: Arc<dyn PinIndex>,
        content: Arc<dyn DagStore>,
        upstream: Arc<dyn Handler>,
    ) -> Self {
        Self {
            index,
            content,
            upstream,
        }
    }

    /// Block store metered against the request's fetch counter and scope
    fn store_for(&self, ctx: &RequestContext) -> Arc<dyn DagStore> {
        let fetched = ctx
            .fetched_bytes
            .clone()
            .unwrap_or_else(|| Arc::new(AtomicU64::new(0)));
        Arc::new(MeteredDagStore::new(
            Arc::clone(&self.content),
            fetched,
            ctx.scope.clone(),
        ))
    }

    /// `POST /api/v0/pin/add`
    pub async fn add(&self, req: GatewayRequest) -> GatewayResponse {
        let (root, recursive) = match parse_pin_params(req.uri().query()) {
            Ok(params) => params,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &PinAddResult::failed(format!("error parsing params: {e}")),
                )
            }
        };

        let ctx = RequestContext::of(&req);
        let resp = self.upstream.handle(req).await;
        if !resp.status().is_success() {
            return resp;
        }

        let job = Arc::new(PinAddJob {
            index: Arc::clone(&self.index),
            store: self.store_for(&ctx),
            aggregate: ctx.dag_stats.clone(),
            root,
            recursive,
        });

        let (mut parts, body) = resp.into_parts();
        parts.headers.remove(CONTENT_LENGTH);
        parts
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Response::from_parts(parts, translate_lines(body, job))
    }

    /// `POST /api/v0/pin/rm`
    ///
    /// Drops one reference; the storage node only unpins once the last
    /// reference is gone. The decrement comes first so concurrent removals
    /// agree on which of them took the count to zero.
    pub async fn rm(&self, req: GatewayRequest) -> GatewayResponse {
        let (root, recursive) = match parse_pin_params(req.uri().query()) {
            Ok(params) => params,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &PinRmResult::failed(format!("error parsing params: {e}")),
                )
            }
        };

        let ctx = RequestContext::of(&req);
        let remaining = match self.index.unpin(&root, recursive).await {
            Ok(remaining) => remaining,
            Err(e @ GatewayError::NotPinned(_)) => {
                return json_response(StatusCode::BAD_REQUEST, &PinRmResult::failed(e.to_string()))
            }
            Err(e) => {
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &PinRmResult::failed(format!("error updating pin index: {e}")),
                )
            }
        };

        // Sized before the storage node may drop the blocks
        let stats = stats_or_default(self.store_for(&ctx).as_ref(), &root, recursive, "pin rm").await;

        if remaining == 0 {
            let resp = self.upstream.handle(req).await;
            if !resp.status().is_success() {
                if let Err(e) = self.index.pin(&root, recursive).await {
                    error!(cid = %root, error = %e, "Error restoring pin after failed unpin");
                }
                return resp;
            }
        }

        if let Some(aggregate) = &ctx.dag_stats {
            aggregate.subtract(&stats);
        }
        info!(cid = %root, recursive, remaining, "Unpinned");
        json_response(StatusCode::OK, &PinRmResult::completed(&stats))
    }

    /// `POST /api/v0/pin/children_update`
    ///
    /// Adjusts reference counts of direct children of a recursively pinned
    /// root. The batch is validated as a whole before any count changes.
    pub async fn children_update(&self, req: GatewayRequest) -> GatewayResponse {
        let ctx = RequestContext::of(&req);
        let body = match req.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(e) => return error_response(&e),
        };

        let failed = |status: StatusCode, message: String| {
            json_response(
                status,
                &ChildrenUpdateResult {
                    success: false,
                    message,
                    sizes: BTreeMap::new(),
                },
            )
        };

        let update: ChildrenUpdateRequest = match serde_json::from_slice(&body) {
            Ok(update) => update,
            Err(e) => {
                return failed(StatusCode::BAD_REQUEST, format!("error parsing params: {e}"))
            }
        };

        let store = self.store_for(&ctx);
        let (incs, decs) =
            match validate_children_update(self.index.as_ref(), store.as_ref(), &update).await {
                Ok(validated) => validated,
                Err(e) => return failed(StatusCode::BAD_REQUEST, format!("invalid request: {e}")),
            };

        if let Err(e) = self.index.update_counts(&incs, &decs).await {
            return failed(StatusCode::BAD_REQUEST, format!("error updating counts: {e}"));
        }

        let mut sizes = BTreeMap::new();
        for (increment, updates) in [(true, &incs), (false, &decs)] {
            for u in updates.iter() {
                let stats =
                    stats_or_default(store.as_ref(), &u.cid, u.recursive, "pin children update")
                        .await;
                sizes.insert(
                    u.cid.to_string(),
                    stats.total_size.load(Ordering::Relaxed).max(0) as u64,
                );
                if let Some(aggregate) = &ctx.dag_stats {
                    if increment {
                        aggregate.add(&stats);
                    } else {
                        aggregate.subtract(&stats);
                    }
                }
            }
        }

        info!(root = %update.root, incs = incs.len(), decs = decs.len(), "Updated children pin counts");
        json_response(
            StatusCode::OK,
            &ChildrenUpdateResult {
                success: true,
                message: "ok".to_string(),
                sizes,
            },
        )
    }

    /// `GET /api/v0/pin/count`
    pub async fn count(&self, req: GatewayRequest) -> GatewayResponse {
        let (cid, recursive) = match parse_pin_params(req.uri().query()) {
            Ok(params) => params,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &PinnedCountResult {
                        message: format!("error parsing params: {e}"),
                        ..Default::default()
                    },
                )
            }
        };

        match self.index.count(&cid, recursive).await {
            Ok(count) => json_response(
                StatusCode::OK,
                &PinnedCountResult {
                    success: true,
                    count,
                    message: String::new(),
                },
            ),
            Err(e) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &PinnedCountResult {
                    message: format!("error querying count: {e}"),
                    ..Default::default()
                },
            ),
        }
    }

    /// `GET /api/v0/pin/ls`: newline-delimited batches of pinned CIDs
    pub async fn ls(&self, req: GatewayRequest) -> GatewayResponse {
        let pairs = url_query_pairs(req.uri().query());
        let flag = pairs
            .iter()
            .find(|(k, _)| k == "recursive")
            .map(|(_, v)| v.as_str());
        let recursive = match parse_recursive(flag) {
            Ok(recursive) => recursive,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &PinListResult {
                        message: format!("error parsing params: {e}"),
                        ..Default::default()
                    },
                )
            }
        };

        let batches = list_batches(self.index.list(recursive));
        let mut resp = Response::new(
            StreamBody::new(batches.map(|line| line.map(Frame::data))).boxed_unsync(),
        );
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }
}

/// Run the calculator, logging and zeroing on failure
async fn stats_or_default(
    store: &dyn DagStore,
    root: &Cid,
    recursive: bool,
    source: &'static str,
) -> DagStats {
    let stats = DagStats::new();
    if let Err(e) = calculate_dag_stats(store, root, recursive, &stats).await {
        error!(cid = %root, source, error = %e, "Error calculating dag stats");
        return DagStats::new();
    }
    stats
}

/// Check a children update against the root's links and the index
pub async fn validate_children_update(
    index: &dyn PinIndex,
    store: &dyn DagStore,
    update: &ChildrenUpdateRequest,
) -> Result<(Vec<UpdateCount>, Vec<UpdateCount>)> {
    let root = parse_cid(&update.root)?;
    if index.count(&root, true).await? == 0 {
        return Err(GatewayError::NotPinned(update.root.clone()));
    }

    let links: HashSet<Cid> = store.get(&root).await?.links.into_iter().collect();
    let mut incremented: HashSet<(Cid, bool)> = HashSet::new();

    let mut incs = Vec::with_capacity(update.incs.len());
    for u in &update.incs {
        let cid = child_of(&links, &u.cid)?;
        incremented.insert((cid, u.recursive));
        incs.push(UpdateCount {
            cid,
            recursive: u.recursive,
        });
    }

    let mut decs = Vec::with_capacity(update.decs.len());
    for u in &update.decs {
        let cid = child_of(&links, &u.cid)?;
        if incremented.contains(&(cid, u.recursive)) {
            return Err(GatewayError::DuplicateEntry(u.cid.clone()));
        }
        decs.push(UpdateCount {
            cid,
            recursive: u.recursive,
        });
    }

    Ok((incs, decs))
}

fn child_of(links: &HashSet<Cid>, value: &str) -> Result<Cid> {
    value
        .parse::<Cid>()
        .ok()
        .filter(|cid| links.contains(cid))
        .ok_or_else(|| GatewayError::NotAChild(value.to_string()))
}

fn json_line<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut line = serde_json::to_vec(value)
        .map_err(|e| GatewayError::Internal(format!("Failed to serialize: {e}")))?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Group a pin listing into `pin/ls` lines; the last line has `success`
fn list_batches(
    entries: BoxStream<'static, Result<PinnedCid>>,
) -> impl futures::Stream<Item = Result<Bytes>> + Send + 'static {
    stream::unfold(Some(entries), |state| async move {
        let mut entries = state?;
        let mut batch: Vec<CidCount> = Vec::with_capacity(PIN_LIST_BATCH);
        while batch.len() < PIN_LIST_BATCH {
            match entries.next().await {
                Some(Ok(pinned)) => batch.push(pinned.into()),
                Some(Err(e)) => {
                    let line = json_line(&PinListResult {
                        message: format!("pinner index error: {e}"),
                        ..Default::default()
                    });
                    return Some((line, None));
                }
                None => {
                    let line = json_line(&PinListResult {
                        success: true,
                        batch,
                        ..Default::default()
                    });
                    return Some((line, None));
                }
            }
        }

        let line = json_line(&PinListResult {
            in_progress: true,
            batch,
            ..Default::default()
        });
        Some((line, Some(entries)))
    })
}

// =============================================================================
// Pin add response translation
// =============================================================================

/// One line of the storage node's `pin/add` output
#[derive(Debug, Deserialize)]
struct UpstreamPinOutput {
    #[serde(rename = "Pins")]
    pins: Option<Vec<String>>,
    #[serde(rename = "Progress")]
    progress: Option<u64>,
}

struct PinAddJob {
    index: Arc<dyn PinIndex>,
    store: Arc<dyn DagStore>,
    aggregate: Option<Arc<DagStats>>,
    root: Cid,
    recursive: bool,
}

impl PinAddJob {
    /// Rewrite one output line; lines that are not pin output pass through
    async fn translate(&self, line: &[u8]) -> Result<Bytes> {
        let output = match serde_json::from_slice::<UpstreamPinOutput>(line) {
            Ok(output) if output.pins.is_some() || output.progress.is_some() => output,
            _ => {
                let mut raw = line.to_vec();
                raw.push(b'\n');
                return Ok(Bytes::from(raw));
            }
        };

        let processed = output.progress.unwrap_or(0);
        if output.pins.map_or(true, |pins| pins.is_empty()) {
            return json_line(&PinAddResult::in_progress(processed));
        }
        json_line(&self.complete(processed).await)
    }

    async fn complete(&self, processed: u64) -> PinAddResult {
        if let Err(e) = self.index.pin(&self.root, self.recursive).await {
            error!(cid = %self.root, error = %e, "Error updating pin index");
            return PinAddResult::failed(format!("error updating pin index: {e}"));
        }

        let stats = stats_or_default(self.store.as_ref(), &self.root, self.recursive, "pin add").await;
        if let Some(aggregate) = &self.aggregate {
            aggregate.add(&stats);
        }
        info!(cid = %self.root, recursive = self.recursive, "Pinned");
        PinAddResult::completed(processed, &stats)
    }
}

struct LineState {
    body: GatewayBody,
    buf: BytesMut,
    done: bool,
    job: Arc<PinAddJob>,
}

/// Re-frame the upstream body by lines and translate each one
fn translate_lines(body: GatewayBody, job: Arc<PinAddJob>) -> GatewayBody {
    let state = LineState {
        body,
        buf: BytesMut::new(),
        done: false,
        job,
    };

    let lines = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line = st.buf.split_to(pos + 1);
                let out = st.job.translate(&line[..pos]).await;
                return Some((out, st));
            }
            if st.done {
                if st.buf.is_empty() {
                    return None;
                }
                let line = st.buf.split();
                let out = st.job.translate(&line).await;
                return Some((out, st));
            }

            match st.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        st.buf.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(e), st));
                }
                None => st.done = true,
            }
        }
    });

    StreamBody::new(lines.map(|line| line.map(Frame::data))).boxed_unsync()
}
