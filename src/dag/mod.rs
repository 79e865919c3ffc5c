//! DAG size accounting
//!
//! Computes logical and deduplicated sizes of a content-addressed DAG for
//! billing and pin responses. Block retrieval goes through [`DagStore`] so
//! the calculator works the same against the storage node, an in-memory
//! DAG, or a metered wrapper that enforces the request's fetch cap.

pub mod pb;
pub mod store;

use bytes::Bytes;
use cid::Cid;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::types::{GatewayError, Result};

pub use store::{MemoryDagStore, MeteredDagStore, UpstreamDagStore};

// =============================================================================
// Nodes and retrieval
// =============================================================================

/// A block and the CIDs it links to
#[derive(Debug, Clone)]
pub struct DagNode {
    pub cid: Cid,
    pub raw: Bytes,
    pub links: Vec<Cid>,
}

impl DagNode {
    /// Build a node from a raw block, extracting dag-pb links
    pub fn from_block(cid: Cid, raw: Bytes) -> Result<Self> {
        let links = if cid.codec() == pb::DAG_PB {
            pb::decode_links(&raw[..])?
        } else {
            Vec::new()
        };
        Ok(Self { cid, raw, links })
    }

    pub fn size(&self) -> i64 {
        self.raw.len() as i64
    }
}

/// Block retrieval used by the calculator and the pin handlers
#[async_trait::async_trait]
pub trait DagStore: Send + Sync {
    /// Fetch a node; missing or unreachable nodes are `Traversal` errors
    async fn get(&self, cid: &Cid) -> Result<DagNode>;
}

// =============================================================================
// Stats
// =============================================================================

/// Size statistics of one or more DAGs
#[derive(Debug, Default)]
pub struct DagStats {
    /// Number of calculations folded into these stats
    pub total_count: AtomicI64,
    pub deduplicated_size: AtomicI64,
    pub deduplicated_num_blocks: AtomicI64,
    pub total_size: AtomicI64,
    pub total_num_blocks: AtomicI64,
}

/// Plain copy of [`DagStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DagStatsSnapshot {
    pub total_count: i64,
    pub deduplicated_size: i64,
    pub deduplicated_num_blocks: i64,
    pub total_size: i64,
    pub total_num_blocks: i64,
}

impl DagStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> [&AtomicI64; 5] {
        [
            &self.total_count,
            &self.deduplicated_size,
            &self.deduplicated_num_blocks,
            &self.total_size,
            &self.total_num_blocks,
        ]
    }

    /// Fold another set of stats in
    pub fn add(&self, other: &DagStats) {
        for (mine, theirs) in self.counters().into_iter().zip(other.counters()) {
            mine.fetch_add(theirs.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Remove another set of stats
    pub fn subtract(&self, other: &DagStats) {
        for (mine, theirs) in self.counters().into_iter().zip(other.counters()) {
            mine.fetch_sub(theirs.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DagStatsSnapshot {
        DagStatsSnapshot {
            total_count: self.total_count.load(Ordering::Relaxed),
            deduplicated_size: self.deduplicated_size.load(Ordering::Relaxed),
            deduplicated_num_blocks: self.deduplicated_num_blocks.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
            total_num_blocks: self.total_num_blocks.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Traversal
// =============================================================================

/// What the traversal keeps of a block once it has been fetched
struct VisitedBlock {
    size: i64,
    links: Vec<Cid>,
}

impl From<DagNode> for VisitedBlock {
    fn from(node: DagNode) -> Self {
        Self {
            size: node.size(),
            links: node.links,
        }
    }
}

/// Compute DAG statistics for `root` into `stats`.
///
/// Recursive mode walks the DAG depth-first in pre-order without skipping
/// shared subtrees: total counters credit every visit, deduplicated counters
/// only the first visit of each CID. Non-recursive mode records the root
/// block alone for all four size counters.
pub async fn calculate_dag_stats(
    store: &dyn DagStore,
    root: &Cid,
    recursive: bool,
    stats: &DagStats,
) -> Result<()> {
    stats.total_count.fetch_add(1, Ordering::Relaxed);

    let root_node = store.get(root).await?;

    if !recursive {
        let sz = root_node.size();
        stats.deduplicated_size.store(sz, Ordering::Relaxed);
        stats.deduplicated_num_blocks.store(1, Ordering::Relaxed);
        stats.total_size.store(sz, Ordering::Relaxed);
        stats.total_num_blocks.store(1, Ordering::Relaxed);
        return Ok(());
    }

    // Revisits only need the size and links; block bytes are dropped
    let mut blocks: HashMap<Cid, VisitedBlock> = HashMap::new();
    let mut pending_root = Some(root_node);
    let mut stack = vec![*root];

    while let Some(cid) = stack.pop() {
        let (block, first_visit) = match blocks.entry(cid) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let node = match pending_root.take() {
                    Some(node) => node,
                    None => store.get(&cid).await?,
                };
                (entry.insert(VisitedBlock::from(node)), true)
            }
        };

        if first_visit {
            stats.deduplicated_size.fetch_add(block.size, Ordering::Relaxed);
            stats.deduplicated_num_blocks.fetch_add(1, Ordering::Relaxed);
        }
        stats.total_size.fetch_add(block.size, Ordering::Relaxed);
        stats.total_num_blocks.fetch_add(1, Ordering::Relaxed);

        stack.extend(block.links.iter().rev().copied());
    }

    debug!(
        root = %root,
        blocks = blocks.len(),
        visits = stats.total_num_blocks.load(Ordering::Relaxed),
        "Calculated dag stats"
    );

    Ok(())
}

/// Run the calculator into fresh stats
pub async fn dag_stats_for(store: &dyn DagStore, root: &Cid, recursive: bool) -> Result<DagStats> {
    let stats = DagStats::new();
    calculate_dag_stats(store, root, recursive, &stats).await?;
    Ok(stats)
}

/// Parse a CID from a request argument
pub fn parse_cid(value: &str) -> Result<Cid> {
    value
        .parse::<Cid>()
        .map_err(|e| GatewayError::BadRequest(format!("invalid CID {value:?}: {e}")))
}
