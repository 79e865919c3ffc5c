//! DagStore implementations

use bytes::Bytes;
use cid::Cid;
use dashmap::DashMap;
use multihash_codetable::{Code, MultihashDigest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{pb, DagNode, DagStore};
use crate::context::RequestScope;
use crate::types::{GatewayError, Result};

// =============================================================================
// In-memory store
// =============================================================================

/// Blocks held in process; used in dev mode and tests
#[derive(Debug, Default)]
pub struct MemoryDagStore {
    blocks: DashMap<Cid, Bytes>,
}

impl MemoryDagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block under a CID of the given codec
    pub fn put_block(&self, codec: u64, raw: impl Into<Bytes>) -> Cid {
        let raw = raw.into();
        let cid = Cid::new_v1(codec, Code::Sha2_256.digest(&raw));
        self.blocks.insert(cid, raw);
        cid
    }

    /// Store a raw leaf
    pub fn put_leaf(&self, data: &[u8]) -> Cid {
        self.put_block(pb::RAW, Bytes::copy_from_slice(data))
    }

    /// Store a dag-pb node linking to `links`
    pub fn put_node(&self, links: &[Cid], data: &[u8]) -> Cid {
        self.put_block(pb::DAG_PB, pb::encode_node(links, data))
    }

    pub fn block_size(&self, cid: &Cid) -> Option<i64> {
        self.blocks.get(cid).map(|b| b.len() as i64)
    }

    pub fn remove(&self, cid: &Cid) {
        self.blocks.remove(cid);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[async_trait::async_trait]
impl DagStore for MemoryDagStore {
    async fn get(&self, cid: &Cid) -> Result<DagNode> {
        let raw = self
            .blocks
            .get(cid)
            .map(|b| b.value().clone())
            .ok_or_else(|| GatewayError::Traversal(format!("block not found: {cid}")))?;
        DagNode::from_block(*cid, raw)
    }
}

// =============================================================================
// Storage node over HTTP
// =============================================================================

/// Fetches blocks from a Kubo-compatible RPC API
#[derive(Debug, Clone)]
pub struct UpstreamDagStore {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamDagStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl DagStore for UpstreamDagStore {
    async fn get(&self, cid: &Cid) -> Result<DagNode> {
        let url = format!("{}/api/v0/block/get", self.base_url);
        let resp = self
            .client
            .post(&url)
            .query(&[("arg", cid.to_string())])
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| GatewayError::Traversal(format!("block/get {cid}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let msg = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Traversal(format!(
                "block/get {cid}: unexpected status [{status}] {msg}"
            )));
        }

        let raw = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Traversal(format!("block/get {cid}: {e}")))?;
        DagNode::from_block(*cid, raw)
    }
}

// =============================================================================
// Metered wrapper
// =============================================================================

/// Counts fetched bytes into the request's counter and aborts with the
/// request's scope.
pub struct MeteredDagStore {
    inner: Arc<dyn DagStore>,
    fetched: Arc<AtomicU64>,
    scope: RequestScope,
}

impl MeteredDagStore {
    pub fn new(inner: Arc<dyn DagStore>, fetched: Arc<AtomicU64>, scope: RequestScope) -> Self {
        Self {
            inner,
            fetched,
            scope,
        }
    }
}

#[async_trait::async_trait]
impl DagStore for MeteredDagStore {
    async fn get(&self, cid: &Cid) -> Result<DagNode> {
        metrics::counter!("dag_store_get_call_total").increment(1);

        let result = tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(self.scope.reason()),
            node = self.inner.get(cid) => node,
        };

        match &result {
            Ok(node) => {
                self.fetched
                    .fetch_add(node.raw.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                metrics::counter!("dag_store_get_err_total").increment(1);
                debug!(cid = %cid, error = %e, "Block fetch failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metered_store_counts_bytes() {
        let mem = Arc::new(MemoryDagStore::new());
        let cid = mem.put_leaf(b"0123456789");
        let fetched = Arc::new(AtomicU64::new(0));
        let store = MeteredDagStore::new(mem, Arc::clone(&fetched), RequestScope::new());

        store.get(&cid).await.unwrap();
        store.get(&cid).await.unwrap();
        assert_eq!(fetched.load(Ordering::Relaxed), 20);
    }

    #[tokio::test]
    async fn test_metered_store_stops_on_cancel() {
        let mem = Arc::new(MemoryDagStore::new());
        let cid = mem.put_leaf(b"data");
        let scope = RequestScope::new();
        let store = MeteredDagStore::new(mem, Arc::new(AtomicU64::new(0)), scope.clone());

        scope.cancel_with(GatewayError::SizeCapExceeded);
        let err = store.get(&cid).await;
        assert!(matches!(err, Err(GatewayError::SizeCapExceeded)));
    }

    #[tokio::test]
    async fn test_memory_store_decodes_links() {
        let mem = MemoryDagStore::new();
        let leaf = mem.put_leaf(b"leaf");
        let root = mem.put_node(&[leaf], b"");
        let node = mem.get(&root).await.unwrap();
        assert_eq!(node.links, vec![leaf]);
        assert!(mem.get(&leaf).await.unwrap().links.is_empty());
    }
}
