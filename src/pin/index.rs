//! Reference-counted pin index
//!
//! The index itself belongs to the storage side; the gateway only talks to
//! it through [`PinIndex`].

use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::types::{GatewayError, Result};

/// One reference-count adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateCount {
    pub cid: Cid,
    pub recursive: bool,
}

/// A pinned CID and its reference count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedCid {
    pub cid: Cid,
    pub count: u64,
}

#[async_trait::async_trait]
pub trait PinIndex: Send + Sync {
    /// Add a reference, returning the new count
    async fn pin(&self, cid: &Cid, recursive: bool) -> Result<u64>;

    /// Drop a reference, returning the remaining count. Fails with
    /// `NotPinned` when there is nothing to drop.
    async fn unpin(&self, cid: &Cid, recursive: bool) -> Result<u64>;

    async fn count(&self, cid: &Cid, recursive: bool) -> Result<u64>;

    /// Apply every increment and decrement, or none of them
    async fn update_counts(&self, incs: &[UpdateCount], decs: &[UpdateCount]) -> Result<()>;

    /// Stream every pin of the given kind
    fn list(&self, recursive: bool) -> BoxStream<'static, Result<PinnedCid>>;
}

// =============================================================================
// In-memory index
// =============================================================================

/// In-process index for development mode and tests
#[derive(Debug, Default)]
pub struct MemoryPinIndex {
    counts: Arc<Mutex<HashMap<UpdateCount, u64>>>,
}

impl MemoryPinIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PinIndex for MemoryPinIndex {
    async fn pin(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        let mut counts = self.counts.lock().await;
        let count = counts
            .entry(UpdateCount {
                cid: *cid,
                recursive,
            })
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn unpin(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        let key = UpdateCount {
            cid: *cid,
            recursive,
        };
        let mut counts = self.counts.lock().await;
        let remaining = match counts.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return Err(GatewayError::NotPinned(cid.to_string())),
        };
        if remaining == 0 {
            counts.remove(&key);
        }
        Ok(remaining)
    }

    async fn count(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        let counts = self.counts.lock().await;
        Ok(counts
            .get(&UpdateCount {
                cid: *cid,
                recursive,
            })
            .copied()
            .unwrap_or(0))
    }

    async fn update_counts(&self, incs: &[UpdateCount], decs: &[UpdateCount]) -> Result<()> {
        let mut counts = self.counts.lock().await;

        // Decrements are checked against the counts after all increments
        let mut next = counts.clone();
        for u in incs {
            *next.entry(*u).or_insert(0) += 1;
        }
        for u in decs {
            match next.get_mut(u) {
                Some(count) if *count > 0 => *count -= 1,
                _ => return Err(GatewayError::NotPinned(u.cid.to_string())),
            }
        }
        next.retain(|_, count| *count > 0);

        debug!(incs = incs.len(), decs = decs.len(), "Updated pin counts");
        *counts = next;
        Ok(())
    }

    fn list(&self, recursive: bool) -> BoxStream<'static, Result<PinnedCid>> {
        let counts = Arc::clone(&self.counts);
        stream::once(async move {
            let counts = counts.lock().await;
            let mut pinned: Vec<PinnedCid> = counts
                .iter()
                .filter(|(key, _)| key.recursive == recursive)
                .map(|(key, count)| PinnedCid {
                    cid: key.cid,
                    count: *count,
                })
                .collect();
            pinned.sort_by_key(|p| p.cid.to_bytes());
            stream::iter(pinned.into_iter().map(Ok))
        })
        .flatten()
        .boxed()
    }
}

// =============================================================================
// Durable index
// =============================================================================

const KIND_DIRECT: u8 = 0;
const KIND_RECURSIVE: u8 = 1;

/// Index persisted in a sled tree.
///
/// Keys are a kind byte followed by the binary CID; values are big-endian
/// `u64` counts. Zero counts are removed.
#[derive(Clone)]
pub struct SledPinIndex {
    counts: sled::Tree,
}

impl SledPinIndex {
    /// Open or create the index at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let counts = db.open_tree("pin_counts")?;
        info!(path = %path.as_ref().display(), pins = counts.len(), "Opened pin index");
        Ok(Self { counts })
    }

    /// Apply per-key deltas in one transaction, then flush
    async fn apply(&self, deltas: BTreeMap<Vec<u8>, (Cid, i64)>) -> Result<BTreeMap<Vec<u8>, u64>> {
        let updated = self
            .counts
            .transaction(|tx| -> ConflictableTransactionResult<_, GatewayError> {
                let mut updated = BTreeMap::new();
                for (key, (cid, delta)) in &deltas {
                    let next = read_count(tx, key)?.checked_add_signed(*delta).ok_or_else(|| {
                        ConflictableTransactionError::Abort(GatewayError::NotPinned(cid.to_string()))
                    })?;
                    write_count(tx, key, next)?;
                    updated.insert(key.clone(), next);
                }
                Ok(updated)
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => GatewayError::from(e),
            })?;

        let tree = self.counts.clone();
        tokio::task::spawn_blocking(move || tree.flush())
            .await
            .map_err(|e| GatewayError::Index(format!("flush task failed: {e}")))??;
        Ok(updated)
    }

    async fn adjust(&self, cid: &Cid, recursive: bool, delta: i64) -> Result<u64> {
        let key = index_key(cid, recursive);
        let updated = self
            .apply(BTreeMap::from([(key.clone(), (*cid, delta))]))
            .await?;
        Ok(updated.get(&key).copied().unwrap_or(0))
    }
}

fn index_key(cid: &Cid, recursive: bool) -> Vec<u8> {
    let mut key = vec![if recursive { KIND_RECURSIVE } else { KIND_DIRECT }];
    key.extend_from_slice(&cid.to_bytes());
    key
}

fn decode_count(value: &[u8]) -> Result<u64> {
    <[u8; 8]>::try_from(value)
        .map(u64::from_be_bytes)
        .map_err(|_| GatewayError::Index(format!("corrupt count of {} bytes", value.len())))
}

fn read_count(tx: &TransactionalTree, key: &[u8]) -> ConflictableTransactionResult<u64, GatewayError> {
    match tx.get(key)? {
        Some(value) => decode_count(&value).map_err(ConflictableTransactionError::Abort),
        None => Ok(0),
    }
}

fn write_count(
    tx: &TransactionalTree,
    key: &[u8],
    count: u64,
) -> ConflictableTransactionResult<(), GatewayError> {
    if count == 0 {
        tx.remove(key)?;
    } else {
        tx.insert(key, count.to_be_bytes().to_vec())?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl PinIndex for SledPinIndex {
    async fn pin(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        self.adjust(cid, recursive, 1).await
    }

    async fn unpin(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        self.adjust(cid, recursive, -1).await
    }

    async fn count(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        match self.counts.get(index_key(cid, recursive))? {
            Some(value) => decode_count(&value),
            None => Ok(0),
        }
    }

    async fn update_counts(&self, incs: &[UpdateCount], decs: &[UpdateCount]) -> Result<()> {
        // Net delta per key: decrements are checked after all increments
        let mut deltas: BTreeMap<Vec<u8>, (Cid, i64)> = BTreeMap::new();
        for (updates, step) in [(incs, 1i64), (decs, -1i64)] {
            for u in updates {
                deltas
                    .entry(index_key(&u.cid, u.recursive))
                    .or_insert((u.cid, 0))
                    .1 += step;
            }
        }

        self.apply(deltas).await?;
        debug!(incs = incs.len(), decs = decs.len(), "Updated pin counts");
        Ok(())
    }

    fn list(&self, recursive: bool) -> BoxStream<'static, Result<PinnedCid>> {
        let kind = if recursive { KIND_RECURSIVE } else { KIND_DIRECT };
        stream::iter(self.counts.scan_prefix([kind]))
            .map(|entry| -> Result<PinnedCid> {
                let (key, value) = entry?;
                let cid = Cid::try_from(&key[1..])
                    .map_err(|e| GatewayError::Index(format!("corrupt key: {e}")))?;
                Ok(PinnedCid {
                    cid,
                    count: decode_count(&value)?,
                })
            })
            .boxed()
    }
}

/// Index selected by configuration: in memory for development, durable
/// otherwise. Either way calls are counted.
pub fn open_index(config: &GatewayConfig) -> Result<Arc<dyn PinIndex>> {
    let inner: Arc<dyn PinIndex> = if config.dev_mode {
        info!("Pin index is in-memory (development mode)");
        Arc::new(MemoryPinIndex::new())
    } else {
        Arc::new(SledPinIndex::open(&config.pin_index_path)?)
    };
    Ok(Arc::new(InstrumentedPinIndex::new(inner)))
}

// =============================================================================
// Instrumentation
// =============================================================================

/// Counts calls and errors of the wrapped index
pub struct InstrumentedPinIndex {
    inner: Arc<dyn PinIndex>,
}

impl InstrumentedPinIndex {
    pub fn new(inner: Arc<dyn PinIndex>) -> Self {
        Self { inner }
    }
}

fn observe<T>(calls: &'static str, errors: &'static str, result: Result<T>) -> Result<T> {
    metrics::counter!(calls).increment(1);
    if result.is_err() {
        metrics::counter!(errors).increment(1);
    }
    result
}

#[async_trait::async_trait]
impl PinIndex for InstrumentedPinIndex {
    async fn pin(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        observe(
            "rc_pinner_pin_call_total",
            "rc_pinner_pin_err_total",
            self.inner.pin(cid, recursive).await,
        )
    }

    async fn unpin(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        observe(
            "rc_pinner_unpin_call_total",
            "rc_pinner_unpin_err_total",
            self.inner.unpin(cid, recursive).await,
        )
    }

    async fn count(&self, cid: &Cid, recursive: bool) -> Result<u64> {
        observe(
            "rc_pinner_get_count_call_total",
            "rc_pinner_get_count_err_total",
            self.inner.count(cid, recursive).await,
        )
    }

    async fn update_counts(&self, incs: &[UpdateCount], decs: &[UpdateCount]) -> Result<()> {
        observe(
            "rc_pinner_update_counts_call_total",
            "rc_pinner_update_counts_err_total",
            self.inner.update_counts(incs, decs).await,
        )
    }

    fn list(&self, recursive: bool) -> BoxStream<'static, Result<PinnedCid>> {
        if recursive {
            metrics::counter!("rc_pinner_recursive_keys_call_total").increment(1);
        } else {
            metrics::counter!("rc_pinner_direct_keys_call_total").increment(1);
        }
        self.inner.list(recursive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::MemoryDagStore;

    fn cids(n: usize) -> Vec<Cid> {
        let store = MemoryDagStore::new();
        (0..n)
            .map(|i| store.put_leaf(format!("block {i}").as_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_pin_unpin_counts() {
        let index = MemoryPinIndex::new();
        let c = cids(1)[0];

        assert_eq!(index.pin(&c, true).await.unwrap(), 1);
        assert_eq!(index.pin(&c, true).await.unwrap(), 2);
        assert_eq!(index.count(&c, true).await.unwrap(), 2);
        assert_eq!(index.count(&c, false).await.unwrap(), 0);

        assert_eq!(index.unpin(&c, true).await.unwrap(), 1);
        assert_eq!(index.unpin(&c, true).await.unwrap(), 0);
        assert!(matches!(
            index.unpin(&c, true).await,
            Err(GatewayError::NotPinned(_))
        ));
    }

    #[tokio::test]
    async fn test_update_counts_is_all_or_nothing() {
        let index = MemoryPinIndex::new();
        let c = cids(3);
        index.pin(&c[0], true).await.unwrap();

        let incs = [UpdateCount { cid: c[1], recursive: true }];
        let decs = [
            UpdateCount { cid: c[0], recursive: true },
            UpdateCount { cid: c[2], recursive: false },
        ];
        assert!(index.update_counts(&incs, &decs).await.is_err());
        assert_eq!(index.count(&c[0], true).await.unwrap(), 1);
        assert_eq!(index.count(&c[1], true).await.unwrap(), 0);

        index.update_counts(&incs, &decs[..1]).await.unwrap();
        assert_eq!(index.count(&c[0], true).await.unwrap(), 0);
        assert_eq!(index.count(&c[1], true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_kind() {
        let index = InstrumentedPinIndex::new(Arc::new(MemoryPinIndex::new()));
        let c = cids(3);
        index.pin(&c[0], true).await.unwrap();
        index.pin(&c[1], true).await.unwrap();
        index.pin(&c[1], true).await.unwrap();
        index.pin(&c[2], false).await.unwrap();

        let recursive: Vec<PinnedCid> = index
            .list(true)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(recursive.len(), 2);
        assert_eq!(recursive.iter().map(|p| p.count).sum::<u64>(), 3);

        let direct: Vec<_> = index.list(false).collect().await;
        assert_eq!(direct.len(), 1);
    }

    #[tokio::test]
    async fn test_sled_counts_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pins.sled");
        let c = cids(2);

        {
            let index = SledPinIndex::open(&path).unwrap();
            assert_eq!(index.pin(&c[0], true).await.unwrap(), 1);
            assert_eq!(index.pin(&c[0], true).await.unwrap(), 2);
            assert_eq!(index.pin(&c[1], false).await.unwrap(), 1);
            assert_eq!(index.unpin(&c[1], false).await.unwrap(), 0);
            assert!(matches!(
                index.unpin(&c[1], false).await,
                Err(GatewayError::NotPinned(_))
            ));
        }

        let index = SledPinIndex::open(&path).unwrap();
        assert_eq!(index.count(&c[0], true).await.unwrap(), 2);
        assert_eq!(index.count(&c[0], false).await.unwrap(), 0);
        assert_eq!(index.count(&c[1], false).await.unwrap(), 0);

        let recursive: Vec<PinnedCid> = index.list(true).map(|r| r.unwrap()).collect().await;
        assert_eq!(recursive, vec![PinnedCid { cid: c[0], count: 2 }]);
        assert!(index.list(false).collect::<Vec<_>>().await.is_empty());
    }

    #[tokio::test]
    async fn test_sled_update_counts_is_all_or_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = SledPinIndex::open(dir.path().join("pins.sled")).unwrap();
        let c = cids(3);
        index.pin(&c[0], true).await.unwrap();

        let incs = [UpdateCount { cid: c[1], recursive: true }];
        let decs = [
            UpdateCount { cid: c[0], recursive: true },
            UpdateCount { cid: c[2], recursive: false },
        ];
        assert!(matches!(
            index.update_counts(&incs, &decs).await,
            Err(GatewayError::NotPinned(_))
        ));
        assert_eq!(index.count(&c[0], true).await.unwrap(), 1);
        assert_eq!(index.count(&c[1], true).await.unwrap(), 0);

        index.update_counts(&incs, &decs[..1]).await.unwrap();
        assert_eq!(index.count(&c[0], true).await.unwrap(), 0);
        assert_eq!(index.count(&c[1], true).await.unwrap(), 1);
    }

    #[test]
    fn test_open_index_follows_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = GatewayConfig::default();
        config.pin_index_path = dir.path().join("pins.sled");

        config.dev_mode = true;
        open_index(&config).unwrap();
        assert!(!config.pin_index_path.exists());

        config.dev_mode = false;
        open_index(&config).unwrap();
        assert!(config.pin_index_path.exists());
    }
}
