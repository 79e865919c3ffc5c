//! Extended pin API
//!
//! Pin add and rm are forwarded to the storage node and answered with DAG
//! size statistics; reference counts live in a [`PinIndex`]. The handlers
//! fold the statistics into the request's aggregate so the usage monitor
//! can bill the content size.

pub mod handlers;
pub mod index;

use cid::Cid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::auth::signature::url_query_pairs;
use crate::dag::{parse_cid, DagStats};
use crate::types::{GatewayError, Result};

pub use handlers::PinHandlers;
pub use index::{
    open_index, InstrumentedPinIndex, MemoryPinIndex, PinIndex, PinnedCid, SledPinIndex,
    UpdateCount,
};

/// Entries per `pin/ls` line
pub const PIN_LIST_BATCH: usize = 100;

// =============================================================================
// Parameters
// =============================================================================

/// Parse the `recursive` flag; only `1`, `true`, `0` and `false` are valid
pub fn parse_recursive(value: Option<&str>) -> Result<bool> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("1") | Some("true") => Ok(true),
        Some("0") | Some("false") => Ok(false),
        _ => Err(GatewayError::BadRequest(
            "invalid value for recursive flag".to_string(),
        )),
    }
}

/// `arg` and `recursive` of a pin request
pub fn parse_pin_params(query: Option<&str>) -> Result<(Cid, bool)> {
    let pairs = url_query_pairs(query);
    let value = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    let cid = parse_cid(value("arg").unwrap_or_default())
        .map_err(|_| GatewayError::BadRequest("invalid CID".to_string()))?;
    let recursive = parse_recursive(value("recursive"))?;
    Ok((cid, recursive))
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinAddResult {
    pub success: bool,
    pub in_progress: bool,
    pub processed_num_blocks: u64,
    #[serde(rename = "duplicated_size")]
    pub deduplicated_size: i64,
    #[serde(rename = "duplicated_num_blocks")]
    pub deduplicated_num_blocks: i64,
    pub total_size: i64,
    pub total_num_blocks: i64,
    pub message: String,
}

impl PinAddResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn in_progress(processed: u64) -> Self {
        Self {
            in_progress: true,
            processed_num_blocks: processed,
            ..Default::default()
        }
    }

    pub fn completed(processed: u64, stats: &DagStats) -> Self {
        let s = stats.snapshot();
        Self {
            success: true,
            in_progress: false,
            processed_num_blocks: processed,
            deduplicated_size: s.deduplicated_size,
            deduplicated_num_blocks: s.deduplicated_num_blocks,
            total_size: s.total_size,
            total_num_blocks: s.total_num_blocks,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRmResult {
    pub success: bool,
    #[serde(rename = "duplicated_size")]
    pub deduplicated_size: i64,
    #[serde(rename = "duplicated_num_blocks")]
    pub deduplicated_num_blocks: i64,
    pub total_size: i64,
    pub total_num_blocks: i64,
    pub message: String,
}

impl PinRmResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn completed(stats: &DagStats) -> Self {
        let s = stats.snapshot();
        Self {
            success: true,
            deduplicated_size: s.deduplicated_size,
            deduplicated_num_blocks: s.deduplicated_num_blocks,
            total_size: s.total_size,
            total_num_blocks: s.total_num_blocks,
            message: String::new(),
        }
    }
}

/// One entry of a children update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildUpdate {
    #[serde(rename = "c")]
    pub cid: String,
    #[serde(rename = "r")]
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildrenUpdateRequest {
    pub root: String,
    #[serde(default)]
    pub incs: Vec<ChildUpdate>,
    #[serde(default)]
    pub decs: Vec<ChildUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildrenUpdateResult {
    pub success: bool,
    pub message: String,
    /// Total size per updated CID
    pub sizes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidCount {
    #[serde(rename = "c")]
    pub cid: String,
    #[serde(rename = "v")]
    pub count: u64,
}

impl From<PinnedCid> for CidCount {
    fn from(p: PinnedCid) -> Self {
        Self {
            cid: p.cid.to_string(),
            count: p.count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinListResult {
    pub success: bool,
    pub in_progress: bool,
    pub batch: Vec<CidCount>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedCountResult {
    pub success: bool,
    pub count: u64,
    pub message: String,
}
