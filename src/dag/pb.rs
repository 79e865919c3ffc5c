//! dag-pb node codec
//!
//! `PBNode`/`PBLink` messages derived with prost. Size accounting only reads
//! the link hashes; encoding exists for building in-memory DAGs.

use bytes::Buf;
use cid::Cid;
use prost::Message;

use crate::types::{GatewayError, Result};

/// Multicodec code for dag-pb
pub const DAG_PB: u64 = 0x70;

/// Multicodec code for raw leaves
pub const RAW: u64 = 0x55;

#[derive(Clone, PartialEq, Message)]
pub struct PbLink {
    /// Binary CID of the target
    #[prost(bytes = "vec", optional, tag = "1")]
    pub hash: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    /// Cumulative size of the target
    #[prost(uint64, optional, tag = "3")]
    pub tsize: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbNode {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub links: Vec<PbLink>,
}

fn malformed(what: impl std::fmt::Display) -> GatewayError {
    GatewayError::Traversal(format!("malformed dag-pb node: {what}"))
}

/// Extract the link targets of a dag-pb block, in order
pub fn decode_links(raw: impl Buf) -> Result<Vec<Cid>> {
    let node = PbNode::decode(raw).map_err(malformed)?;
    node.links
        .into_iter()
        .map(|link| {
            let hash = link.hash.ok_or_else(|| malformed("link without hash"))?;
            Cid::try_from(hash.as_slice()).map_err(|e| malformed(format!("bad link hash: {e}")))
        })
        .collect()
}

/// Encode a dag-pb node with unnamed links
pub fn encode_node(links: &[Cid], data: &[u8]) -> Vec<u8> {
    let node = PbNode {
        data: (!data.is_empty()).then(|| data.to_vec()),
        links: links
            .iter()
            .map(|cid| PbLink {
                hash: Some(cid.to_bytes()),
                ..Default::default()
            })
            .collect(),
    };
    node.encode_to_vec()
}
