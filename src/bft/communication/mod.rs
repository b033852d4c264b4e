//! Communication primitives for `tessera`: process identity, the static
//! peer table, view bookkeeping, and the outbound transport seam.

pub mod message;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::bft::crypto::signature::PublicKey;
use crate::bft::error::*;
use crate::bft::ordering::ViewId;

/// A `NodeId` represents the id of a process in the BFT system.
///
/// Ids are the stable strings of the node table; cloning is cheap.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(Arc::from(id))
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(Arc::from(id))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Static information about one replica of the system.
pub struct NodeInfo {
    /// The id of the node, unique in the node table.
    pub id: NodeId,
    /// Transport address, `host:port`. Only the transport interprets it.
    pub addr: String,
    /// The node's public verification key.
    pub public_key: PublicKey,
}

/// The parameters of the BFT system: the total number of replicas, and
/// how many of those are allowed to fail.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SystemParams {
    n: usize,
    f: usize,
}

impl SystemParams {
    pub fn new(n: usize) -> Result<Self> {
        let f = (n.saturating_sub(1)) / 3;
        if n < 3 * f + 1 || f == 0 {
            return Err(Error::Bootstrap(format!(
                "invalid number of replicas: {}",
                n
            )));
        }
        Ok(SystemParams { n, f })
    }

    /// The `n` parameter of the BFT system.
    pub fn n(&self) -> usize {
        self.n
    }

    /// The `f` parameter of the BFT system.
    pub fn f(&self) -> usize {
        self.f
    }

    /// Matching prepares needed to reach `PREPARED`, the pre-prepare
    /// counting on top.
    pub fn prepare_quorum(&self) -> usize {
        2 * self.f
    }

    /// Matching commits, self inclusive, needed to reach `COMMITTED`.
    /// Also the checkpoint and view-change certificate size.
    pub fn commit_quorum(&self) -> usize {
        2 * self.f + 1
    }
}

/// The fixed membership of the system.
///
/// Ordering matters: the primary of view `v` is the node at index
/// `v mod n`.
pub struct NodeTable {
    nodes: Vec<NodeInfo>,
}

impl NodeTable {
    pub fn new(nodes: Vec<NodeInfo>) -> Result<Self> {
        SystemParams::new(nodes.len())?;
        for (i, a) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|b| b.id == a.id) {
                return Err(Error::Bootstrap(format!("duplicate node id: {}", a.id)));
            }
        }
        Ok(NodeTable { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn params(&self) -> SystemParams {
        // validated in `new`
        SystemParams {
            n: self.nodes.len(),
            f: (self.nodes.len() - 1) / 3,
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// The replica that proposes within the given view.
    pub fn primary(&self, view: ViewId) -> &NodeInfo {
        let index = (u64::from(view) as usize) % self.nodes.len();
        &self.nodes[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }
}

/// A view of the system: the epoch number plus the derived parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ViewInfo {
    id: ViewId,
    params: SystemParams,
}

impl ViewInfo {
    pub fn new(id: ViewId, params: SystemParams) -> Self {
        ViewInfo { id, params }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn params(&self) -> SystemParams {
        self.params
    }
}

/// Outbound delivery of signed envelopes to one peer.
///
/// Implementations live with the embedding application (e.g. the
/// WebSocket adapter); the core only ever hands them opaque bytes. A
/// failed send is reported on the error channel and not retried here.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: &NodeInfo, payload: Vec<u8>) -> BoxFuture<'static, Result<()>>;
}
