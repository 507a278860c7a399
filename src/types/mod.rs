// Forestctl: control plane for the Forest overlay network
// Copyright 2022-2024 The forestctl developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Module containing all type definitions

use petgraph::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod rate;
pub use rate::{RateDelta, RateSpec};

pub(crate) type IndexType = u32;
/// Node identification (and index into the underlay graph)
pub type NodeId = NodeIndex<IndexType>;
/// Link identification (and edge index in the underlay graph)
pub type LinkId = EdgeIndex<IndexType>;
/// Comtree number, the wire-visible identifier of a comtree.
pub type ComtreeNum = u32;

/// A Forest address: the high half is a *zip code*, the low half identifies a
/// node within that zip. Address `0` means "unassigned".
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ForestAddr(pub u32);

impl ForestAddr {
    /// Build an address from a zip code and a local part.
    pub const fn new(zip: u16, local: u16) -> Self {
        ForestAddr(((zip as u32) << 16) | local as u32)
    }

    /// The zip code (high half) of this address.
    pub const fn zip(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The local part (low half) of this address.
    pub const fn local(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Returns `true` if this is the unassigned address.
    pub const fn is_unassigned(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ForestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.zip(), self.local())
    }
}

impl std::fmt::Debug for ForestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.zip(), self.local())
    }
}

impl std::str::FromStr for ForestAddr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (zip, local) = s
            .split_once('.')
            .ok_or_else(|| NetError::InvalidAddr(s.to_string()))?;
        let zip: u16 = zip
            .parse()
            .map_err(|_| NetError::InvalidAddr(s.to_string()))?;
        let local: u16 = local
            .parse()
            .map_err(|_| NetError::InvalidAddr(s.to_string()))?;
        Ok(ForestAddr::new(zip, local))
    }
}

impl From<u32> for ForestAddr {
    fn from(x: u32) -> Self {
        ForestAddr(x)
    }
}

/// The kind of a node in the underlay.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum NodeType {
    /// A Forest router.
    Router,
    /// A client leaf.
    Client,
    /// A controller leaf (network manager, comtree controller, client manager).
    Controller,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Router => f.write_str("router"),
            NodeType::Client => f.write_str("client"),
            NodeType::Controller => f.write_str("controller"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "router" => Ok(NodeType::Router),
            "client" => Ok(NodeType::Client),
            "controller" => Ok(NodeType::Controller),
            _ => Err(NetError::InvalidNodeType(s.to_string())),
        }
    }
}

/// The lifecycle status of a router or leaf.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum NodeStatus {
    /// The node has not contacted the control plane yet.
    #[default]
    Down,
    /// The node is being configured.
    Booting,
    /// The node is fully configured and connected.
    Up,
}

/// Topology errors
#[derive(Error, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetError {
    /// Node is not present in the topology
    #[error("node was not found in topology: {0:?}")]
    NodeNotFound(NodeId),
    /// Node name is not present in the topology
    #[error("node name was not found in topology: {0}")]
    NameNotFound(String),
    /// No node carries the given forest address
    #[error("no node with forest address {0}")]
    AddrNotFound(ForestAddr),
    /// The link number does not name a link
    #[error("link does not exist: {0:?}")]
    LinkNotFound(LinkId),
    /// The two nodes are not connected
    #[error("nodes not connected: {0:?} -- {1:?}")]
    NodesNotConnected(NodeId, NodeId),
    /// Node must be a router
    #[error("node is not a router: {0:?}")]
    NotARouter(NodeId),
    /// Node must be a leaf
    #[error("node is not a leaf: {0:?}")]
    NotALeaf(NodeId),
    /// The interface number is not valid at this router
    #[error("router {router:?} has no interface {iface}")]
    InvalidInterface {
        /// the router in question
        router: NodeId,
        /// the offending interface number
        iface: u32,
    },
    /// A node with this name already exists
    #[error("duplicate node name: {0}")]
    DuplicateName(String),
    /// A node with this forest address already exists
    #[error("duplicate forest address: {0}")]
    DuplicateAddr(ForestAddr),
    /// A leaf may have only one link
    #[error("leaf {0:?} already has an access link")]
    LeafAlreadyLinked(NodeId),
    /// Could not parse a forest address
    #[error("invalid forest address: {0}")]
    InvalidAddr(String),
    /// Could not parse a node type keyword
    #[error("invalid node type: {0}")]
    InvalidNodeType(String),
}

/// Comtree errors
#[derive(Error, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComtreeError {
    /// The comtree number does not name a comtree
    #[error("unknown comtree {0}")]
    UnknownComtree(ComtreeNum),
    /// A comtree with this number already exists
    #[error("comtree {0} already exists")]
    ComtreeExists(ComtreeNum),
    /// The comtree number space is exhausted
    #[error("no comtrees available")]
    NoFreeComtree,
    /// The address does not name a router of this comtree
    #[error("{0} is not a router in the comtree")]
    NotAComtreeRouter(ForestAddr),
    /// The address does not name a node of this comtree
    #[error("{0} is not a node in the comtree")]
    NotAComtreeNode(ForestAddr),
    /// A router with comtree children cannot be removed
    #[error("comtree router {0} still has incident comtree links")]
    HasChildren(ForestAddr),
    /// No path with sufficient capacity exists
    #[error("cannot find path to comtree")]
    NoPath,
    /// A link lacks the capacity for the requested rates
    #[error("insufficient capacity on link {0:?}")]
    InsufficientCapacity(LinkId),
    /// A parent-link walk exceeded the cycle guard
    #[error("excessively long path in comtree {0}, probably a cycle")]
    PathTooLong(ComtreeNum),
    /// Topology error while manipulating a comtree
    #[error("topology error: {0}")]
    Net(#[from] NetError),
}

/// Configuration-protocol errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// A required attribute is missing from a control message
    #[error("required attribute is missing: {0}")]
    MissingAttribute(&'static str),
    /// The peer never replied (3 retries failed)
    #[error("no response from target")]
    NoResponse,
    /// The peer sent a negative reply
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Top-level control-plane errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// Topology error
    #[error("topology error: {0}")]
    Net(#[from] NetError),
    /// Comtree error
    #[error("comtree error: {0}")]
    Comtree(#[from] ComtreeError),
    /// Protocol error
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
    /// Json error
    #[error("{0}")]
    JsonError(String),
}

impl From<serde_json::Error> for ControlError {
    fn from(value: serde_json::Error) -> Self {
        Self::JsonError(value.to_string())
    }
}

/// Convenience trait to get an option into an error
pub trait NetErrorOption<T> {
    /// Transform `None` into `Err(NetError::NodeNotFound)`
    fn or_node_not_found(self, node: NodeId) -> Result<T, NetError>;

    /// Transform `None` into `Err(NetError::LinkNotFound)`
    fn or_link_not_found(self, link: LinkId) -> Result<T, NetError>;

    /// Transform `None` into `Err(NetError::AddrNotFound)`
    fn or_addr_not_found(self, addr: ForestAddr) -> Result<T, NetError>;
}

impl<T> NetErrorOption<T> for Option<T> {
    fn or_node_not_found(self, node: NodeId) -> Result<T, NetError> {
        self.ok_or(NetError::NodeNotFound(node))
    }

    fn or_link_not_found(self, link: LinkId) -> Result<T, NetError> {
        self.ok_or(NetError::LinkNotFound(link))
    }

    fn or_addr_not_found(self, addr: ForestAddr) -> Result<T, NetError> {
        self.ok_or(NetError::AddrNotFound(addr))
    }
}
