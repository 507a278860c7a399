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

#![deny(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Forestctl
//!
//! This is the control plane of the Forest overlay network. Forest routers
//! forward packets on *comtrees*: named, provisioned multicast trees that are
//! overlaid on the physical router graph and identified by a 32-bit comtree
//! number. The controllers in this crate boot and configure routers when they
//! come online, admit leaf nodes (clients and controllers) into the network,
//! and grow, shrink and tear down comtrees on demand while maintaining
//! bandwidth reservations on every underlay link that carries comtree traffic.
//!
//! The crate does not implement the data plane, nor the byte-level packet
//! codec; routers enforce the rates that this control plane negotiates with
//! them. Socket I/O is hidden behind the [`substrate::Transport`] trait so
//! that the whole protocol machinery can be exercised against a scripted
//! peer.
//!
//! ## Main concepts
//!
//! The [`topology::Topology`] holds the underlay: routers, leaves, links and
//! their rate capacities. The [`comtree::ComtreeSet`] holds every comtree and
//! implements path finding and rate provisioning over the topology. The
//! [`substrate::Substrate`] runs the I/O loop and the worker pool, matching
//! replies to the workers that sent the requests. The
//! [`controller::Controller`] dispatches incoming control messages to
//! handlers which mutate the comtree state and reconfigure routers through
//! the [`proto::handler::CfgHandler`] transaction layer.
//!
//! ## Example usage
//!
//! The following example builds a three-router line topology, defines a
//! comtree rooted at the first router, and provisions it.
//!
//! ```
//! use forestctl::prelude::*;
//!
//! fn main() -> Result<(), ControlError> {
//!     let mut topo = Topology::new();
//!
//!     let r1 = topo.add_router("r1", ForestAddr::new(1, 1))?;
//!     let r2 = topo.add_router("r2", ForestAddr::new(1, 2))?;
//!     let r3 = topo.add_router("r3", ForestAddr::new(1, 3))?;
//!
//!     let caps = RateSpec::new(100, 100, 100, 100);
//!     topo.add_link(r1, r2, 1, caps)?;
//!     topo.add_link(r2, r3, 1, caps)?;
//!
//!     let mut comts = ComtreeSet::new();
//!     let ctx = comts.add_comtree(1001)?;
//!     comts.set_owner(ctx, ForestAddr::new(1, 500));
//!     comts.set_root(ctx, topo.node_addr(r1));
//!     comts.set_config_mode(ctx, ConfigMode::Auto);
//!     comts.add_node(ctx, topo.node_addr(r1), &topo)?;
//!     comts.add_core_node(ctx, topo.node_addr(r1), &topo)?;
//!
//!     assert!(comts.check(&topo));
//!     Ok(())
//! }
//! ```

pub mod comtree;
pub mod controller;
pub mod prefix;
pub mod proto;
pub mod substrate;
pub mod topology;
pub mod types;

#[cfg(test)]
mod test;

pub use types::{
    ComtreeError, ComtreeNum, ControlError, ForestAddr, LinkId, NetError, NodeId, NodeStatus,
    NodeType, ProtoError, RateDelta, RateSpec,
};

/// Re-exports of the types needed for most uses of this crate.
pub mod prelude {
    pub use crate::comtree::{ComtreeSet, ComtreeTable, ConfigMode, Ctx};
    pub use crate::controller::Controller;
    pub use crate::prefix::PrefixTable;
    pub use crate::proto::{CtlMode, CtlMsg, CtlMsgType, Packet, PacketType};
    pub use crate::substrate::{Substrate, Transport};
    pub use crate::topology::{NetView, Topology};
    pub use crate::types::{
        ComtreeError, ComtreeNum, ControlError, ForestAddr, LinkId, NetError, NodeId, NodeStatus,
        NodeType, ProtoError, RateDelta, RateSpec,
    };
}
