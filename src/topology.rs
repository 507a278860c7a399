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

//! # The underlay topology
//!
//! This module holds the global view of the Forest network: an undirected
//! graph of routers and leaves whose edges are physical links. Every link
//! carries its nominal capacity and the capacity still available after all
//! comtree reservations; every router owns a numbered set of interfaces,
//! each responsible for a contiguous range of local link numbers.
//!
//! The controller exclusively owns this structure. Routers keep their own
//! tables and are only updated through configuration requests.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use log::*;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::Undirected;
use serde::{Deserialize, Serialize};

use crate::comtree::{ComtreeSet, ComtreeTable};
use crate::types::{
    ForestAddr, IndexType, LinkId, NetError, NetErrorOption, NodeId, NodeStatus, NodeType, RateSpec,
};

pub mod parser;

/// A physical link of the underlay.
///
/// The two endpoints are arbitrarily designated "left" and "right"; the `up`
/// direction of the rate specs is from the left endpoint. Each router
/// endpoint refers to the link by its own local link number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link length in kilometers; the cost used by path search.
    pub length: u32,
    /// Nominal capacity.
    pub rates: RateSpec,
    /// Capacity minus the sum of all comtree reservations.
    pub avail: RateSpec,
    /// Local link number at the left endpoint (0 if the endpoint is a leaf).
    pub left_llnum: u32,
    /// Local link number at the right endpoint (0 if the endpoint is a leaf).
    pub right_llnum: u32,
    /// One-time cookie used to authenticate the connecting endpoint.
    pub nonce: u64,
}

/// One interface of a router: an IP endpoint owning a contiguous range of
/// local link numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// IP address of the forest interface.
    pub ip: Ipv4Addr,
    /// UDP port of the interface; learned from the router while booting.
    pub port: u16,
    /// First local link number assigned to this interface.
    pub first_link: u32,
    /// Last local link number assigned to this interface.
    pub last_link: u32,
    /// Input (up) and output (down) rate capacity of the interface.
    pub rates: RateSpec,
}

/// Per-router attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterInfo {
    name: String,
    addr: ForestAddr,
    location: (f64, f64),
    leaf_range: (ForestAddr, ForestAddr),
    status: NodeStatus,
    ifaces: Vec<Interface>,
}

impl RouterInfo {
    /// The first and last leaf address this router may assign.
    pub fn leaf_range(&self) -> (ForestAddr, ForestAddr) {
        self.leaf_range
    }
}

/// Per-leaf attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafInfo {
    name: String,
    ntype: NodeType,
    ip: Ipv4Addr,
    addr: ForestAddr,
    location: (f64, f64),
    status: NodeStatus,
}

type UnderlayGraph = StableGraph<(), Link, Undirected, IndexType>;

/// # The network topology
///
/// The struct contains all information about the underlying physical network:
/// the graph of routers and leaves, per-link capacities and reservations,
/// per-router interfaces and leaf-address ranges, and the lifecycle status of
/// every node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Topology {
    graph: UnderlayGraph,
    routers: HashMap<NodeId, RouterInfo>,
    leaves: HashMap<NodeId, LeafInfo>,
    name_map: HashMap<String, NodeId>,
    addr_map: HashMap<ForestAddr, NodeId>,
    loc_map: HashMap<(NodeId, u32), LinkId>,
    default_leaf_rates: RateSpec,
}

impl Topology {
    /// Generate an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    // ********************
    // * Nodes            *
    // ********************

    /// Add a new router. Returns the node id used to reference it.
    pub fn add_router<S: Into<String>>(
        &mut self,
        name: S,
        addr: ForestAddr,
    ) -> Result<NodeId, NetError> {
        let name = name.into();
        self.check_fresh(&name, addr)?;
        let id = self.graph.add_node(());
        self.name_map.insert(name.clone(), id);
        self.addr_map.insert(addr, id);
        self.routers.insert(
            id,
            RouterInfo {
                name,
                addr,
                location: (0.0, 0.0),
                leaf_range: (ForestAddr::default(), ForestAddr::default()),
                status: NodeStatus::Down,
                ifaces: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Add a new leaf (client or controller).
    pub fn add_leaf<S: Into<String>>(
        &mut self,
        name: S,
        ntype: NodeType,
        ip: Ipv4Addr,
        addr: ForestAddr,
    ) -> Result<NodeId, NetError> {
        let name = name.into();
        self.check_fresh(&name, addr)?;
        let id = self.graph.add_node(());
        self.name_map.insert(name.clone(), id);
        self.addr_map.insert(addr, id);
        self.leaves.insert(
            id,
            LeafInfo {
                name,
                ntype,
                ip,
                addr,
                location: (0.0, 0.0),
                status: NodeStatus::Down,
            },
        );
        Ok(id)
    }

    fn check_fresh(&self, name: &str, addr: ForestAddr) -> Result<(), NetError> {
        if self.name_map.contains_key(name) {
            return Err(NetError::DuplicateName(name.to_string()));
        }
        if self.addr_map.contains_key(&addr) {
            return Err(NetError::DuplicateAddr(addr));
        }
        Ok(())
    }

    /// Returns `true` if the node is a router.
    pub fn is_router(&self, n: NodeId) -> bool {
        self.routers.contains_key(&n)
    }

    /// Returns `true` if the node is a leaf.
    pub fn is_leaf(&self, n: NodeId) -> bool {
        self.leaves.contains_key(&n)
    }

    /// Returns `true` if the node is a controller leaf.
    pub fn is_controller(&self, n: NodeId) -> bool {
        matches!(
            self.leaves.get(&n),
            Some(LeafInfo {
                ntype: NodeType::Controller,
                ..
            })
        )
    }

    /// The type of a node, if it exists.
    pub fn node_type(&self, n: NodeId) -> Option<NodeType> {
        if self.is_router(n) {
            Some(NodeType::Router)
        } else {
            self.leaves.get(&n).map(|l| l.ntype)
        }
    }

    /// The forest address of a node, or the unassigned address if the node
    /// does not exist.
    pub fn node_addr(&self, n: NodeId) -> ForestAddr {
        if let Some(r) = self.routers.get(&n) {
            r.addr
        } else if let Some(l) = self.leaves.get(&n) {
            l.addr
        } else {
            ForestAddr::default()
        }
    }

    /// The name of a node, or `"?"` if the node does not exist.
    pub fn node_name(&self, n: NodeId) -> &str {
        if let Some(r) = self.routers.get(&n) {
            &r.name
        } else if let Some(l) = self.leaves.get(&n) {
            &l.name
        } else {
            "?"
        }
    }

    /// Get the node with the given name.
    pub fn node_by_name(&self, name: impl AsRef<str>) -> Result<NodeId, NetError> {
        self.name_map
            .get(name.as_ref())
            .copied()
            .ok_or_else(|| NetError::NameNotFound(name.as_ref().to_string()))
    }

    /// Get the node carrying the given forest address.
    pub fn node_by_addr(&self, addr: ForestAddr) -> Option<NodeId> {
        self.addr_map.get(&addr).copied()
    }

    /// The lifecycle status of a node (`Down` for unknown nodes).
    pub fn status(&self, n: NodeId) -> NodeStatus {
        if let Some(r) = self.routers.get(&n) {
            r.status
        } else if let Some(l) = self.leaves.get(&n) {
            l.status
        } else {
            NodeStatus::Down
        }
    }

    /// Set the lifecycle status of a node.
    pub fn set_status(&mut self, n: NodeId, status: NodeStatus) {
        if let Some(r) = self.routers.get_mut(&n) {
            r.status = status;
        } else if let Some(l) = self.leaves.get_mut(&n) {
            l.status = status;
        }
    }

    /// Set the location of a node.
    pub fn set_location(&mut self, n: NodeId, location: (f64, f64)) {
        if let Some(r) = self.routers.get_mut(&n) {
            r.location = location;
        } else if let Some(l) = self.leaves.get_mut(&n) {
            l.location = location;
        }
    }

    /// The location of a node.
    pub fn location(&self, n: NodeId) -> (f64, f64) {
        if let Some(r) = self.routers.get(&n) {
            r.location
        } else if let Some(l) = self.leaves.get(&n) {
            l.location
        } else {
            (0.0, 0.0)
        }
    }

    /// The IP address of a leaf node.
    pub fn leaf_ip(&self, n: NodeId) -> Option<Ipv4Addr> {
        self.leaves.get(&n).map(|l| l.ip)
    }

    /// Iterate over all router ids.
    pub fn routers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.routers.keys().copied()
    }

    /// The number of routers in the topology.
    pub fn num_routers(&self) -> usize {
        self.routers.len()
    }

    /// Iterate over all leaf ids.
    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.leaves.keys().copied()
    }

    /// Iterate over all controller leaves.
    pub fn controllers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.leaves
            .iter()
            .filter(|(_, l)| l.ntype == NodeType::Controller)
            .map(|(n, _)| *n)
    }

    // ********************
    // * Routers          *
    // ********************

    /// The range of leaf addresses assignable by a router.
    pub fn leaf_range(&self, r: NodeId) -> Result<(ForestAddr, ForestAddr), NetError> {
        self.routers
            .get(&r)
            .map(|ri| ri.leaf_range)
            .ok_or(NetError::NotARouter(r))
    }

    /// Set the range of leaf addresses assignable by a router.
    pub fn set_leaf_range(
        &mut self,
        r: NodeId,
        range: (ForestAddr, ForestAddr),
    ) -> Result<(), NetError> {
        self.routers
            .get_mut(&r)
            .map(|ri| ri.leaf_range = range)
            .ok_or(NetError::NotARouter(r))
    }

    /// Find the access router whose leaf range contains the given address.
    pub fn router_for_leaf_addr(&self, addr: ForestAddr) -> Option<NodeId> {
        self.routers
            .iter()
            .find(|(_, ri)| ri.leaf_range.0 <= addr && addr <= ri.leaf_range.1)
            .map(|(n, _)| *n)
    }

    /// Replace the interface table of a router. Interface numbers start at 1.
    pub fn set_interfaces(&mut self, r: NodeId, ifaces: Vec<Interface>) -> Result<(), NetError> {
        self.routers
            .get_mut(&r)
            .map(|ri| ri.ifaces = ifaces)
            .ok_or(NetError::NotARouter(r))
    }

    /// The number of interfaces defined for a router.
    pub fn num_ifaces(&self, r: NodeId) -> u32 {
        self.routers.get(&r).map(|ri| ri.ifaces.len()).unwrap_or(0) as u32
    }

    /// Check whether the interface number is valid at this router.
    /// Interface slots left unconfigured by the topology file do not count.
    pub fn valid_iface(&self, r: NodeId, iface: u32) -> bool {
        matches!(self.iface(r, iface), Some(ifc) if ifc.ip != std::net::Ipv4Addr::UNSPECIFIED)
    }

    /// Access an interface of a router. Interface numbers start at 1.
    pub fn iface(&self, r: NodeId, iface: u32) -> Option<&Interface> {
        self.routers
            .get(&r)
            .and_then(|ri| ri.ifaces.get(iface.checked_sub(1)? as usize))
    }

    /// Mutable access to an interface of a router.
    pub fn iface_mut(&mut self, r: NodeId, iface: u32) -> Option<&mut Interface> {
        self.routers
            .get_mut(&r)
            .and_then(|ri| ri.ifaces.get_mut(iface.checked_sub(1)? as usize))
    }

    /// The interface of a router that owns the given local link number.
    pub fn iface_for_llnum(&self, r: NodeId, llnum: u32) -> Option<u32> {
        let ri = self.routers.get(&r)?;
        ri.ifaces
            .iter()
            .position(|i| i.first_link <= llnum && llnum <= i.last_link)
            .map(|i| i as u32 + 1)
    }

    /// The first valid interface of a router.
    pub fn first_iface(&self, r: NodeId) -> Option<u32> {
        (1..=self.num_ifaces(r)).find(|i| self.valid_iface(r, *i))
    }

    // ********************
    // * Links            *
    // ********************

    /// Create a link between two nodes. At most one endpoint may be a leaf,
    /// and a leaf gets exactly one access link. The available rates start out
    /// equal to the capacity.
    pub fn add_link(
        &mut self,
        a: NodeId,
        b: NodeId,
        length: u32,
        rates: RateSpec,
    ) -> Result<LinkId, NetError> {
        for n in [a, b] {
            if !self.is_router(n) && !self.is_leaf(n) {
                return Err(NetError::NodeNotFound(n));
            }
            if self.is_leaf(n) && self.access_link(n).is_some() {
                return Err(NetError::LeafAlreadyLinked(n));
            }
        }
        Ok(self.graph.add_edge(
            a,
            b,
            Link {
                length,
                rates,
                avail: rates,
                left_llnum: 0,
                right_llnum: 0,
                nonce: 0,
            },
        ))
    }

    /// Iterate over all links.
    pub fn links(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.graph.edge_indices()
    }

    /// Iterate over the links incident to a node.
    pub fn links_at(&self, n: NodeId) -> impl Iterator<Item = LinkId> + '_ {
        self.graph.edges(n).map(|e| e.id())
    }

    /// The access link of a leaf (its only link).
    pub fn access_link(&self, leaf: NodeId) -> Option<LinkId> {
        self.graph.edges(leaf).map(|e| e.id()).next()
    }

    /// The left endpoint of a link.
    pub fn left(&self, lnk: LinkId) -> Result<NodeId, NetError> {
        self.graph
            .edge_endpoints(lnk)
            .map(|(l, _)| l)
            .or_link_not_found(lnk)
    }

    /// The right endpoint of a link.
    pub fn right(&self, lnk: LinkId) -> Result<NodeId, NetError> {
        self.graph
            .edge_endpoints(lnk)
            .map(|(_, r)| r)
            .or_link_not_found(lnk)
    }

    /// The endpoint of `lnk` that is not `n`.
    pub fn peer(&self, n: NodeId, lnk: LinkId) -> Result<NodeId, NetError> {
        let (l, r) = self.graph.edge_endpoints(lnk).or_link_not_found(lnk)?;
        if l == n {
            Ok(r)
        } else if r == n {
            Ok(l)
        } else {
            Err(NetError::LinkNotFound(lnk))
        }
    }

    /// Find the link connecting two nodes.
    pub fn find_link(&self, a: NodeId, b: NodeId) -> Option<LinkId> {
        self.graph.find_edge(a, b)
    }

    /// Access the attributes of a link.
    pub fn link(&self, lnk: LinkId) -> Result<&Link, NetError> {
        self.graph.edge_weight(lnk).or_link_not_found(lnk)
    }

    /// Mutable access to the attributes of a link.
    pub fn link_mut(&mut self, lnk: LinkId) -> Result<&mut Link, NetError> {
        self.graph.edge_weight_mut(lnk).or_link_not_found(lnk)
    }

    /// The available rates of a link, seen from the left endpoint.
    pub fn avail_rates(&self, lnk: LinkId) -> Result<RateSpec, NetError> {
        self.link(lnk).map(|l| l.avail)
    }

    /// Set the local link number a router endpoint uses for a link.
    pub fn set_llnum(&mut self, lnk: LinkId, r: NodeId, llnum: u32) -> Result<(), NetError> {
        let (left, right) = self.graph.edge_endpoints(lnk).or_link_not_found(lnk)?;
        let link = self.graph.edge_weight_mut(lnk).or_link_not_found(lnk)?;
        if r == left {
            link.left_llnum = llnum;
        } else if r == right {
            link.right_llnum = llnum;
        } else {
            return Err(NetError::LinkNotFound(lnk));
        }
        self.loc_map.insert((r, llnum), lnk);
        Ok(())
    }

    /// The local link number a router endpoint uses for a link
    /// (0 if `r` is not a router endpoint of `lnk`).
    pub fn llnum(&self, lnk: LinkId, r: NodeId) -> u32 {
        match (self.graph.edge_endpoints(lnk), self.graph.edge_weight(lnk)) {
            (Some((l, _)), Some(link)) if l == r => link.left_llnum,
            (Some((_, rt)), Some(link)) if rt == r => link.right_llnum,
            _ => 0,
        }
    }

    /// Resolve a router's local link number to the global link.
    pub fn link_num(&self, r: NodeId, llnum: u32) -> Option<LinkId> {
        if self.is_leaf(r) {
            return self.access_link(r);
        }
        self.loc_map.get(&(r, llnum)).copied()
    }

    /// The nonce attached to a link.
    pub fn nonce(&self, lnk: LinkId) -> Result<u64, NetError> {
        self.link(lnk).map(|l| l.nonce)
    }

    /// Attach a nonce to a link.
    pub fn set_nonce(&mut self, lnk: LinkId, nonce: u64) -> Result<(), NetError> {
        self.link_mut(lnk).map(|l| l.nonce = nonce)
    }

    /// The default rates for access links without an explicit rate spec.
    pub fn default_leaf_rates(&self) -> RateSpec {
        self.default_leaf_rates
    }

    /// Set the default rates for access links.
    pub fn set_default_leaf_rates(&mut self, rates: RateSpec) {
        self.default_leaf_rates = rates;
    }

    // ********************
    // * Validation       *
    // ********************

    /// Run all post-input consistency checks, logging every violation.
    /// Returns `false` if any check failed; startup must then abort.
    pub fn check(&self) -> bool {
        let mut status = true;

        // every leaf has exactly one link, and it leads to a router
        for leaf in self.leaves() {
            let mut links = self.links_at(leaf);
            match (links.next(), links.next()) {
                (Some(lnk), None) => {
                    let peer = match self.peer(leaf, lnk) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if !self.is_router(peer) {
                        error!(
                            "leaf {} is connected to {}, which is not a router",
                            self.node_name(leaf),
                            self.node_name(peer)
                        );
                        status = false;
                    }
                }
                (None, _) => {
                    error!("leaf {} has no access link", self.node_name(leaf));
                    status = false;
                }
                (Some(_), Some(_)) => {
                    error!("leaf {} has more than one link", self.node_name(leaf));
                    status = false;
                }
            }
        }

        // local link numbers at router endpoints are distinct, nonzero and
        // covered by an interface
        for r in self.routers() {
            let mut seen = HashMap::new();
            for lnk in self.links_at(r) {
                let llnum = self.llnum(lnk, r);
                if llnum == 0 {
                    error!(
                        "link {} at router {} has no local link number",
                        lnk.index(),
                        self.node_name(r)
                    );
                    status = false;
                    continue;
                }
                if let Some(other) = seen.insert(llnum, lnk) {
                    error!(
                        "router {} uses local link number {} for two links ({}, {})",
                        self.node_name(r),
                        llnum,
                        other.index(),
                        lnk.index()
                    );
                    status = false;
                }
                if self.iface_for_llnum(r, llnum).is_none() {
                    error!(
                        "local link {} at router {} is not covered by any interface",
                        llnum,
                        self.node_name(r)
                    );
                    status = false;
                }
            }
        }

        // leaf ranges are well-formed and stay within the router's zip
        for r in self.routers() {
            let ri = &self.routers[&r];
            let (first, last) = ri.leaf_range;
            if first > last {
                error!("router {} has an empty leaf range", ri.name);
                status = false;
            }
            if first.zip() != ri.addr.zip() || last.zip() != ri.addr.zip() {
                error!(
                    "leaf range of router {} leaves its zip code {}",
                    ri.name,
                    ri.addr.zip()
                );
                status = false;
            }
        }

        // static leaf addresses fall in their access router's range
        for leaf in self.leaves() {
            let addr = self.node_addr(leaf);
            let rtr = self
                .access_link(leaf)
                .and_then(|lnk| self.peer(leaf, lnk).ok());
            if let Some(rtr) = rtr {
                if let Ok((first, last)) = self.leaf_range(rtr) {
                    if addr < first || addr > last {
                        error!(
                            "leaf {} has address {} outside the range of router {}",
                            self.node_name(leaf),
                            addr,
                            self.node_name(rtr)
                        );
                        status = false;
                    }
                }
            }
        }

        // every link capacity covers the default leaf rates on access links
        for lnk in self.links() {
            let link = match self.link(lnk) {
                Ok(l) => l,
                Err(_) => continue,
            };
            let left = match self.left(lnk) {
                Ok(n) => n,
                Err(_) => continue,
            };
            let right = match self.right(lnk) {
                Ok(n) => n,
                Err(_) => continue,
            };
            if (self.is_leaf(left) || self.is_leaf(right))
                && !self.default_leaf_rates.leq(&link.rates)
            {
                error!(
                    "access link ({},{}) cannot carry the default leaf rates",
                    self.node_name(left),
                    self.node_name(right)
                );
                status = false;
            }
        }

        status
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The shared state handed to every worker: the topology behind its own
/// mutex, and the comtree table with its per-comtree busy flags.
///
/// Lock order is structural: [`NetView::with_state`] always takes the
/// topology lock before the comtree map lock, never the reverse.
#[derive(Debug)]
pub struct NetView {
    topo: Mutex<Topology>,
    comts: ComtreeTable,
}

impl NetView {
    /// Wrap a fully-read topology and comtree set for shared use.
    pub fn new(topo: Topology, comts: ComtreeSet) -> Self {
        Self {
            topo: Mutex::new(topo),
            comts: ComtreeTable::new(comts),
        }
    }

    /// Run a closure with exclusive access to the topology.
    pub fn with_topo<R>(&self, f: impl FnOnce(&mut Topology) -> R) -> R {
        f(&mut lock(&self.topo))
    }

    /// Run a closure with exclusive access to topology and comtree set,
    /// taken in that order. Hold the comtree's busy lock (a
    /// [`crate::comtree::ComtreeLock`]) across the whole handler; use this
    /// only for the short in-memory mutations.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut Topology, &mut ComtreeSet) -> R) -> R {
        let mut topo = lock(&self.topo);
        self.comts.with_set(|set| f(&mut topo, set))
    }

    /// The comtree table.
    pub fn comtrees(&self) -> &ComtreeTable {
        &self.comts
    }
}

impl std::ops::Index<LinkId> for Topology {
    type Output = Link;

    fn index(&self, index: LinkId) -> &Self::Output {
        &self.graph[index]
    }
}
