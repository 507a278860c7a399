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

//! # Comtree state
//!
//! A comtree is a provisioned multicast tree embedded in the underlay,
//! rooted at some router. [`ComtreeSet`] is the plain bookkeeping structure:
//! one record per comtree, with dense internal indices ([`Ctx`]), the router
//! and leaf maps, the core-node set and the per-comtree rate defaults. The
//! engine algorithms that grow and shrink comtrees live in [`engine`].
//!
//! [`ComtreeTable`] wraps a set for concurrent use: a map mutex guards the
//! number-to-index map and the records, and a per-comtree busy flag (waited
//! on through a condition variable) gives one worker at a time exclusive use
//! of a comtree for as long as it takes to reconfigure routers. The map
//! mutex itself is only ever held briefly.
//!
//! Methods taking a [`Ctx`] trust the caller to pass a valid index, exactly
//! like the original table kept per-entry validity checks out of the hot
//! path; handlers obtain the index through [`ComtreeTable::acquire`] and keep
//! the lock until done.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};

use crate::topology::Topology;
use crate::types::{ComtreeError, ComtreeNum, ForestAddr, LinkId, NetError, RateSpec};

pub mod engine;
pub mod parser;

pub use engine::{LinkMod, RateMod};

/// Dense internal index of a comtree.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ctx(pub(crate) usize);

impl Ctx {
    /// The raw index value.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// How backbone link rates of a comtree are managed.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ConfigMode {
    /// Backbone rates are recomputed from the subtree rates on every change.
    Auto,
    /// Backbone rates are set once at creation and frozen thereafter.
    Manual,
}

impl std::fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigMode::Auto => f.write_str("auto"),
            ConfigMode::Manual => f.write_str("manual"),
        }
    }
}

/// Per-router state within one comtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComtRtrInfo {
    /// Link to the parent in the comtree; `None` at the root.
    pub plnk: Option<LinkId>,
    /// Number of comtree links at this router (parent + children + leaves).
    pub lnk_cnt: u32,
    /// Sum of the leaf rates over the subtree rooted here.
    pub subtree_rates: RateSpec,
    /// True if the parent-link rate is pinned by configuration.
    pub frozen: bool,
    /// Rates reserved on the underlay for the parent link.
    pub plnk_rates: RateSpec,
}

/// Per-leaf state within one comtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComtLeafInfo {
    /// Forest address of the leaf's parent router.
    pub parent: ForestAddr,
    /// Local link number the parent uses to reach this leaf.
    pub llnk: u32,
    /// Rates of the access link of this leaf.
    pub plnk_rates: RateSpec,
}

/// One comtree record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comtree {
    pub(crate) num: ComtreeNum,
    pub(crate) owner: ForestAddr,
    pub(crate) root: ForestAddr,
    pub(crate) mode: ConfigMode,
    pub(crate) bb_def_rates: RateSpec,
    pub(crate) leaf_def_rates: RateSpec,
    pub(crate) core_set: BTreeSet<ForestAddr>,
    pub(crate) rtr_map: BTreeMap<ForestAddr, ComtRtrInfo>,
    pub(crate) leaf_map: BTreeMap<ForestAddr, ComtLeafInfo>,
}

impl Comtree {
    fn new(num: ComtreeNum) -> Self {
        Comtree {
            num,
            owner: ForestAddr::default(),
            root: ForestAddr::default(),
            mode: ConfigMode::Manual,
            bb_def_rates: RateSpec::ZERO,
            leaf_def_rates: RateSpec::ZERO,
            core_set: BTreeSet::new(),
            rtr_map: BTreeMap::new(),
            leaf_map: BTreeMap::new(),
        }
    }
}

/// # The comtree set
///
/// All comtrees of the network, addressed by dense indices. This is a plain
/// data structure without locking; [`ComtreeTable`] adds the concurrency
/// layer. All methods taking a [`Ctx`] assume it is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComtreeSet {
    slots: Vec<Option<Comtree>>,
    index_map: HashMap<ComtreeNum, Ctx>,
    free: Vec<usize>,
}

impl ComtreeSet {
    /// Generate an empty comtree set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a new comtree with the given number; attributes are left at
    /// their defaults. Returns the dense index allocated for it.
    pub fn add_comtree(&mut self, num: ComtreeNum) -> Result<Ctx, ComtreeError> {
        if self.index_map.contains_key(&num) {
            return Err(ComtreeError::ComtreeExists(num));
        }
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(Comtree::new(num));
                idx
            }
            None => {
                self.slots.push(Some(Comtree::new(num)));
                self.slots.len() - 1
            }
        };
        let ctx = Ctx(idx);
        self.index_map.insert(num, ctx);
        Ok(ctx)
    }

    /// Remove a comtree. All reserved underlay capacity must have been
    /// released beforehand.
    pub fn remove_comtree(&mut self, ctx: Ctx) {
        if let Some(ct) = self.slots[ctx.0].take() {
            self.index_map.remove(&ct.num);
            self.free.push(ctx.0);
        }
    }

    /// Look up the dense index for a comtree number.
    pub fn lookup(&self, num: ComtreeNum) -> Option<Ctx> {
        self.index_map.get(&num).copied()
    }

    /// Check whether a comtree number is in use.
    pub fn valid_comtree(&self, num: ComtreeNum) -> bool {
        self.index_map.contains_key(&num)
    }

    /// Iterate over the indices of all comtrees.
    pub fn comtrees(&self) -> impl Iterator<Item = Ctx> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| Ctx(i))
    }

    /// The number of comtrees.
    pub fn len(&self) -> usize {
        self.index_map.len()
    }

    /// Returns `true` if no comtree is defined.
    pub fn is_empty(&self) -> bool {
        self.index_map.is_empty()
    }

    pub(crate) fn ct(&self, ctx: Ctx) -> &Comtree {
        self.slots[ctx.0]
            .as_ref()
            .expect("comtree index passed to ComtreeSet is no longer valid")
    }

    pub(crate) fn ct_mut(&mut self, ctx: Ctx) -> &mut Comtree {
        self.slots[ctx.0]
            .as_mut()
            .expect("comtree index passed to ComtreeSet is no longer valid")
    }

    // ********************
    // * Attributes       *
    // ********************

    /// The comtree number mapped to this index.
    pub fn num(&self, ctx: Ctx) -> ComtreeNum {
        self.ct(ctx).num
    }

    /// The leaf that created this comtree.
    pub fn owner(&self, ctx: Ctx) -> ForestAddr {
        self.ct(ctx).owner
    }

    /// Set the owner of a comtree.
    pub fn set_owner(&mut self, ctx: Ctx, owner: ForestAddr) {
        self.ct_mut(ctx).owner = owner;
    }

    /// The root router of this comtree.
    pub fn root(&self, ctx: Ctx) -> ForestAddr {
        self.ct(ctx).root
    }

    /// Set the root router of a comtree.
    pub fn set_root(&mut self, ctx: Ctx, root: ForestAddr) {
        self.ct_mut(ctx).root = root;
    }

    /// The rate configuration mode.
    pub fn config_mode(&self, ctx: Ctx) -> ConfigMode {
        self.ct(ctx).mode
    }

    /// Set the rate configuration mode.
    pub fn set_config_mode(&mut self, ctx: Ctx, mode: ConfigMode) {
        self.ct_mut(ctx).mode = mode;
    }

    /// The default rates for backbone links.
    pub fn def_bb_rates(&self, ctx: Ctx) -> RateSpec {
        self.ct(ctx).bb_def_rates
    }

    /// The default rates for access links.
    pub fn def_leaf_rates(&self, ctx: Ctx) -> RateSpec {
        self.ct(ctx).leaf_def_rates
    }

    /// Set the default backbone and leaf rates.
    pub fn set_def_rates(&mut self, ctx: Ctx, bb: RateSpec, leaf: RateSpec) {
        let ct = self.ct_mut(ctx);
        ct.bb_def_rates = bb;
        ct.leaf_def_rates = leaf;
    }

    // ********************
    // * Membership       *
    // ********************

    /// Is this address a node (router or leaf) of the comtree?
    pub fn is_comt_node(&self, ctx: Ctx, addr: ForestAddr) -> bool {
        self.is_comt_rtr(ctx, addr) || self.is_comt_leaf(ctx, addr)
    }

    /// Is this address a router of the comtree?
    pub fn is_comt_rtr(&self, ctx: Ctx, addr: ForestAddr) -> bool {
        self.ct(ctx).rtr_map.contains_key(&addr)
    }

    /// Is this address a leaf of the comtree?
    pub fn is_comt_leaf(&self, ctx: Ctx, addr: ForestAddr) -> bool {
        self.ct(ctx).leaf_map.contains_key(&addr)
    }

    /// Is this router a core node of the comtree?
    pub fn is_core_node(&self, ctx: Ctx, addr: ForestAddr) -> bool {
        self.ct(ctx).core_set.contains(&addr)
    }

    /// Does the comtree currently use this underlay link as a tree edge?
    pub fn is_comt_link(&self, ctx: Ctx, lnk: LinkId, topo: &Topology) -> bool {
        let (left, right) = match (topo.left(lnk), topo.right(lnk)) {
            (Ok(l), Ok(r)) => (l, r),
            _ => return false,
        };
        let left_adr = topo.node_addr(left);
        let right_adr = topo.node_addr(right);
        (self.is_comt_node(ctx, left_adr) && self.parent(ctx, left_adr, topo) == Some(right_adr))
            || (self.is_comt_node(ctx, right_adr)
                && self.parent(ctx, right_adr, topo) == Some(left_adr))
    }

    /// Iterate over the core nodes.
    pub fn cores(&self, ctx: Ctx) -> impl Iterator<Item = ForestAddr> + '_ {
        self.ct(ctx).core_set.iter().copied()
    }

    /// Iterate over the comtree's routers.
    pub fn comt_routers(&self, ctx: Ctx) -> impl Iterator<Item = ForestAddr> + '_ {
        self.ct(ctx).rtr_map.keys().copied()
    }

    /// Iterate over the comtree's leaves.
    pub fn comt_leaves(&self, ctx: Ctx) -> impl Iterator<Item = ForestAddr> + '_ {
        self.ct(ctx).leaf_map.keys().copied()
    }

    /// Access the per-router record.
    pub fn rtr_info(&self, ctx: Ctx, addr: ForestAddr) -> Option<&ComtRtrInfo> {
        self.ct(ctx).rtr_map.get(&addr)
    }

    /// Access the per-leaf record.
    pub fn leaf_info(&self, ctx: Ctx, addr: ForestAddr) -> Option<&ComtLeafInfo> {
        self.ct(ctx).leaf_map.get(&addr)
    }

    // ********************
    // * Tree structure   *
    // ********************

    /// The parent link of a comtree router (`None` at the root or for
    /// unknown routers).
    pub fn parent_link(&self, ctx: Ctx, addr: ForestAddr) -> Option<LinkId> {
        self.ct(ctx).rtr_map.get(&addr).and_then(|cri| cri.plnk)
    }

    /// The parent address of a comtree node, router or leaf.
    pub fn parent(&self, ctx: Ctx, addr: ForestAddr, topo: &Topology) -> Option<ForestAddr> {
        if let Some(cri) = self.ct(ctx).rtr_map.get(&addr) {
            let plnk = cri.plnk?;
            let node = topo.node_by_addr(addr)?;
            let parent = topo.peer(node, plnk).ok()?;
            return Some(topo.node_addr(parent));
        }
        self.ct(ctx).leaf_map.get(&addr).map(|cli| cli.parent)
    }

    /// The child endpoint of a comtree backbone link.
    pub fn child(&self, ctx: Ctx, lnk: LinkId, topo: &Topology) -> Option<ForestAddr> {
        let left = topo.left(lnk).ok()?;
        let left_adr = topo.node_addr(left);
        if topo.is_leaf(left) {
            return Some(left_adr);
        }
        let right = topo.right(lnk).ok()?;
        let right_adr = topo.node_addr(right);
        if topo.is_leaf(right) {
            return Some(right_adr);
        }
        match self.ct(ctx).rtr_map.get(&left_adr) {
            Some(cri) if cri.plnk == Some(lnk) => Some(left_adr),
            _ => Some(right_adr),
        }
    }

    /// The number of comtree links incident to a router.
    pub fn link_cnt(&self, ctx: Ctx, addr: ForestAddr) -> u32 {
        self.ct(ctx)
            .rtr_map
            .get(&addr)
            .map(|cri| cri.lnk_cnt)
            .unwrap_or(0)
    }

    /// Is the parent-link rate of this router frozen?
    pub fn is_frozen(&self, ctx: Ctx, addr: ForestAddr) -> bool {
        matches!(self.ct(ctx).rtr_map.get(&addr),
                 Some(cri) if cri.plnk.is_some() && cri.frozen)
    }

    /// The rates reserved for the parent link of a comtree node.
    pub fn link_rates(&self, ctx: Ctx, addr: ForestAddr) -> RateSpec {
        let ct = self.ct(ctx);
        if let Some(cri) = ct.rtr_map.get(&addr) {
            cri.plnk_rates
        } else if let Some(cli) = ct.leaf_map.get(&addr) {
            cli.plnk_rates
        } else {
            RateSpec::ZERO
        }
    }

    /// The subtree rates recorded at a comtree router.
    pub fn subtree_rates(&self, ctx: Ctx, addr: ForestAddr) -> RateSpec {
        self.ct(ctx)
            .rtr_map
            .get(&addr)
            .map(|cri| cri.subtree_rates)
            .unwrap_or(RateSpec::ZERO)
    }

    // ********************
    // * Mutation         *
    // ********************

    /// Add a node to the comtree. Routers get an empty record; leaves start
    /// with the default leaf rates, and statically configured leaves get
    /// their parent filled in from the topology. Adding a member again is a
    /// no-op.
    pub fn add_node(
        &mut self,
        ctx: Ctx,
        addr: ForestAddr,
        topo: &Topology,
    ) -> Result<(), ComtreeError> {
        let node = topo.node_by_addr(addr);
        if let Some(n) = node {
            if topo.is_router(n) {
                self.ct_mut(ctx).rtr_map.entry(addr).or_default();
                return Ok(());
            }
        }
        if self.ct(ctx).leaf_map.contains_key(&addr) {
            return Ok(());
        }
        let mut cli = ComtLeafInfo {
            plnk_rates: self.ct(ctx).leaf_def_rates,
            ..Default::default()
        };
        if let Some(leaf) = node {
            // static leaf: parent comes from the topology
            let plnk = topo
                .access_link(leaf)
                .ok_or(NetError::NotALeaf(leaf))
                .map_err(ComtreeError::Net)?;
            let parent = topo.peer(leaf, plnk).map_err(ComtreeError::Net)?;
            cli.parent = topo.node_addr(parent);
            cli.llnk = topo.llnum(plnk, parent);
        }
        self.ct_mut(ctx).leaf_map.insert(addr, cli);
        Ok(())
    }

    /// Remove a node from the comtree, updating the parent's link count.
    /// Fails for routers that still have incident comtree links beyond the
    /// parent link.
    pub fn remove_node(
        &mut self,
        ctx: Ctx,
        addr: ForestAddr,
        topo: &Topology,
    ) -> Result<(), ComtreeError> {
        if let Some(cri) = self.ct(ctx).rtr_map.get(&addr) {
            let plnk = cri.plnk;
            let cnt = cri.lnk_cnt;
            if (plnk.is_none() && cnt != 0) || (plnk.is_some() && cnt != 1) {
                return Err(ComtreeError::HasChildren(addr));
            }
            if let Some(plnk) = plnk {
                let node = topo
                    .node_by_addr(addr)
                    .ok_or(NetError::AddrNotFound(addr))
                    .map_err(ComtreeError::Net)?;
                let parent = topo.peer(node, plnk).map_err(ComtreeError::Net)?;
                let parent_adr = topo.node_addr(parent);
                if let Some(pri) = self.ct_mut(ctx).rtr_map.get_mut(&parent_adr) {
                    pri.lnk_cnt -= 1;
                }
            }
            let ct = self.ct_mut(ctx);
            ct.rtr_map.remove(&addr);
            ct.core_set.remove(&addr);
            return Ok(());
        }
        let cli = self
            .ct_mut(ctx)
            .leaf_map
            .remove(&addr)
            .ok_or(ComtreeError::NotAComtreeNode(addr))?;
        if let Some(pri) = self.ct_mut(ctx).rtr_map.get_mut(&cli.parent) {
            pri.lnk_cnt -= 1;
        }
        Ok(())
    }

    /// Mark a router as a core node, adding it to the comtree if necessary.
    pub fn add_core_node(
        &mut self,
        ctx: Ctx,
        addr: ForestAddr,
        topo: &Topology,
    ) -> Result<(), ComtreeError> {
        let node = topo
            .node_by_addr(addr)
            .ok_or(NetError::AddrNotFound(addr))
            .map_err(ComtreeError::Net)?;
        if !topo.is_router(node) {
            return Err(ComtreeError::Net(NetError::NotARouter(node)));
        }
        if !self.is_comt_rtr(ctx, addr) {
            self.add_node(ctx, addr, topo)?;
        }
        self.ct_mut(ctx).core_set.insert(addr);
        Ok(())
    }

    /// Remove a router from the core set (the router stays in the comtree).
    pub fn remove_core_node(&mut self, ctx: Ctx, addr: ForestAddr) {
        self.ct_mut(ctx).core_set.remove(&addr);
    }

    /// Set the parent link of a comtree router, updating the link counts at
    /// the router and its parent.
    pub fn set_plink(
        &mut self,
        ctx: Ctx,
        addr: ForestAddr,
        plnk: Option<LinkId>,
        topo: &Topology,
    ) -> Result<(), ComtreeError> {
        let old = {
            let cri = self
                .ct(ctx)
                .rtr_map
                .get(&addr)
                .ok_or(ComtreeError::NotAComtreeRouter(addr))?;
            cri.plnk
        };
        let node = topo
            .node_by_addr(addr)
            .ok_or(NetError::AddrNotFound(addr))
            .map_err(ComtreeError::Net)?;
        if let Some(old_lnk) = old {
            // moving a node already in the comtree; no cycle checking
            let parent = topo.peer(node, old_lnk).map_err(ComtreeError::Net)?;
            let parent_adr = topo.node_addr(parent);
            if let Some(pri) = self.ct_mut(ctx).rtr_map.get_mut(&parent_adr) {
                pri.lnk_cnt -= 1;
            }
            if plnk.is_none() {
                if let Some(cri) = self.ct_mut(ctx).rtr_map.get_mut(&addr) {
                    cri.lnk_cnt -= 1;
                }
            }
        } else if plnk.is_some() {
            if let Some(cri) = self.ct_mut(ctx).rtr_map.get_mut(&addr) {
                cri.lnk_cnt += 1;
            }
        }
        if let Some(cri) = self.ct_mut(ctx).rtr_map.get_mut(&addr) {
            cri.plnk = plnk;
        }
        let plnk = match plnk {
            Some(p) => p,
            None => return Ok(()),
        };
        let parent = topo.peer(node, plnk).map_err(ComtreeError::Net)?;
        let parent_adr = topo.node_addr(parent);
        if let Some(pri) = self.ct_mut(ctx).rtr_map.get_mut(&parent_adr) {
            pri.lnk_cnt += 1;
        }
        Ok(())
    }

    /// Set the parent of a comtree leaf, updating the parent's link count.
    pub fn set_parent(
        &mut self,
        ctx: Ctx,
        leaf: ForestAddr,
        parent: ForestAddr,
        llnk: u32,
    ) -> Result<(), ComtreeError> {
        let cli = self
            .ct_mut(ctx)
            .leaf_map
            .get_mut(&leaf)
            .ok_or(ComtreeError::NotAComtreeNode(leaf))?;
        cli.parent = parent;
        cli.llnk = llnk;
        if let Some(pri) = self.ct_mut(ctx).rtr_map.get_mut(&parent) {
            pri.lnk_cnt += 1;
        }
        Ok(())
    }

    /// Set the rates of a leaf's access link.
    pub fn set_leaf_rates(&mut self, ctx: Ctx, leaf: ForestAddr, rates: RateSpec) {
        if let Some(cli) = self.ct_mut(ctx).leaf_map.get_mut(&leaf) {
            cli.plnk_rates = rates;
        }
    }

    /// Set the rates reserved for the parent link of a comtree node.
    pub fn set_link_rates(&mut self, ctx: Ctx, addr: ForestAddr, rates: RateSpec) {
        let ct = self.ct_mut(ctx);
        if let Some(cri) = ct.rtr_map.get_mut(&addr) {
            cri.plnk_rates = rates;
        } else if let Some(cli) = ct.leaf_map.get_mut(&addr) {
            cli.plnk_rates = rates;
        }
    }

    /// Pin the parent-link rate of a router.
    pub fn freeze(&mut self, ctx: Ctx, addr: ForestAddr) {
        if let Some(cri) = self.ct_mut(ctx).rtr_map.get_mut(&addr) {
            cri.frozen = true;
        }
    }

    /// Unpin the parent-link rate of a router.
    pub fn thaw(&mut self, ctx: Ctx, addr: ForestAddr) {
        if let Some(cri) = self.ct_mut(ctx).rtr_map.get_mut(&addr) {
            cri.frozen = false;
        }
    }
}

struct TableInner {
    set: ComtreeSet,
    busy: BTreeSet<usize>,
}

/// # The shared comtree table
///
/// Wraps a [`ComtreeSet`] for concurrent use. [`ComtreeTable::acquire`]
/// looks up a comtree and blocks until its busy flag is clear, then sets it
/// and hands back a [`ComtreeLock`] which releases the flag on drop. The
/// busy flag may be held across router transactions (seconds); the inner map
/// mutex is only held for the individual lookups and mutations.
pub struct ComtreeTable {
    inner: Mutex<TableInner>,
    cond: Condvar,
}

impl std::fmt::Debug for ComtreeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComtreeTable").finish_non_exhaustive()
    }
}

impl ComtreeTable {
    /// Wrap a comtree set for shared use.
    pub fn new(set: ComtreeSet) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                set,
                busy: BTreeSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a closure under the map lock. The closure must not block.
    ///
    /// Mutating a comtree through this method is only sound while holding
    /// that comtree's [`ComtreeLock`]; the busy flag is the write token.
    pub fn with_set<R>(&self, f: impl FnOnce(&mut ComtreeSet) -> R) -> R {
        f(&mut self.guard().set)
    }

    /// Get the index for a comtree and lock the comtree, waiting until any
    /// other holder releases it. Returns `None` if the comtree number is
    /// unknown (also when it disappears while waiting).
    pub fn acquire(&self, num: ComtreeNum) -> Option<ComtreeLock<'_>> {
        let mut g = self.guard();
        loop {
            let ctx = g.set.lookup(num)?;
            if !g.busy.contains(&ctx.0) {
                g.busy.insert(ctx.0);
                return Some(ComtreeLock {
                    table: self,
                    ctx,
                    armed: true,
                });
            }
            g = self.cond.wait(g).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Create a new comtree and return it locked.
    pub fn create(&self, num: ComtreeNum) -> Result<ComtreeLock<'_>, ComtreeError> {
        let mut g = self.guard();
        let ctx = g.set.add_comtree(num)?;
        // a freshly allocated comtree cannot be busy
        g.busy.insert(ctx.0);
        Ok(ComtreeLock {
            table: self,
            ctx,
            armed: true,
        })
    }

    /// Remove a locked comtree, consuming the lock.
    pub fn remove(&self, lock: ComtreeLock<'_>) {
        let mut lock = lock;
        let mut g = self.guard();
        g.set.remove_comtree(lock.ctx);
        g.busy.remove(&lock.ctx.0);
        lock.armed = false;
        drop(g);
        self.cond.notify_all();
    }

    /// Lock the first comtree, for iteration over all comtrees.
    pub fn first_comtree(&self) -> Option<ComtreeLock<'_>> {
        self.lock_from(0)
    }

    /// Release the given lock and lock the next comtree.
    pub fn next_comtree(&self, lock: ComtreeLock<'_>) -> Option<ComtreeLock<'_>> {
        let next = lock.ctx.0 + 1;
        drop(lock);
        self.lock_from(next)
    }

    fn lock_from(&self, start: usize) -> Option<ComtreeLock<'_>> {
        let mut g = self.guard();
        loop {
            let ctx = g.set.comtrees().find(|c| c.0 >= start)?;
            if !g.busy.contains(&ctx.0) {
                g.busy.insert(ctx.0);
                return Some(ComtreeLock {
                    table: self,
                    ctx,
                    armed: true,
                });
            }
            g = self.cond.wait(g).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Exclusive access to one comtree, released on drop.
///
/// While a worker holds this lock, it is the only one allowed to mutate the
/// comtree's record or to reconfigure routers on its behalf.
#[derive(Debug)]
pub struct ComtreeLock<'a> {
    table: &'a ComtreeTable,
    ctx: Ctx,
    armed: bool,
}

impl ComtreeLock<'_> {
    /// The index of the locked comtree.
    pub fn ctx(&self) -> Ctx {
        self.ctx
    }
}

impl Drop for ComtreeLock<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut g = self.table.guard();
            g.busy.remove(&self.ctx.0);
            drop(g);
            self.table.cond.notify_all();
        }
    }
}
