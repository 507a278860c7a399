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

//! # Comtree engine
//!
//! The algorithms that grow and shrink comtrees: shortest-path search over
//! links with sufficient spare capacity, path provisioning, subtree-rate
//! aggregation, auto-mode rate recomputation, and the consistency checks run
//! after reading a comtree file.
//!
//! All methods assume the caller holds the comtree's busy lock and the
//! topology lock where they take `&mut Topology`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use log::*;
use priority_queue::PriorityQueue;

use crate::comtree::{ComtreeSet, ConfigMode, Ctx};
use crate::topology::Topology;
use crate::types::{ComtreeError, ForestAddr, LinkId, NodeId, RateDelta, RateSpec};

/// Parent-link chains longer than this indicate a corrupted tree.
const MAX_PATH_LEN: usize = 50;

/// One link of a path into a comtree: the underlay link, its child endpoint
/// (the node further from the tree), and the rates to reserve on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMod {
    /// The underlay link.
    pub lnk: LinkId,
    /// The endpoint at the lower end of the link.
    pub child: NodeId,
    /// Rates to reserve, expressed from the child side.
    pub rs: RateSpec,
}

/// A pending change to the rate of one comtree backbone link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateMod {
    /// The underlay link.
    pub lnk: LinkId,
    /// The child endpoint of the link.
    pub child: NodeId,
    /// Signed change of the reservation, expressed from the child side.
    pub delta: RateDelta,
}

/// The auto-mode rate for a parent link: upstream carries the subtree, and
/// downstream is bounded by what the rest of the tree can send up.
fn auto_rate(srates: RateSpec, root_rates: RateSpec, core: bool) -> RateSpec {
    let mut trates = root_rates;
    trates.subtract(srates);
    if core {
        RateSpec::new(
            srates.bit_rate_up,
            trates.bit_rate_up,
            srates.pkt_rate_up,
            trates.pkt_rate_up,
        )
    } else {
        RateSpec::new(
            srates.bit_rate_up,
            srates.bit_rate_down.min(trates.bit_rate_up),
            srates.pkt_rate_up,
            srates.pkt_rate_down.min(trates.pkt_rate_up),
        )
    }
}

impl ComtreeSet {
    // ********************
    // * Path search      *
    // ********************

    /// Find a path from a router to the comtree.
    ///
    /// Builds a shortest path tree from `src` over routers only, relaxing
    /// only across links whose spare capacity (seen from the prospective
    /// child side) covers `rs`. The search halts as soon as any comtree
    /// router is reached. Returns the branch router and the path links in
    /// bottom-up order (the link incident to `src` first); an empty path if
    /// `src` is already in the comtree, `None` if the comtree is unreachable.
    pub fn find_path(
        &self,
        ctx: Ctx,
        src: NodeId,
        rs: RateSpec,
        topo: &Topology,
    ) -> Option<(NodeId, Vec<LinkMod>)> {
        if self.is_comt_node(ctx, topo.node_addr(src)) {
            return Some((src, Vec::new()));
        }
        let mut dist: HashMap<NodeId, u64> = HashMap::new();
        let mut plnk: HashMap<NodeId, LinkId> = HashMap::new();
        let mut heap: PriorityQueue<NodeId, Reverse<u64>> = PriorityQueue::new();
        dist.insert(src, 0);
        heap.push(src, Reverse(0));
        while let Some((r, Reverse(d))) = heap.pop() {
            for lnk in topo.links_at(r) {
                if plnk.get(&r) == Some(&lnk) {
                    continue;
                }
                let peer = match topo.peer(r, lnk) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if !topo.is_router(peer) {
                    continue;
                }
                // skip links that cannot take the requested rates
                let link = match topo.link(lnk) {
                    Ok(l) => l,
                    Err(_) => continue,
                };
                let mut avail = link.avail;
                if topo.left(lnk).ok() != Some(r) {
                    avail.flip();
                }
                if !rs.leq(&avail) {
                    continue;
                }
                if self.is_comt_node(ctx, topo.node_addr(peer)) {
                    // reached the tree; walk back to src
                    plnk.insert(peer, lnk);
                    let mut path = Vec::new();
                    let mut u = peer;
                    while let Some(&pl) = plnk.get(&u) {
                        let v = topo.peer(u, pl).ok()?;
                        path.push(LinkMod {
                            lnk: pl,
                            child: v,
                            rs,
                        });
                        u = v;
                    }
                    path.reverse();
                    return Some((peer, path));
                }
                let nd = d + link.length as u64;
                if dist.get(&peer).map(|&old| nd < old).unwrap_or(true) {
                    dist.insert(peer, nd);
                    plnk.insert(peer, lnk);
                    heap.push_increase(peer, Reverse(nd));
                }
            }
        }
        None
    }

    /// Find a path from a router all the way to the comtree root.
    ///
    /// Like [`ComtreeSet::find_path`], but after reaching the comtree the
    /// walk continues along parent links to the root. The result is the
    /// sequence of local link numbers, each taken at the child endpoint,
    /// ordered from `src` up to the root.
    pub fn find_root_path(
        &self,
        ctx: Ctx,
        src: NodeId,
        rs: RateSpec,
        topo: &Topology,
    ) -> Option<Vec<u32>> {
        let (branch, path) = self.find_path(ctx, src, rs, topo)?;
        let mut llnums: Vec<u32> = path
            .iter()
            .map(|lm| topo.llnum(lm.lnk, lm.child))
            .collect();
        // continue up the comtree
        let mut u = branch;
        let mut hops = 0;
        while let Some(pl) = self.parent_link(ctx, topo.node_addr(u)) {
            llnums.push(topo.llnum(pl, u));
            u = topo.peer(u, pl).ok()?;
            hops += 1;
            if hops > MAX_PATH_LEN {
                return None;
            }
        }
        Some(llnums)
    }

    // ********************
    // * Provisioning     *
    // ********************

    /// Add a path of backbone links to the comtree.
    ///
    /// Works from the comtree end of the path outward: each child becomes a
    /// comtree router with the given parent link and rates, and the underlay
    /// link is debited. The links are assumed to have sufficient spare
    /// capacity (they were found by [`ComtreeSet::find_path`]). In auto mode
    /// the new links participate in rate recomputation; in manual mode their
    /// rate is set here once and frozen.
    pub fn add_path(
        &mut self,
        ctx: Ctx,
        path: &[LinkMod],
        topo: &mut Topology,
    ) -> Result<(), ComtreeError> {
        let auto = self.config_mode(ctx) == ConfigMode::Auto;
        for lm in path.iter().rev() {
            let parent = topo.peer(lm.child, lm.lnk).map_err(ComtreeError::Net)?;
            let child_adr = topo.node_addr(lm.child);
            let parent_adr = topo.node_addr(parent);
            self.add_node(ctx, child_adr, topo)?;
            self.add_node(ctx, parent_adr, topo)?;
            self.set_plink(ctx, child_adr, Some(lm.lnk), topo)?;
            if auto {
                self.thaw(ctx, child_adr);
            } else {
                self.freeze(ctx, child_adr);
            }
            if let Some(cri) = self.ct_mut(ctx).rtr_map.get_mut(&child_adr) {
                cri.plnk_rates = lm.rs;
            }
            let mut rs = lm.rs;
            if topo.left(lm.lnk).map_err(ComtreeError::Net)? != lm.child {
                rs.flip();
            }
            topo.link_mut(lm.lnk).map_err(ComtreeError::Net)?.avail.subtract(rs);
        }
        Ok(())
    }

    /// Remove a path of backbone links from the comtree, crediting the
    /// underlay links with the rates that were reserved. The exact inverse
    /// of [`ComtreeSet::add_path`]; the path must carry no branches.
    pub fn remove_path(
        &mut self,
        ctx: Ctx,
        path: &[LinkMod],
        topo: &mut Topology,
    ) -> Result<(), ComtreeError> {
        for lm in path {
            let child_adr = topo.node_addr(lm.child);
            let mut rs = self.link_rates(ctx, child_adr);
            if topo.left(lm.lnk).map_err(ComtreeError::Net)? != lm.child {
                rs.flip();
            }
            topo.link_mut(lm.lnk).map_err(ComtreeError::Net)?.avail.add(rs);
            self.remove_node(ctx, child_adr, topo)?;
        }
        Ok(())
    }

    /// Collect the path that becomes removable when `first_rtr` loses its
    /// last child: from `first_rtr` upward, every router whose only comtree
    /// link is its parent link, stopping at a branching or core router or at
    /// the root. The result is in bottom-up order and is suitable for
    /// [`ComtreeSet::remove_path`].
    pub fn teardown_path(&self, ctx: Ctx, first_rtr: NodeId, topo: &Topology) -> Vec<LinkMod> {
        let mut path = Vec::new();
        let mut rtr = first_rtr;
        let mut hops = 0;
        loop {
            let adr = topo.node_addr(rtr);
            let plnk = match self.parent_link(ctx, adr) {
                Some(p) => p,
                None => break,
            };
            if self.is_core_node(ctx, adr) || self.link_cnt(ctx, adr) > 1 {
                break;
            }
            path.push(LinkMod {
                lnk: plnk,
                child: rtr,
                rs: self.link_rates(ctx, adr),
            });
            rtr = match topo.peer(rtr, plnk) {
                Ok(p) => p,
                Err(_) => break,
            };
            hops += 1;
            if hops > MAX_PATH_LEN {
                error!(
                    "excessively long path detected in comtree {}, probably a cycle",
                    self.num(ctx)
                );
                break;
            }
        }
        path
    }

    /// Add a (signed) rate change to the subtree rates of every router from
    /// `rtr` to the root.
    ///
    /// A walk longer than the cycle guard indicates a corrupted tree and is
    /// reported as [`ComtreeError::PathTooLong`].
    pub fn adjust_subtree_rates(
        &mut self,
        ctx: Ctx,
        rtr: ForestAddr,
        delta: RateDelta,
        topo: &Topology,
    ) -> Result<(), ComtreeError> {
        let mut addr = rtr;
        let mut node = topo
            .node_by_addr(addr)
            .ok_or(ComtreeError::NotAComtreeRouter(rtr))?;
        let mut count = 0;
        loop {
            let cri = self
                .ct_mut(ctx)
                .rtr_map
                .get_mut(&addr)
                .ok_or(ComtreeError::NotAComtreeRouter(addr))?;
            cri.subtree_rates.apply(delta);
            let plnk = match cri.plnk {
                Some(p) => p,
                None => return Ok(()),
            };
            node = topo.peer(node, plnk).map_err(ComtreeError::Net)?;
            addr = topo.node_addr(node);
            count += 1;
            if count > MAX_PATH_LEN {
                error!(
                    "adjust_subtree_rates: excessively long path detected in \
                     comtree {}, probably a cycle",
                    self.num(ctx)
                );
                return Err(ComtreeError::PathTooLong(self.num(ctx)));
            }
        }
    }

    // ********************
    // * Rate computation *
    // ********************

    /// Compute the rate changes required on every non-frozen backbone link
    /// of an auto-configured comtree, verifying that each change fits into
    /// the spare capacity of its underlay link.
    pub fn compute_mods(&self, ctx: Ctx, topo: &Topology) -> Result<Vec<RateMod>, ComtreeError> {
        let root = self.root(ctx);
        let root_rates = self.subtree_rates(ctx, root);

        // children lists, so the walk is one pass top-down
        let mut children: BTreeMap<ForestAddr, Vec<ForestAddr>> = BTreeMap::new();
        for radr in self.comt_routers(ctx) {
            if let Some(padr) = self.parent(ctx, radr, topo) {
                children.entry(padr).or_default().push(radr);
            }
        }

        let mut mods = Vec::new();
        let mut pending = vec![root];
        while let Some(radr) = pending.pop() {
            if let Some(kids) = children.get(&radr) {
                pending.extend(kids.iter().copied());
            }
            let cri = match self.rtr_info(ctx, radr) {
                Some(c) => c,
                None => continue,
            };
            let plnk = match cri.plnk {
                Some(p) if !cri.frozen => p,
                _ => continue,
            };
            let rnum = match topo.node_by_addr(radr) {
                Some(n) => n,
                None => continue,
            };
            let target = auto_rate(cri.subtree_rates, root_rates, self.is_core_node(ctx, radr));
            let delta = target.diff(&cri.plnk_rates);
            if delta.is_zero() {
                continue;
            }
            let mut avail = topo.avail_rates(plnk).map_err(ComtreeError::Net)?;
            if topo.left(plnk).map_err(ComtreeError::Net)? != rnum {
                avail.flip();
            }
            if !delta.fits(&avail) {
                return Err(ComtreeError::InsufficientCapacity(plnk));
            }
            mods.push(RateMod {
                lnk: plnk,
                child: rnum,
                delta,
            });
        }
        Ok(mods)
    }

    /// Apply a list of rate changes: adjust the recorded parent-link rates
    /// and move the difference between the links' spare capacity and the
    /// reservations. Changes may be negative, in which case capacity flows
    /// back to the underlay.
    pub fn provision_mods(
        &mut self,
        ctx: Ctx,
        mods: &[RateMod],
        topo: &mut Topology,
    ) -> Result<(), ComtreeError> {
        for m in mods {
            let child_adr = topo.node_addr(m.child);
            if let Some(cri) = self.ct_mut(ctx).rtr_map.get_mut(&child_adr) {
                cri.plnk_rates.apply(m.delta);
            }
            let mut delta = m.delta;
            if topo.left(m.lnk).map_err(ComtreeError::Net)? != m.child {
                delta.flip();
            }
            topo.link_mut(m.lnk)
                .map_err(ComtreeError::Net)?
                .avail
                .apply(delta.negated());
        }
        Ok(())
    }

    /// Undo a previous [`ComtreeSet::provision_mods`] with the same list.
    pub fn unprovision_mods(
        &mut self,
        ctx: Ctx,
        mods: &[RateMod],
        topo: &mut Topology,
    ) -> Result<(), ComtreeError> {
        let negated: Vec<RateMod> = mods
            .iter()
            .map(|m| RateMod {
                lnk: m.lnk,
                child: m.child,
                delta: m.delta.negated(),
            })
            .collect();
        self.provision_mods(ctx, &negated, topo)
    }

    /// Recompute the parent-link rates of every non-frozen router of an
    /// auto-configured comtree from the current subtree rates.
    pub fn set_auto_config_rates(&mut self, ctx: Ctx) {
        let root = self.root(ctx);
        let root_rates = self.subtree_rates(ctx, root);
        let routers: Vec<ForestAddr> = self.comt_routers(ctx).collect();
        for radr in routers {
            let core = self.is_core_node(ctx, radr);
            let cri = match self.ct_mut(ctx).rtr_map.get_mut(&radr) {
                Some(c) => c,
                None => continue,
            };
            if cri.frozen || cri.plnk.is_none() {
                continue;
            }
            cri.plnk_rates = auto_rate(cri.subtree_rates, root_rates, core);
        }
    }

    /// Check that the spare capacity of every underlay link covers the rates
    /// currently configured on the comtree's links (backbone parent links
    /// and the access links of static leaves).
    pub fn check_comt_rates(&self, ctx: Ctx, topo: &Topology) -> Result<(), ComtreeError> {
        for (radr, cri) in self.ct(ctx).rtr_map.iter() {
            let plnk = match cri.plnk {
                Some(p) => p,
                None => continue,
            };
            let rnum = topo
                .node_by_addr(*radr)
                .ok_or(ComtreeError::NotAComtreeRouter(*radr))?;
            let mut rs = cri.plnk_rates;
            if topo.left(plnk).map_err(ComtreeError::Net)? != rnum {
                rs.flip();
            }
            if !rs.leq(&topo.avail_rates(plnk).map_err(ComtreeError::Net)?) {
                return Err(ComtreeError::InsufficientCapacity(plnk));
            }
        }
        for (ladr, cli) in self.ct(ctx).leaf_map.iter() {
            let leaf = match topo.node_by_addr(*ladr) {
                Some(n) => n,
                None => continue, // dynamic leaf, not part of the topology
            };
            let lnk = match topo.access_link(leaf) {
                Some(l) => l,
                None => continue,
            };
            let mut rs = cli.plnk_rates;
            if topo.left(lnk).map_err(ComtreeError::Net)? != leaf {
                rs.flip();
            }
            if !rs.leq(&topo.avail_rates(lnk).map_err(ComtreeError::Net)?) {
                return Err(ComtreeError::InsufficientCapacity(lnk));
            }
        }
        Ok(())
    }

    /// Debit the underlay with every reservation of this comtree. Used once
    /// at startup, after the comtree file has been read and checked.
    pub fn provision_comtree(&mut self, ctx: Ctx, topo: &mut Topology) -> Result<(), ComtreeError> {
        let rtrs: Vec<(ForestAddr, Option<LinkId>, RateSpec)> = self
            .ct(ctx)
            .rtr_map
            .iter()
            .map(|(a, cri)| (*a, cri.plnk, cri.plnk_rates))
            .collect();
        for (radr, plnk, rates) in rtrs {
            let plnk = match plnk {
                Some(p) => p,
                None => continue,
            };
            let rnum = topo
                .node_by_addr(radr)
                .ok_or(ComtreeError::NotAComtreeRouter(radr))?;
            let mut rs = rates;
            if topo.left(plnk).map_err(ComtreeError::Net)? != rnum {
                rs.flip();
            }
            topo.link_mut(plnk).map_err(ComtreeError::Net)?.avail.subtract(rs);
        }
        let leaves: Vec<(ForestAddr, RateSpec)> = self
            .ct(ctx)
            .leaf_map
            .iter()
            .map(|(a, cli)| (*a, cli.plnk_rates))
            .collect();
        for (ladr, rates) in leaves {
            let leaf = match topo.node_by_addr(ladr) {
                Some(n) => n,
                None => continue,
            };
            let lnk = match topo.access_link(leaf) {
                Some(l) => l,
                None => continue,
            };
            let mut rs = rates;
            if topo.left(lnk).map_err(ComtreeError::Net)? != leaf {
                rs.flip();
            }
            topo.link_mut(lnk).map_err(ComtreeError::Net)?.avail.subtract(rs);
        }
        Ok(())
    }

    /// Credit back every reservation of this comtree. The inverse of
    /// [`ComtreeSet::provision_comtree`].
    pub fn unprovision_comtree(
        &mut self,
        ctx: Ctx,
        topo: &mut Topology,
    ) -> Result<(), ComtreeError> {
        let rtrs: Vec<(ForestAddr, Option<LinkId>, RateSpec)> = self
            .ct(ctx)
            .rtr_map
            .iter()
            .map(|(a, cri)| (*a, cri.plnk, cri.plnk_rates))
            .collect();
        for (radr, plnk, rates) in rtrs {
            let plnk = match plnk {
                Some(p) => p,
                None => continue,
            };
            let rnum = topo
                .node_by_addr(radr)
                .ok_or(ComtreeError::NotAComtreeRouter(radr))?;
            let mut rs = rates;
            if topo.left(plnk).map_err(ComtreeError::Net)? != rnum {
                rs.flip();
            }
            topo.link_mut(plnk).map_err(ComtreeError::Net)?.avail.add(rs);
        }
        let leaves: Vec<(ForestAddr, RateSpec)> = self
            .ct(ctx)
            .leaf_map
            .iter()
            .map(|(a, cli)| (*a, cli.plnk_rates))
            .collect();
        for (ladr, rates) in leaves {
            let leaf = match topo.node_by_addr(ladr) {
                Some(n) => n,
                None => continue,
            };
            let lnk = match topo.access_link(leaf) {
                Some(l) => l,
                None => continue,
            };
            let mut rs = rates;
            if topo.left(lnk).map_err(ComtreeError::Net)? != leaf {
                rs.flip();
            }
            topo.link_mut(lnk).map_err(ComtreeError::Net)?.avail.add(rs);
        }
        Ok(())
    }

    /// Compute rates and reserve capacity for one comtree at startup.
    pub fn set_comt_rates(&mut self, ctx: Ctx, topo: &mut Topology) -> Result<(), ComtreeError> {
        if self.config_mode(ctx) == ConfigMode::Auto {
            self.set_auto_config_rates(ctx);
        }
        if let Err(e) = self.check_comt_rates(ctx, topo) {
            error!(
                "network lacks capacity for comtree {}: {}",
                self.num(ctx),
                e
            );
            return Err(e);
        }
        self.provision_comtree(ctx, topo)
    }

    /// Compute rates and reserve capacity for all comtrees at startup.
    pub fn set_all_comt_rates(&mut self, topo: &mut Topology) -> Result<(), ComtreeError> {
        let ctxs: Vec<Ctx> = self.comtrees().collect();
        for ctx in ctxs {
            self.set_comt_rates(ctx, topo)?;
        }
        Ok(())
    }

    // ********************
    // * Verification     *
    // ********************

    /// Run the consistency checks on every comtree, logging each violation.
    /// Returns `false` if anything failed; startup must then abort.
    pub fn check(&self, topo: &Topology) -> bool {
        let mut status = true;
        for ctx in self.comtrees() {
            status &= self.check_tree(ctx, topo);
            status &= self.check_link_counts(ctx, topo);
            status &= self.check_subtree_rates(ctx, topo);
            status &= self.check_link_rates(ctx);
        }
        status
    }

    /// Check the tree shape of one comtree: every leaf's parent is a comtree
    /// router, exactly one router has no parent, the parent links form a
    /// connected cycle-free tree, the parent of every core node is core, and
    /// zip codes are contiguous.
    pub fn check_tree(&self, ctx: Ctx, topo: &Topology) -> bool {
        let mut status = true;
        let comt = self.num(ctx);
        let root_adr = self.root(ctx);

        for ladr in self.comt_leaves(ctx) {
            let parent = self.parent(ctx, ladr, topo);
            if !parent.map(|p| self.is_comt_rtr(ctx, p)).unwrap_or(false) {
                error!(
                    "comtree {comt} has leaf {ladr} whose parent is not a router in the comtree"
                );
                status = false;
            }
        }

        let rootless = self
            .comt_routers(ctx)
            .filter(|r| self.parent(ctx, *r, topo).is_none())
            .count();
        if rootless != 1 {
            error!("comtree {comt} has {rootless} routers with no parent");
            status = false;
        }

        // breadth-first search from the root over the parent-link relation
        let mut children: BTreeMap<ForestAddr, Vec<ForestAddr>> = BTreeMap::new();
        for radr in self.comt_routers(ctx) {
            if let Some(padr) = self.parent(ctx, radr, topo) {
                children.entry(padr).or_default().push(radr);
            }
        }
        let mut seen: HashSet<ForestAddr> = HashSet::new();
        let mut zips: HashSet<u16> = HashSet::new();
        let mut pending = VecDeque::new();
        if self.is_comt_rtr(ctx, root_adr) {
            pending.push_back(root_adr);
            seen.insert(root_adr);
            zips.insert(root_adr.zip());
        } else {
            error!("comtree {comt} root {root_adr} is not a comtree router");
            status = false;
        }
        let mut count = 0;
        while let Some(u) = pending.pop_front() {
            count += 1;
            for &v in children.get(&u).into_iter().flatten() {
                if !seen.insert(v) {
                    error!("comtree {comt} contains a cycle");
                    return false;
                }
                if self.is_core_node(ctx, v) && !self.is_core_node(ctx, u) {
                    error!(
                        "comtree {comt} contains a core node {v} whose parent is not a core node"
                    );
                    status = false;
                }
                if v.zip() != u.zip() && !zips.insert(v.zip()) {
                    error!("zip code {} is non-contiguous in comtree {comt}", v.zip());
                    status = false;
                }
                pending.push_back(v);
            }
        }
        if count != self.ct(ctx).rtr_map.len() {
            error!("comtree {comt} not connected");
            status = false;
        }
        status
    }

    /// Recompute the per-router comtree link counts and compare them with
    /// the recorded values.
    pub fn check_link_counts(&self, ctx: Ctx, topo: &Topology) -> bool {
        let mut status = true;
        let comt = self.num(ctx);
        let mut counts: BTreeMap<ForestAddr, u32> = BTreeMap::new();

        for ladr in self.comt_leaves(ctx) {
            if let Some(padr) = self.parent(ctx, ladr, topo) {
                *counts.entry(padr).or_default() += 1;
            }
        }
        for radr in self.comt_routers(ctx) {
            if let Some(padr) = self.parent(ctx, radr, topo) {
                *counts.entry(padr).or_default() += 1;
                *counts.entry(radr).or_default() += 1;
            }
        }

        for radr in self.comt_routers(ctx) {
            let counted = counts.get(&radr).copied().unwrap_or(0);
            let recorded = self.link_cnt(ctx, radr);
            if counted != recorded {
                error!(
                    "router {radr} has {counted} links in comtree {comt}, \
                     but recorded lnkCnt is {recorded}"
                );
                status = false;
            }
        }
        status
    }

    /// Recompute the subtree rates bottom-up from the leaves and compare
    /// them with the recorded values. Also rejects non-positive leaf rates.
    pub fn check_subtree_rates(&self, ctx: Ctx, topo: &Topology) -> bool {
        let mut status = true;
        let comt = self.num(ctx);
        let root_adr = self.root(ctx);
        let mut computed: BTreeMap<ForestAddr, RateSpec> = BTreeMap::new();

        for (ladr, cli) in self.ct(ctx).leaf_map.iter() {
            let prates = cli.plnk_rates;
            if prates.bit_rate_up == 0
                || prates.bit_rate_down == 0
                || prates.pkt_rate_up == 0
                || prates.pkt_rate_down == 0
            {
                error!(
                    "detected non-positive comtree link rate for {comt} \
                     leaf {ladr} rateSpec={prates}"
                );
                status = false;
            }
            let mut padr = self.parent(ctx, *ladr, topo);
            let mut hops = 0;
            while let Some(p) = padr {
                computed.entry(p).or_default().add(prates);
                if p == root_adr {
                    break;
                }
                padr = self.parent(ctx, p, topo);
                hops += 1;
                if hops > MAX_PATH_LEN {
                    error!("comtree {comt} has an excessively long leaf path, probably a cycle");
                    return false;
                }
            }
        }

        for radr in self.comt_routers(ctx) {
            let stored = self.subtree_rates(ctx, radr);
            let recomputed = computed.get(&radr).copied().unwrap_or_default();
            if stored != recomputed {
                error!(
                    "router {radr} has subtree rate {recomputed} in comtree {comt}, \
                     but recorded value is {stored}"
                );
                status = false;
            }
        }
        status
    }

    /// For auto-mode comtrees, compare the stored parent-link rates of every
    /// non-frozen router with the auto-mode formula.
    pub fn check_link_rates(&self, ctx: Ctx) -> bool {
        if self.config_mode(ctx) != ConfigMode::Auto {
            return true;
        }
        let mut status = true;
        let comt = self.num(ctx);
        let root_rates = self.subtree_rates(ctx, self.root(ctx));
        for (radr, cri) in self.ct(ctx).rtr_map.iter() {
            if cri.frozen || cri.plnk.is_none() {
                continue;
            }
            let expected = auto_rate(cri.subtree_rates, root_rates, self.is_core_node(ctx, *radr));
            if expected != cri.plnk_rates {
                error!(
                    "detected inconsistent comtree link rates in {comt} at {radr}: \
                     computed rates {expected} and stored rates {}",
                    cri.plnk_rates
                );
                status = false;
            }
        }
        status
    }
}
