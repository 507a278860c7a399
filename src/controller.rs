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

//! # Controller handlers
//!
//! The dispatch from control-packet type to handler, and the handlers
//! themselves: create/drop/join/leave comtree, boot a router or a leaf,
//! admit a new session, cancel one, and relay client connect/disconnect
//! notifications.
//!
//! Every handler runs on a worker thread with its own [`CfgHandler`]. A
//! handler that touches a comtree acquires that comtree's lock first and
//! holds it across all its router transactions, so no other worker can see
//! a half-updated comtree. When multiple locks are needed the order is
//! always topology before comtree, never the reverse. On any failure the
//! handler undoes the underlay reservations it made, sends a negative reply
//! quoting a specific message, and releases the lock.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::*;
use rand::seq::SliceRandom;

use crate::comtree::{ComtreeLock, ConfigMode, Ctx, LinkMod};
use crate::prefix::PrefixTable;
use crate::proto::handler::CfgHandler;
use crate::proto::{CtlMsg, CtlMsgType, Packet, CLIENT_SIG_COMT, CONNECT_COMT, NET_SIG_COMT};
use crate::topology::NetView;
use crate::types::{
    ComtreeNum, ForestAddr, LinkId, NodeId, NodeStatus, NodeType, RateSpec,
};

/// Backbone rates used for comtrees created without explicit defaults.
const DEFAULT_BB_RATES: RateSpec = RateSpec::new(100, 100, 100, 100);

/// Return a random nonce suitable for use when connecting a leaf.
pub fn generate_nonce() -> u64 {
    loop {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1);
        let nonce = secs.wrapping_mul(rand::random::<u32>() as u64);
        if nonce != 0 {
            return nonce;
        }
    }
}

/// Everything a handler needs to configure one hop of a comtree path.
#[derive(Debug, Clone)]
struct PathHop {
    lnk: LinkId,
    child_adr: ForestAddr,
    parent_adr: ForestAddr,
    llnum_child: u32,
    llnum_parent: u32,
    /// reservation from the child side
    rates: RateSpec,
    child_core: bool,
    parent_core: bool,
}

/// # The controller
///
/// Owns the shared network view, the client prefix table and the pool of
/// assignable comtree numbers, and dispatches incoming control packets to
/// the right handler.
#[derive(Debug)]
pub struct Controller {
    view: Arc<NetView>,
    prefixes: PrefixTable,
    my_adr: ForestAddr,
    cli_mgr_adr: Option<ForestAddr>,
    free_comts: Mutex<BTreeSet<ComtreeNum>>,
}

impl Controller {
    /// Create a controller over the shared view. `comt_range` is the range
    /// of comtree numbers this controller may assign; numbers already taken
    /// by pre-configured comtrees are excluded.
    pub fn new(
        view: Arc<NetView>,
        prefixes: PrefixTable,
        my_adr: ForestAddr,
        comt_range: (ComtreeNum, ComtreeNum),
    ) -> Self {
        let free_comts = view.comtrees().with_set(|set| {
            (comt_range.0..=comt_range.1)
                .filter(|c| !set.valid_comtree(*c))
                .collect()
        });
        Controller {
            view,
            prefixes,
            my_adr,
            cli_mgr_adr: None,
            free_comts: Mutex::new(free_comts),
        }
    }

    /// Forward client connect/disconnect notifications to this client
    /// manager.
    pub fn with_client_mgr(mut self, adr: ForestAddr) -> Self {
        self.cli_mgr_adr = Some(adr);
        self
    }

    /// The shared network view.
    pub fn view(&self) -> &Arc<NetView> {
        &self.view
    }

    fn take_comt_num(&self) -> Option<ComtreeNum> {
        let mut free = self.free_comts.lock().unwrap_or_else(|e| e.into_inner());
        let num = free.iter().next().copied()?;
        free.remove(&num);
        Some(num)
    }

    fn release_comt_num(&self, num: ComtreeNum) {
        self.free_comts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(num);
    }

    /// Dispatch one inbound request to its handler.
    pub fn dispatch(&self, pkt: Packet, cph: &mut CfgHandler) {
        let cp = match pkt.ctl() {
            Some(cp) if cp.is_request() => cp.clone(),
            _ => return,
        };
        let success = match cp.req_type() {
            Ok(CtlMsgType::ClientAddComtree) => self.handle_add_comtree(&pkt, &cp, cph),
            Ok(CtlMsgType::ClientDropComtree) => self.handle_drop_comtree(&pkt, &cp, cph),
            Ok(CtlMsgType::ClientJoinComtree) => self.handle_join_comtree(&pkt, &cp, cph),
            Ok(CtlMsgType::ClientLeaveComtree) => self.handle_leave_comtree(&pkt, &cp, cph),
            Ok(CtlMsgType::NewSession) => self.handle_new_session(&pkt, &cp, cph),
            Ok(CtlMsgType::CancelSession) => self.handle_cancel_session(&pkt, &cp, cph),
            Ok(CtlMsgType::ClientConnect) | Ok(CtlMsgType::ClientDisconnect) => {
                self.handle_con_disc(&pkt, &cp, cph)
            }
            Ok(CtlMsgType::BootRouter) => self.handle_boot_router(&pkt, &cp, cph),
            Ok(CtlMsgType::BootLeaf) => self.handle_boot_leaf(&pkt, &cp, cph),
            _ => {
                cph.err_reply(&pkt, "invalid control packet type for this controller");
                true
            }
        };
        if !success {
            warn!("handler failed for {} from {}", cp, pkt.src);
        }
    }

    // ********************
    // * Comtree handlers *
    // ********************

    /// Handle a request to create a new comtree.
    ///
    /// Picks a free comtree number and a random router in the requested root
    /// zip, configures the root router, then records the comtree and its
    /// owner. If the positive reply is lost, the client's retry with a fresh
    /// sequence number creates another comtree; the lossy behavior of the
    /// protocol is kept (substrate deduplication absorbs same-sequence
    /// retries, which is the common case).
    fn handle_add_comtree(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        let root_zip = match cp.req_zip() {
            Ok(z) => z,
            Err(_) => {
                cph.err_reply(pkt, "missing required attribute");
                return true;
            }
        };
        let comt = match self.take_comt_num() {
            Some(c) => c,
            None => {
                cph.err_reply(pkt, "no comtrees available to satisfy request");
                return true;
            }
        };
        let lock = match self.view.comtrees().create(comt) {
            Ok(l) => l,
            Err(e) => {
                self.release_comt_num(comt);
                cph.err_reply(pkt, "internal error prevents adding new comtree");
                error!("handle_add_comtree: create failed: {e}");
                return false;
            }
        };
        let ctx = lock.ctx();

        // pick a root router in the requested zip, uniformly at random
        let candidates: Vec<(NodeId, ForestAddr)> = self.view.with_topo(|topo| {
            topo.routers()
                .map(|r| (r, topo.node_addr(r)))
                .filter(|(_, a)| a.zip() == root_zip)
                .collect()
        });
        let (_root, root_adr) = match candidates.choose(&mut rand::thread_rng()) {
            Some(pick) => *pick,
            None => {
                self.drop_new_comtree(lock, comt);
                cph.err_reply(pkt, "network contains no router with specified zip code");
                return true;
            }
        };

        // configure the root router
        match cph.add_comtree(Some(root_adr), comt) {
            Err(_) => {
                self.drop_new_comtree(lock, comt);
                cph.err_reply(pkt, "root router never replied");
                return false;
            }
            Ok(rep) if !rep.is_pos_reply() => {
                self.drop_new_comtree(lock, comt);
                cph.err_reply(pkt, "root router could not add comtree");
                return false;
            }
            Ok(_) => {}
        }
        match cph.mod_comtree(Some(root_adr), comt, 0, true) {
            Err(_) => {
                self.drop_new_comtree(lock, comt);
                cph.err_reply(pkt, "root router never replied");
                return false;
            }
            Ok(rep) if !rep.is_pos_reply() => {
                self.drop_new_comtree(lock, comt);
                cph.err_reply(pkt, "root router could not modify comtree");
                return false;
            }
            Ok(_) => {}
        }

        // record the new comtree
        let bb = cp.rates1.unwrap_or(DEFAULT_BB_RATES);
        let leaf = cp.rates2.unwrap_or_else(|| self.view.with_topo(|t| t.default_leaf_rates()));
        let recorded = self.view.with_state(|topo, set| {
            set.set_root(ctx, root_adr);
            set.set_owner(ctx, pkt.src);
            set.set_config_mode(ctx, ConfigMode::Manual);
            set.set_def_rates(ctx, bb, leaf);
            set.add_node(ctx, root_adr, topo)
                .and_then(|_| set.add_core_node(ctx, root_adr, topo))
        });
        if let Err(e) = recorded {
            self.drop_new_comtree(lock, comt);
            cph.err_reply(pkt, "internal error prevents adding new comtree");
            error!("handle_add_comtree: recording failed: {e}");
            return false;
        }
        drop(lock);

        let reply = CtlMsg {
            comtree: Some(comt),
            ..CtlMsg::pos_reply(CtlMsgType::ClientAddComtree, cp.seq)
        };
        cph.send_reply(reply, Some(pkt.src));
        true
    }

    fn drop_new_comtree(&self, lock: ComtreeLock<'_>, comt: ComtreeNum) {
        self.view.comtrees().remove(lock);
        self.release_comt_num(comt);
    }

    /// Handle a request to destroy a comtree. Only the owner may drop it.
    fn handle_drop_comtree(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        let comt = match cp.req_comtree() {
            Ok(c) => c,
            Err(_) => {
                cph.err_reply(pkt, "missing required attribute");
                return true;
            }
        };
        let lock = match self.view.comtrees().acquire(comt) {
            Some(l) => l,
            None => {
                // already gone; report success
                cph.send_reply(
                    CtlMsg::pos_reply(CtlMsgType::ClientDropComtree, cp.seq),
                    Some(pkt.src),
                );
                return true;
            }
        };
        let ctx = lock.ctx();
        let owner = self.view.comtrees().with_set(|s| s.owner(ctx));
        if owner != pkt.src {
            drop(lock);
            cph.err_reply(pkt, "only the owner can drop a comtree");
            return true;
        }

        // detach every leaf, releasing static access-link reservations
        let leaves: Vec<ForestAddr> =
            self.view.comtrees().with_set(|s| s.comt_leaves(ctx).collect());
        for leaf in leaves {
            let _ = self.view.with_state(|topo, set| -> Result<(), crate::types::ComtreeError> {
                release_static_leaf_link(set, ctx, leaf, topo);
                set.remove_node(ctx, leaf, topo)
            });
        }

        // prune paths from the outside in, until nothing prunable remains
        let mut status = true;
        loop {
            let next: Option<NodeId> = self.view.with_state(|topo, set| {
                set.comt_routers(ctx)
                    .find(|r| {
                        set.parent_link(ctx, *r).is_some()
                            && set.link_cnt(ctx, *r) == 1
                            && !set.is_core_node(ctx, *r)
                    })
                    .and_then(|a| topo.node_by_addr(a))
            });
            let rtr = match next {
                Some(r) => r,
                None => break,
            };
            let path = self.view.with_state(|topo, set| set.teardown_path(ctx, rtr, topo));
            if path.is_empty() {
                break;
            }
            let hops = self.path_hops(ctx, &path);
            status &= self.drop_path_config(comt, &hops, cph);
            if self
                .view
                .with_state(|topo, set| set.remove_path(ctx, &path, topo))
                .is_err()
            {
                status = false;
                break;
            }
        }

        // whatever remains (root, stray cores) gives back its reservations
        let root_adr = self.view.comtrees().with_set(|s| s.root(ctx));
        let _ = self
            .view
            .with_state(|topo, set| set.unprovision_comtree(ctx, topo));
        self.view.comtrees().remove(lock);
        self.release_comt_num(comt);

        // finally remove the comtree at the root router
        match cph.drop_comtree(Some(root_adr), comt) {
            Err(_) => {
                cph.err_reply(pkt, "root router never replied");
                return false;
            }
            Ok(rep) if !rep.is_pos_reply() => {
                cph.err_reply(pkt, "root router could not drop comtree");
                return false;
            }
            Ok(_) => {}
        }

        cph.send_reply(
            CtlMsg::pos_reply(CtlMsgType::ClientDropComtree, cp.seq),
            Some(pkt.src),
        );
        status
    }

    /// Handle a request by a client to join a comtree.
    ///
    /// Selects a path from the client's access router to the comtree,
    /// reserves bandwidth along it, configures the routers on the path, and
    /// finally sets up the client's access link at its router. The comtree
    /// lock is held across the whole operation.
    fn handle_join_comtree(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        let (comt, cli_ip, cli_port) = match (cp.req_comtree(), cp.req_ip1(), cp.req_port1()) {
            (Ok(c), Ok(ip), Ok(port)) => (c, ip, port),
            _ => {
                cph.err_reply(pkt, "required attribute is missing");
                return true;
            }
        };
        let cli_adr = pkt.src;
        let cli_rtr = match self.view.with_topo(|t| t.router_for_leaf_addr(cli_adr)) {
            Some(r) => r,
            None => {
                cph.err_reply(pkt, "can't find client's access router");
                error!("handle_join_comtree: no access router for {cli_adr}");
                return false;
            }
        };
        let cli_rtr_adr = self.view.with_topo(|t| t.node_addr(cli_rtr));

        let lock = match self.view.comtrees().acquire(comt) {
            Some(l) => l,
            None => {
                cph.err_reply(pkt, "no such comtree");
                return true;
            }
        };
        let ctx = lock.ctx();

        // a repeated join from the same client is a no-op
        if self.view.comtrees().with_set(|s| s.is_comt_leaf(ctx, cli_adr)) {
            drop(lock);
            cph.send_reply(
                CtlMsg::pos_reply(CtlMsgType::ClientJoinComtree, cp.seq),
                Some(cli_adr),
            );
            return true;
        }

        let (bb_rates, leaf_rates, auto) = self.view.comtrees().with_set(|s| {
            (
                s.def_bb_rates(ctx),
                s.def_leaf_rates(ctx),
                s.config_mode(ctx) == ConfigMode::Auto,
            )
        });

        // find and reserve a path to the comtree
        let found = self
            .view
            .with_state(|topo, set| set.find_path(ctx, cli_rtr, bb_rates, topo));
        let (_branch, path) = match found {
            Some(p) => p,
            None => {
                drop(lock);
                cph.err_reply(pkt, "cannot find path to comtree");
                return true;
            }
        };
        if self
            .view
            .with_state(|topo, set| set.add_path(ctx, &path, topo))
            .is_err()
        {
            drop(lock);
            cph.err_reply(pkt, "cannot find path to comtree");
            return false;
        }

        // add the leaf and propagate its rates
        let mods: Result<Vec<crate::comtree::RateMod>, crate::types::ComtreeError> =
            self.view.with_state(|topo, set| {
            set.add_node(ctx, cli_adr, topo)?;
            reserve_static_leaf_link(set, ctx, cli_adr, topo);
            set.adjust_subtree_rates(ctx, cli_rtr_adr, leaf_rates.diff(&RateSpec::ZERO), topo)?;
            if auto {
                let mods = set.compute_mods(ctx, topo)?;
                set.provision_mods(ctx, &mods, topo)?;
                Ok(mods)
            } else {
                Ok(Vec::new())
            }
        });
        let mods = match mods {
            Ok(m) => m,
            Err(e) => {
                // back out the leaf and the path
                let _ = self.view.with_state(|topo, set| {
                    release_static_leaf_link(set, ctx, cli_adr, topo);
                    let _ = set.remove_node(ctx, cli_adr, topo);
                    let _ =
                        set.adjust_subtree_rates(ctx, cli_rtr_adr, RateSpec::ZERO.diff(&leaf_rates), topo);
                    set.remove_path(ctx, &path, topo)
                });
                drop(lock);
                cph.err_reply(pkt, "cannot find path to comtree");
                warn!("handle_join_comtree: {e}");
                return true;
            }
        };

        // configure the routers along the path
        let hops = self.path_hops(ctx, &path);
        if !self.add_path_config(comt, &hops, cph) {
            self.rollback_join(ctx, cli_adr, cli_rtr_adr, leaf_rates, &path, &mods, &[], comt, cph);
            drop(lock);
            cph.err_reply(pkt, "cannot configure comtree path");
            return false;
        }

        // all that's left is the comtree link to the client itself
        let llnk = match cph.process_reply(
            pkt,
            cph.add_comtree_link(Some(cli_rtr_adr), comt, None, None, Some((cli_ip, cli_port))),
            "client router could not add client comtree link",
        ) {
            Some(rep) => rep.link.unwrap_or(0),
            None => {
                self.rollback_join(
                    ctx, cli_adr, cli_rtr_adr, leaf_rates, &path, &mods, &hops, comt, cph,
                );
                return false;
            }
        };
        if cph
            .process_reply(
                pkt,
                cph.mod_comtree_link(Some(cli_rtr_adr), comt, llnk, leaf_rates),
                "client router could not setup client comtree link",
            )
            .is_none()
        {
            self.rollback_join(ctx, cli_adr, cli_rtr_adr, leaf_rates, &path, &mods, &hops, comt, cph);
            return false;
        }
        let _ = self
            .view
            .comtrees()
            .with_set(|s| s.set_parent(ctx, cli_adr, cli_rtr_adr, llnk));

        drop(lock);
        cph.send_reply(
            CtlMsg::pos_reply(CtlMsgType::ClientJoinComtree, cp.seq),
            Some(cli_adr),
        );
        true
    }

    /// Undo everything a failed join has done so far: tear the configured
    /// hops back down, release the rate mods, detach the leaf, and remove
    /// the reserved path.
    #[allow(clippy::too_many_arguments)]
    fn rollback_join(
        &self,
        ctx: Ctx,
        cli_adr: ForestAddr,
        cli_rtr_adr: ForestAddr,
        leaf_rates: RateSpec,
        path: &[LinkMod],
        mods: &[crate::comtree::RateMod],
        configured: &[PathHop],
        comt: ComtreeNum,
        cph: &mut CfgHandler,
    ) {
        if !configured.is_empty() {
            self.drop_path_config(comt, configured, cph);
        }
        let _ = self.view.with_state(|topo, set| {
            let _ = set.unprovision_mods(ctx, mods, topo);
            release_static_leaf_link(set, ctx, cli_adr, topo);
            let _ = set.remove_node(ctx, cli_adr, topo);
            let _ = set.adjust_subtree_rates(
                ctx,
                cli_rtr_adr,
                RateSpec::ZERO.diff(&leaf_rates),
                topo,
            );
            set.remove_path(ctx, path, topo)
        });
    }

    /// Handle a request by a client to leave a comtree.
    fn handle_leave_comtree(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        let (comt, cli_ip, cli_port) = match (cp.req_comtree(), cp.req_ip1(), cp.req_port1()) {
            (Ok(c), Ok(ip), Ok(port)) => (c, ip, port),
            _ => {
                cph.err_reply(pkt, "required attribute is missing");
                return true;
            }
        };
        let cli_adr = pkt.src;
        let cli_rtr = match self.view.with_topo(|t| t.router_for_leaf_addr(cli_adr)) {
            Some(r) => r,
            None => {
                cph.err_reply(pkt, "can't find client's access router");
                error!("handle_leave_comtree: no access router for {cli_adr}");
                return false;
            }
        };
        let cli_rtr_adr = self.view.with_topo(|t| t.node_addr(cli_rtr));

        let lock = match self.view.comtrees().acquire(comt) {
            Some(l) => l,
            None => {
                cph.err_reply(pkt, "invalid comtree for this client");
                return true;
            }
        };
        let ctx = lock.ctx();
        if !self.view.comtrees().with_set(|s| s.is_comt_leaf(ctx, cli_adr)) {
            drop(lock);
            cph.err_reply(pkt, "invalid comtree for this client");
            return true;
        }

        // drop the client's access link at its router
        if cph
            .process_reply(
                pkt,
                cph.drop_comtree_link(Some(cli_rtr_adr), comt, None, Some((cli_ip, cli_port))),
                "could not drop client comtree link",
            )
            .is_none()
        {
            return false;
        }

        // update the books: detach leaf, release its rates up the tree
        let leaf_rates = self.view.comtrees().with_set(|s| s.link_rates(ctx, cli_adr));
        let auto =
            self.view.comtrees().with_set(|s| s.config_mode(ctx) == ConfigMode::Auto);
        let adjusted = self.view.with_state(|topo, set| {
            release_static_leaf_link(set, ctx, cli_adr, topo);
            set.remove_node(ctx, cli_adr, topo)?;
            set.adjust_subtree_rates(ctx, cli_rtr_adr, RateSpec::ZERO.diff(&leaf_rates), topo)?;
            if auto {
                let mods = set.compute_mods(ctx, topo)?;
                set.provision_mods(ctx, &mods, topo)?;
            }
            Ok::<_, crate::types::ComtreeError>(())
        });
        if let Err(e) = adjusted {
            drop(lock);
            cph.err_reply(pkt, "internal error while leaving comtree");
            error!("handle_leave_comtree: {e}");
            return false;
        }

        // prune the now-unused tail of the tree
        let path = self
            .view
            .with_state(|topo, set| set.teardown_path(ctx, cli_rtr, topo));
        let mut status = true;
        if !path.is_empty() {
            let hops = self.path_hops(ctx, &path);
            status &= self.drop_path_config(comt, &hops, cph);
            status &= self
                .view
                .with_state(|topo, set| set.remove_path(ctx, &path, topo))
                .is_ok();
        }

        drop(lock);
        cph.send_reply(
            CtlMsg::pos_reply(CtlMsgType::ClientLeaveComtree, cp.seq),
            Some(cli_adr),
        );
        status
    }

    // ********************
    // * Path config      *
    // ********************

    /// Snapshot everything needed to configure the hops of a path.
    fn path_hops(&self, ctx: Ctx, path: &[LinkMod]) -> Vec<PathHop> {
        self.view.with_state(|topo, set| {
            path.iter()
                .filter_map(|lm| {
                    let parent = topo.peer(lm.child, lm.lnk).ok()?;
                    let child_adr = topo.node_addr(lm.child);
                    let parent_adr = topo.node_addr(parent);
                    Some(PathHop {
                        lnk: lm.lnk,
                        child_adr,
                        parent_adr,
                        llnum_child: topo.llnum(lm.lnk, lm.child),
                        llnum_parent: topo.llnum(lm.lnk, parent),
                        rates: set.link_rates(ctx, child_adr),
                        child_core: set.is_core_node(ctx, child_adr),
                        parent_core: set.is_core_node(ctx, parent_adr),
                    })
                })
                .collect()
        })
    }

    /// Configure the routers along a path, shallow end first. For each hop:
    /// attach the link at the parent, then create the comtree at the child,
    /// attach its parent link, and set its comtree attributes. On the first
    /// failure the already-configured hops are torn back down.
    fn add_path_config(&self, comt: ComtreeNum, hops: &[PathHop], cph: &mut CfgHandler) -> bool {
        let mut done: Vec<PathHop> = Vec::new();
        for hop in hops.iter().rev() {
            let parent = Some(hop.parent_adr);
            let child = Some(hop.child_adr);
            let ok = request_ok(cph.add_comtree_link(
                parent,
                comt,
                Some(hop.llnum_parent),
                Some(hop.child_core),
                None,
            )) && request_ok(cph.mod_comtree_link(
                parent,
                comt,
                hop.llnum_parent,
                hop.rates,
            )) && request_ok(cph.add_comtree(child, comt))
                && request_ok(cph.add_comtree_link(
                    child,
                    comt,
                    Some(hop.llnum_child),
                    Some(hop.parent_core),
                    None,
                ))
                && request_ok(cph.mod_comtree(child, comt, hop.llnum_child, hop.child_core))
                && request_ok(cph.mod_comtree_link(
                    child,
                    comt,
                    hop.llnum_child,
                    hop.rates.flipped(),
                ));
            if !ok {
                // back out the partially configured hop, then the rest
                let _ = cph.drop_comtree(Some(hop.child_adr), comt);
                let _ =
                    cph.drop_comtree_link(Some(hop.parent_adr), comt, Some(hop.llnum_parent), None);
                done.reverse();
                self.drop_path_config(comt, &done, cph);
                return false;
            }
            done.push(hop.clone());
        }
        true
    }

    /// Tear down the router configuration of a path, deep end first: drop
    /// the comtree at each child and the comtree link at its parent.
    fn drop_path_config(&self, comt: ComtreeNum, hops: &[PathHop], cph: &mut CfgHandler) -> bool {
        let mut status = true;
        for hop in hops {
            status &= request_ok(cph.drop_comtree(Some(hop.child_adr), comt));
            status &= request_ok(cph.drop_comtree_link(
                Some(hop.parent_adr),
                comt,
                Some(hop.llnum_parent),
                None,
            ));
        }
        status
    }

    // ********************
    // * Leaf handlers    *
    // ********************

    /// Handle a new session request: pick the access router from the
    /// client's IP prefix, configure a new leaf link there, and return the
    /// assigned address and nonce.
    fn handle_new_session(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        let cli_ip = match cp.req_ip1() {
            Ok(ip) => ip,
            Err(_) => {
                cph.err_reply(pkt, "missing required attribute");
                return true;
            }
        };
        let rtr_adr = match self.prefixes.lookup(cli_ip) {
            Some(a) => a,
            None => {
                cph.err_reply(pkt, "No router assigned to client's IP");
                return true;
            }
        };
        let rtr = match self.view.with_topo(|t| t.node_by_addr(rtr_adr)) {
            Some(r) => r,
            None => {
                cph.err_reply(pkt, "No router assigned to client's IP");
                return true;
            }
        };
        let iface = match self.view.with_topo(|t| t.first_iface(rtr)) {
            Some(i) => i,
            None => {
                cph.err_reply(pkt, "router has no usable interface");
                return true;
            }
        };
        let rates = cp
            .rates1
            .unwrap_or_else(|| self.view.with_topo(|t| t.default_leaf_rates()));
        let nonce = generate_nonce();

        let client_adr = match self.setup_leaf(None, pkt, rtr, iface, nonce, rates, false, cph) {
            Some(a) => a,
            None => return false,
        };

        let (if_ip, if_port) = self.view.with_topo(|t| {
            t.iface(rtr, iface)
                .map(|i| (i.ip, i.port))
                .unwrap_or((Ipv4Addr::UNSPECIFIED, 0))
        });
        let reply = CtlMsg {
            adr1: Some(client_adr),
            adr2: Some(rtr_adr),
            adr3: Some(self.my_adr),
            ip1: Some(if_ip),
            port1: Some(if_port),
            nonce: Some(nonce),
            ..CtlMsg::pos_reply(CtlMsgType::NewSession, cp.seq)
        };
        cph.send_reply(reply, Some(pkt.src));
        true
    }

    /// Handle a cancel session request: drop the client's access link at
    /// its router.
    fn handle_cancel_session(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        let (client_adr, rtr_adr) = match (cp.req_adr1(), cp.req_adr2()) {
            (Ok(c), Ok(r)) => (c, r),
            _ => {
                cph.err_reply(pkt, "missing required attribute");
                return true;
            }
        };
        let in_range = self.view.with_topo(|t| {
            t.node_by_addr(rtr_adr)
                .and_then(|r| t.leaf_range(r).ok())
                .map(|(first, last)| first <= client_adr && client_adr <= last)
        });
        match in_range {
            None => {
                cph.err_reply(pkt, "no router with specified address");
                return false;
            }
            Some(false) => {
                cph.err_reply(pkt, "client address not in router's range");
                return false;
            }
            Some(true) => {}
        }
        if cph
            .process_reply(
                pkt,
                cph.drop_link(Some(rtr_adr), None, Some(client_adr)),
                "could not drop link at router",
            )
            .is_none()
        {
            return false;
        }
        cph.send_reply(
            CtlMsg::pos_reply(CtlMsgType::CancelSession, cp.seq),
            Some(pkt.src),
        );
        true
    }

    /// Relay a client connect/disconnect notification from a router to the
    /// client manager. The router gets its reply first; the notification to
    /// the client manager is forwarded once and not retried further.
    fn handle_con_disc(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        let typ = match cp.req_type() {
            Ok(t) => t,
            Err(_) => return false,
        };
        let client_adr = match cp.req_adr1() {
            Ok(a) => a,
            Err(_) => {
                cph.err_reply(pkt, "missing required attribute");
                return true;
            }
        };
        cph.send_reply(CtlMsg::pos_reply(typ, cp.seq), Some(pkt.src));

        let cli_mgr = match self.cli_mgr_adr {
            Some(a) => a,
            None => return true,
        };
        let disconnect = typ == CtlMsgType::ClientDisconnect;
        match cph.client_con_disc(Some(cli_mgr), disconnect, client_adr, pkt.src) {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Configure a new or pre-configured leaf at its access router: add the
    /// link, set its rates, and attach it to the connection and signaling
    /// comtrees (controllers also join the network signaling comtree).
    /// Returns the leaf's forest address, or `None` after the first failure
    /// (a negative reply has then already been sent to the requester).
    #[allow(clippy::too_many_arguments)]
    fn setup_leaf(
        &self,
        leaf: Option<NodeId>,
        pkt: &Packet,
        rtr: NodeId,
        iface: u32,
        nonce: u64,
        rates: RateSpec,
        use_tunnel: bool,
        cph: &mut CfgHandler,
    ) -> Option<ForestAddr> {
        let rtr_adr = self.view.with_topo(|t| t.node_addr(rtr));
        let dest = if use_tunnel { None } else { Some(rtr_adr) };

        let (leaf_type, leaf_llnk, leaf_adr, link_rates) = match leaf {
            None => (NodeType::Client, None, None, rates),
            Some(leaf) => self.view.with_topo(|t| {
                let lnk = t.access_link(leaf);
                (
                    t.node_type(leaf).unwrap_or(NodeType::Client),
                    lnk.map(|l| t.llnum(l, rtr)),
                    Some(t.node_addr(leaf)),
                    lnk.and_then(|l| t.link(l).ok().map(|li| li.rates)).unwrap_or(rates),
                )
            }),
        };
        let leaf_ip = leaf.and_then(|l| self.view.with_topo(|t| t.leaf_ip(l)));

        let rep = cph.process_reply(
            pkt,
            cph.add_link(dest, leaf_type, iface, leaf_llnk, leaf_ip, None, leaf_adr, nonce),
            "could not add link to leaf",
        )?;
        let llnk = leaf_llnk.or(rep.link).unwrap_or(0);
        let leaf_adr = leaf_adr.or(rep.adr1).unwrap_or_default();

        cph.process_reply(
            pkt,
            cph.mod_link(dest, llnk, link_rates),
            "could not set link rates",
        )?;

        let mut comts = vec![
            (CONNECT_COMT, "could not add leaf to connection comtree"),
            (CLIENT_SIG_COMT, "could not add leaf to client signaling comtree"),
        ];
        if leaf_type == NodeType::Controller {
            comts.push((NET_SIG_COMT, "could not add leaf to network signaling comtree"));
        }
        for (comt, errmsg) in comts {
            cph.process_reply(
                pkt,
                cph.add_comtree_link(dest, comt, Some(llnk), None, None),
                errmsg,
            )?;
            let comt_rates = self
                .view
                .comtrees()
                .acquire(comt)
                .map(|l| self.view.comtrees().with_set(|s| s.def_leaf_rates(l.ctx())))
                .unwrap_or(rates);
            cph.process_reply(
                pkt,
                cph.mod_comtree_link(dest, comt, llnk, comt_rates),
                "could not set rate on signaling comtree",
            )?;
        }
        Some(leaf_adr)
    }

    // ********************
    // * Boot handlers    *
    // ********************

    /// Handle a boot request from a pre-configured leaf node, identified by
    /// the source IP it booted from.
    fn handle_boot_leaf(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        cph.set_tunnel(pkt.tunnel());
        let leaf = self
            .view
            .with_topo(|t| t.leaves().find(|l| t.leaf_ip(*l) == Some(pkt.tun_ip)));
        let leaf = match leaf {
            Some(l) => l,
            None => {
                cph.err_reply(pkt, "unknown leaf address");
                return false;
            }
        };
        if self.view.with_topo(|t| t.status(leaf)) == NodeStatus::Up {
            // final reply lost or delayed; resend and quit
            cph.send_reply(CtlMsg::pos_reply(CtlMsgType::BootLeaf, cp.seq), None);
            return true;
        }

        let rtr_info = self.view.with_topo(|t| {
            let lnk = t.access_link(leaf)?;
            let rtr = t.peer(leaf, lnk).ok()?;
            Some((rtr, t.node_addr(rtr), t.status(rtr)))
        });
        let (rtr, rtr_adr, rtr_status) = match rtr_info {
            Some(i) => i,
            None => {
                cph.err_reply(pkt, "leaf has no access link");
                return false;
            }
        };
        self.view.with_topo(|t| t.set_status(leaf, NodeStatus::Booting));
        if rtr_status != NodeStatus::Up {
            cph.err_reply(pkt, "access router is not yet up");
            self.view.with_topo(|t| t.set_status(leaf, NodeStatus::Down));
            return false;
        }

        let iface = self.view.with_topo(|t| t.first_iface(rtr)).unwrap_or(1);
        let nonce = generate_nonce();
        let rates = self.view.with_topo(|t| t.default_leaf_rates());

        if self
            .setup_leaf(Some(leaf), pkt, rtr, iface, nonce, rates, true, cph)
            .is_none()
        {
            self.view.with_topo(|t| t.set_status(leaf, NodeStatus::Down));
            return false;
        }

        // hand the leaf its configuration, through the tunnel
        let (rtr_ip, rtr_port) = self.view.with_topo(|t| {
            t.iface(rtr, iface)
                .map(|i| (i.ip, i.port))
                .unwrap_or((Ipv4Addr::UNSPECIFIED, 0))
        });
        let leaf_adr = self.view.with_topo(|t| t.node_addr(leaf));
        if cph
            .process_reply(
                pkt,
                cph.config_leaf(None, leaf_adr, rtr_adr, rtr_ip, rtr_port, nonce),
                "could not configure leaf node",
            )
            .is_none()
        {
            self.view.with_topo(|t| t.set_status(leaf, NodeStatus::Down));
            return false;
        }

        cph.send_reply(CtlMsg::pos_reply(CtlMsgType::BootLeaf, cp.seq), None);
        self.view.with_topo(|t| t.set_status(leaf, NodeStatus::Up));
        info!("completed leaf boot request for {leaf_adr}");
        true
    }

    /// Handle a boot request from a router.
    ///
    /// The positive reply goes out first, carrying the router's leaf-address
    /// range, so the router knows it is approved; then the router's
    /// interface table, its links and every pre-configured comtree that
    /// includes it are pushed down, ending with BOOT_COMPLETE. Any failure
    /// sends BOOT_ABORT and marks the router down again.
    fn handle_boot_router(&self, pkt: &Packet, cp: &CtlMsg, cph: &mut CfgHandler) -> bool {
        cph.set_tunnel(pkt.tunnel());
        let rtr = match self.view.with_topo(|t| t.node_by_addr(pkt.src)) {
            Some(r) if self.view.with_topo(|t| t.is_router(r)) => r,
            _ => {
                cph.err_reply(pkt, "boot request from unknown router rejected");
                warn!("boot request from unknown router {}", pkt.src);
                return true;
            }
        };
        if self.view.with_topo(|t| t.status(rtr)) == NodeStatus::Up {
            // final reply lost or delayed; resend and quit
            cph.send_reply(CtlMsg::pos_reply(CtlMsgType::BootRouter, cp.seq), None);
            return true;
        }
        self.view.with_topo(|t| t.set_status(rtr, NodeStatus::Booting));

        // approve first, so the router knows to expect configuration
        let (first, last) = match self.view.with_topo(|t| t.leaf_range(rtr)) {
            Ok(r) => r,
            Err(_) => {
                cph.err_reply(pkt, "router has no leaf range");
                self.view.with_topo(|t| t.set_status(rtr, NodeStatus::Down));
                return false;
            }
        };
        let approve = CtlMsg {
            adr1: Some(first),
            adr2: Some(last),
            ..CtlMsg::pos_reply(CtlMsgType::BootRouter, cp.seq)
        };
        cph.send_reply(approve, None);

        if !self.configure_router(rtr, (first, last), cph) {
            let _ = cph.boot_abort(None);
            self.view.with_topo(|t| t.set_status(rtr, NodeStatus::Down));
            return false;
        }

        match cph.boot_complete(None) {
            Ok(rep) if rep.is_pos_reply() => {
                self.view.with_topo(|t| t.set_status(rtr, NodeStatus::Up));
                info!("completed boot request for {}", pkt.src);
                true
            }
            _ => {
                let _ = cph.boot_abort(None);
                self.view.with_topo(|t| t.set_status(rtr, NodeStatus::Down));
                false
            }
        }
    }

    /// Push the full configuration of a booting router: leaf range,
    /// interfaces, router-to-router links, and pre-configured comtrees.
    fn configure_router(
        &self,
        rtr: NodeId,
        leaf_range: (ForestAddr, ForestAddr),
        cph: &mut CfgHandler,
    ) -> bool {
        if !request_ok(cph.set_leaf_range(None, leaf_range.0, leaf_range.1)) {
            return false;
        }

        // add the interfaces; the router tells us the ports it bound
        let ifaces: Vec<(u32, Ipv4Addr, RateSpec)> = self.view.with_topo(|t| {
            (1..=t.num_ifaces(rtr))
                .filter(|i| t.valid_iface(rtr, *i))
                .filter_map(|i| t.iface(rtr, i).map(|ifc| (i, ifc.ip, ifc.rates)))
                .collect()
        });
        for (i, ip, rates) in ifaces {
            match cph.add_iface(None, i, ip, rates) {
                Ok(rep) if rep.is_pos_reply() => {
                    if let Some(port) = rep.port1 {
                        self.view.with_topo(|t| {
                            if let Some(ifc) = t.iface_mut(rtr, i) {
                                ifc.port = port;
                            }
                        });
                    }
                }
                _ => return false,
            }
        }

        // links to other routers
        let rtr_links: Vec<LinkId> = self.view.with_topo(|t| {
            t.links_at(rtr)
                .filter(|l| t.peer(rtr, *l).map(|p| t.is_router(p)).unwrap_or(false))
                .collect()
        });
        for lnk in rtr_links {
            if !self.setup_endpoint(lnk, rtr, cph) {
                return false;
            }
        }

        // pre-configured comtrees that include this router
        let rtr_adr = self.view.with_topo(|t| t.node_addr(rtr));
        let mut cursor = self.view.comtrees().first_comtree();
        while let Some(lock) = cursor {
            let ctx = lock.ctx();
            let member = self.view.comtrees().with_set(|s| s.is_comt_rtr(ctx, rtr_adr));
            if member && !self.setup_comtree(ctx, rtr, cph) {
                return false;
            }
            cursor = self.view.comtrees().next_comtree(lock);
        }

        // if this is our own access router, set up our own leaf link
        let me = self.view.with_topo(|t| {
            t.node_by_addr(self.my_adr).filter(|leaf| {
                t.access_link(*leaf)
                    .and_then(|l| t.peer(*leaf, l).ok())
                    .map(|p| p == rtr)
                    .unwrap_or(false)
            })
        });
        if let Some(me) = me {
            let iface = self.view.with_topo(|t| t.first_iface(rtr)).unwrap_or(1);
            let nonce = generate_nonce();
            let rates = self.view.with_topo(|t| t.default_leaf_rates());
            // craft a dummy request context for error reporting
            let pkt = Packet::signaling(
                CtlMsg::request(CtlMsgType::BootRouter),
                self.my_adr,
                self.my_adr,
            );
            if self
                .setup_leaf(Some(me), &pkt, rtr, iface, nonce, rates, true, cph)
                .is_none()
            {
                error!("cannot configure our own access link");
                return false;
            }
        }
        true
    }

    /// Configure one router-to-router link at a booting router. If the peer
    /// is already up, reuse the link's nonce and the peer's bound port; if
    /// not, mint a fresh nonce for the peer to use later.
    fn setup_endpoint(&self, lnk: LinkId, rtr: NodeId, cph: &mut CfgHandler) -> bool {
        let params = self.view.with_topo(|t| {
            let llnk = t.llnum(lnk, rtr);
            let iface = t.iface_for_llnum(rtr, llnk)?;
            let peer = t.peer(rtr, lnk).ok()?;
            let peer_adr = t.node_addr(peer);
            let plnk = t.llnum(lnk, peer);
            let peer_iface = t.iface_for_llnum(peer, plnk)?;
            let peer_ip = t.iface(peer, peer_iface).map(|i| i.ip)?;
            let peer_up = t.status(peer) == NodeStatus::Up;
            let peer_port = if peer_up {
                t.iface(peer, peer_iface).map(|i| i.port).unwrap_or(0)
            } else {
                0
            };
            let mut rs = t.link(lnk).ok()?.rates;
            if t.left(lnk).ok() == Some(rtr) {
                rs.flip();
            }
            Some((llnk, iface, peer_adr, peer_ip, peer_port, peer_up, rs))
        });
        let (llnk, iface, peer_adr, peer_ip, peer_port, peer_up, rs) = match params {
            Some(p) => p,
            None => return false,
        };
        let nonce = if peer_up {
            self.view.with_topo(|t| t.nonce(lnk).unwrap_or(0))
        } else {
            let n = generate_nonce();
            self.view.with_topo(|t| {
                let _ = t.set_nonce(lnk, n);
            });
            n
        };
        let port = if peer_port != 0 { Some(peer_port) } else { None };
        request_ok(cph.add_link(
            None,
            NodeType::Router,
            iface,
            Some(llnk),
            Some(peer_ip),
            port,
            Some(peer_adr),
            nonce,
        )) && request_ok(cph.mod_link(None, llnk, rs))
    }

    /// Push one pre-configured comtree down to a booting router: the
    /// comtree itself, each incident backbone link with its rates, and
    /// finally the parent link and core flag.
    fn setup_comtree(&self, ctx: Ctx, rtr: NodeId, cph: &mut CfgHandler) -> bool {
        let rtr_adr = self.view.with_topo(|t| t.node_addr(rtr));
        let (comt, plnk) = self
            .view
            .comtrees()
            .with_set(|s| (s.num(ctx), s.parent_link(ctx, rtr_adr)));

        if !request_ok(cph.add_comtree(None, comt)) {
            return false;
        }

        // incident backbone links and their rates, seen from this router
        let links: Vec<(u32, bool, RateSpec)> = self.view.with_state(|topo, set| {
            topo.links_at(rtr)
                .filter(|l| set.is_comt_link(ctx, *l, topo))
                .filter_map(|l| {
                    let peer = topo.peer(rtr, l).ok()?;
                    if !topo.is_router(peer) {
                        return None;
                    }
                    let peer_adr = topo.node_addr(peer);
                    let llnk = topo.llnum(l, rtr);
                    let peer_core = set.is_core_node(ctx, peer_adr);
                    let rs = if Some(l) == plnk {
                        set.link_rates(ctx, rtr_adr).flipped()
                    } else {
                        set.link_rates(ctx, peer_adr)
                    };
                    Some((llnk, peer_core, rs))
                })
                .collect()
        });
        for (llnk, peer_core, rs) in links {
            if !request_ok(cph.add_comtree_link(None, comt, Some(llnk), Some(peer_core), None)) {
                return false;
            }
            if !request_ok(cph.mod_comtree_link(None, comt, llnk, rs)) {
                return false;
            }
        }

        let parent_llnk = plnk
            .map(|l| self.view.with_topo(|t| t.llnum(l, rtr)))
            .unwrap_or(0);
        let core = self.view.comtrees().with_set(|s| s.is_core_node(ctx, rtr_adr));
        request_ok(cph.mod_comtree(None, comt, parent_llnk, core))
    }
}

/// True when the request got a positive reply.
fn request_ok(reply: Result<CtlMsg, crate::types::ProtoError>) -> bool {
    matches!(reply, Ok(rep) if rep.is_pos_reply())
}

/// Credit the access link of a static leaf with its comtree rates. Dynamic
/// leaves have no link in the topology; the router accounts for them.
fn release_static_leaf_link(
    set: &mut crate::comtree::ComtreeSet,
    ctx: Ctx,
    leaf: ForestAddr,
    topo: &mut crate::topology::Topology,
) {
    adjust_static_leaf_link(set, ctx, leaf, topo, true)
}

/// Debit the access link of a static leaf with its comtree rates.
fn reserve_static_leaf_link(
    set: &mut crate::comtree::ComtreeSet,
    ctx: Ctx,
    leaf: ForestAddr,
    topo: &mut crate::topology::Topology,
) {
    adjust_static_leaf_link(set, ctx, leaf, topo, false)
}

fn adjust_static_leaf_link(
    set: &mut crate::comtree::ComtreeSet,
    ctx: Ctx,
    leaf: ForestAddr,
    topo: &mut crate::topology::Topology,
    credit: bool,
) {
    let node = match topo.node_by_addr(leaf) {
        Some(n) => n,
        None => return,
    };
    let lnk = match topo.access_link(node) {
        Some(l) => l,
        None => return,
    };
    let mut rs = set.link_rates(ctx, leaf);
    if topo.left(lnk).ok() != Some(node) {
        rs.flip();
    }
    if let Ok(link) = topo.link_mut(lnk) {
        if credit {
            link.avail.add(rs);
        } else {
            link.avail.subtract(rs);
        }
    }
}
