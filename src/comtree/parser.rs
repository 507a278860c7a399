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

//! Reader and writer for the comtree file format.
//!
//! A comtree section is a sequence of `comtree(...)` records terminated by
//! `;`. It normally follows the topology section in the same network file
//! ([`Topology::read_section`] hands back the unconsumed remainder).
//! Each record names the comtree number, owner, root, configuration mode and
//! the default backbone and leaf rates, optionally followed by a list of
//! extra core nodes and a list of comtree links. A link with an explicit
//! rate spec is *frozen*: the auto-mode algorithm leaves it alone. The first
//! endpoint of a link is the child.
//!
//! To omit the core-node list while giving links, write two consecutive
//! commas after the leaf default rates.

use itertools::Itertools;

use crate::comtree::{ComtreeSet, ConfigMode, Ctx};
use crate::topology::parser::{FileError, Tokenizer};
use crate::topology::Topology;
use crate::types::{LinkId, NodeId, RateSpec};

struct LinkEntry {
    lnk: LinkId,
    child: NodeId,
    rates: Option<RateSpec>,
}

impl ComtreeSet {
    /// Read a comtree set from the textual file format, then verify it and
    /// reserve the underlay capacity for every comtree.
    ///
    /// Must run single-threaded at startup, before workers exist.
    pub fn read(input: &str, topo: &mut Topology) -> Result<ComtreeSet, FileError> {
        let mut set = ComtreeSet::new();
        let mut tok = Tokenizer::new(input);
        loop {
            if tok.at_end() || tok.verify(';') {
                break;
            }
            let word = tok.word()?;
            match word.as_str() {
                "comtree" => read_comtree(&mut tok, &mut set, topo)?,
                other => return Err(FileError::UnknownKeyword(other.to_string())),
            }
        }
        // auto-mode rates must be in place before the consistency checks
        let ctxs: Vec<Ctx> = set.comtrees().collect();
        for ctx in ctxs {
            if set.config_mode(ctx) == ConfigMode::Auto {
                set.set_auto_config_rates(ctx);
            }
        }
        if !set.check(topo) {
            return Err(FileError::CheckFailed);
        }
        set.set_all_comt_rates(topo)?;
        Ok(set)
    }

    /// Write the comtree set in its file format. Dynamic leaves (not part of
    /// the topology) are omitted; everything else reads back to the same
    /// state.
    pub fn to_file_string(&self, topo: &Topology) -> String {
        let mut out = String::new();
        for ctx in self.comtrees() {
            out.push_str(&self.comt_to_string(ctx, topo));
        }
        out.push_str(";\n");
        out
    }

    fn comt_to_string(&self, ctx: Ctx, topo: &Topology) -> String {
        use std::fmt::Write;

        let mut s = String::new();
        let owner = topo
            .node_by_addr(self.owner(ctx))
            .map(|n| topo.node_name(n).to_string())
            .unwrap_or_else(|| self.owner(ctx).to_string());
        let root = self.root(ctx);
        let root_name = topo
            .node_by_addr(root)
            .map(|n| topo.node_name(n).to_string())
            .unwrap_or_else(|| root.to_string());
        let _ = write!(
            s,
            "comtree({},{},{},{},{},{}",
            self.num(ctx),
            owner,
            root_name,
            self.config_mode(ctx),
            self.def_bb_rates(ctx),
            self.def_leaf_rates(ctx)
        );

        let extra_cores: Vec<_> = self.cores(ctx).filter(|c| *c != root).collect();
        if !extra_cores.is_empty() {
            let names = extra_cores
                .iter()
                .filter_map(|c| topo.node_by_addr(*c))
                .map(|n| topo.node_name(n))
                .join(",");
            let _ = write!(s, ",\n\t({names})");
        } else {
            s.push(',');
        }

        // backbone links, child endpoint first; rates only when frozen
        for radr in self.comt_routers(ctx).sorted() {
            let plnk = match self.parent_link(ctx, radr) {
                Some(p) => p,
                None => continue,
            };
            let child = match topo.node_by_addr(radr) {
                Some(n) => n,
                None => continue,
            };
            let parent = match topo.peer(child, plnk) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let _ = write!(
                s,
                ",\n\t({}.{},{}.{}",
                topo.node_name(child),
                topo.llnum(plnk, child),
                topo.node_name(parent),
                topo.llnum(plnk, parent)
            );
            if self.is_frozen(ctx, radr) {
                let _ = write!(s, ",{}", self.link_rates(ctx, radr));
            }
            s.push(')');
        }
        // static leaf links, always with their rates
        for ladr in self.comt_leaves(ctx).sorted() {
            let leaf = match topo.node_by_addr(ladr) {
                Some(n) => n,
                None => continue, // dynamic leaf
            };
            let cli = match self.leaf_info(ctx, ladr) {
                Some(c) => c,
                None => continue,
            };
            let parent = match topo.node_by_addr(cli.parent) {
                Some(n) => n,
                None => continue,
            };
            let _ = write!(
                s,
                ",\n\t({},{}.{},{}",
                topo.node_name(leaf),
                topo.node_name(parent),
                cli.llnk,
                cli.plnk_rates
            );
            s.push(')');
        }
        s.push_str("\n)\n");
        s
    }
}

fn read_comtree(
    tok: &mut Tokenizer,
    set: &mut ComtreeSet,
    topo: &mut Topology,
) -> Result<(), FileError> {
    tok.expect('(', "( after comtree")?;
    let num = tok.uint()? as u32;
    tok.expect(',', "comma after comtree number")?;
    let owner_name = tok.word()?;
    tok.expect(',', "comma after owner")?;
    let root_name = tok.word()?;
    tok.expect(',', "comma after root")?;
    let mode = match tok.word()?.as_str() {
        "auto" => ConfigMode::Auto,
        "manual" => ConfigMode::Manual,
        _ => return Err(FileError::Expected("configuration mode auto or manual")),
    };
    tok.expect(',', "comma after mode")?;
    let bb_rates = tok.rate_spec()?;
    tok.expect(',', "comma after backbone rates")?;
    let leaf_rates = tok.rate_spec()?;

    // optional list of extra core nodes; a pair of commas omits the list
    // while still allowing links
    let mut core_names = Vec::new();
    let mut have_more = tok.verify(',');
    if have_more {
        if tok.verify('(') {
            if !tok.verify(')') {
                loop {
                    core_names.push(tok.word()?);
                    if tok.verify(')') {
                        break;
                    }
                    tok.expect(',', "comma in core node list")?;
                }
            }
        }
        have_more = tok.verify(',');
    }

    // optional list of links
    let mut links: Vec<LinkEntry> = Vec::new();
    while have_more {
        links.push(read_link(tok, topo)?);
        have_more = tok.verify(',');
    }
    tok.expect(')', ") after comtree")?;

    let owner = topo
        .node_by_name(&owner_name)
        .map_err(|_| FileError::UnknownNode(owner_name))?;
    let root = topo
        .node_by_name(&root_name)
        .map_err(|_| FileError::UnknownNode(root_name))?;

    let ctx = set.add_comtree(num)?;
    set.set_owner(ctx, topo.node_addr(owner));
    set.set_root(ctx, topo.node_addr(root));
    set.set_config_mode(ctx, mode);
    set.set_def_rates(ctx, bb_rates, leaf_rates);

    let root_adr = topo.node_addr(root);
    set.add_node(ctx, root_adr, topo)?;
    set.add_core_node(ctx, root_adr, topo)?;
    for name in core_names {
        let core = topo
            .node_by_name(&name)
            .map_err(|_| FileError::UnknownNode(name))?;
        let core_adr = topo.node_addr(core);
        set.add_node(ctx, core_adr, topo)?;
        set.add_core_node(ctx, core_adr, topo)?;
    }

    for entry in links {
        let parent = topo.peer(entry.child, entry.lnk)?;
        let child_adr = topo.node_addr(entry.child);
        let parent_adr = topo.node_addr(parent);
        set.add_node(ctx, child_adr, topo)?;
        set.add_node(ctx, parent_adr, topo)?;
        let sub = if topo.is_leaf(entry.child) {
            let rates = entry.rates.unwrap_or(leaf_rates);
            set.set_leaf_rates(ctx, child_adr, rates);
            set.set_parent(ctx, child_adr, parent_adr, topo.llnum(entry.lnk, parent))?;
            rates
        } else {
            set.set_plink(ctx, child_adr, Some(entry.lnk), topo)?;
            let rates = match entry.rates {
                Some(r) => {
                    set.freeze(ctx, child_adr);
                    r
                }
                None => bb_rates,
            };
            set.set_link_rates(ctx, child_adr, rates);
            set.subtree_rates(ctx, child_adr)
        };
        set.adjust_subtree_rates(ctx, parent_adr, sub.diff(&RateSpec::ZERO), topo)?;
    }
    Ok(())
}

fn read_link(tok: &mut Tokenizer, topo: &Topology) -> Result<LinkEntry, FileError> {
    tok.expect('(', "( before comtree link")?;
    let (name_l, num_l) = tok.link_endpoint()?;
    tok.expect(',', "comma after child endpoint")?;
    let (name_r, num_r) = tok.link_endpoint()?;
    let rates = if tok.verify(',') {
        Some(tok.rate_spec()?)
    } else {
        None
    };
    tok.expect(')', ") after comtree link")?;

    let child = topo
        .node_by_name(&name_l)
        .map_err(|_| FileError::UnknownNode(name_l.clone()))?;
    let parent = topo
        .node_by_name(&name_r)
        .map_err(|_| FileError::UnknownNode(name_r.clone()))?;
    if !topo.is_router(parent) {
        return Err(FileError::InvalidLink(name_l, name_r));
    }
    let lnk = topo
        .link_num(child, num_l)
        .ok_or_else(|| FileError::InvalidLink(name_l.clone(), name_r.clone()))?;
    if topo.link_num(parent, num_r) != Some(lnk) {
        return Err(FileError::InvalidLink(name_l, name_r));
    }
    Ok(LinkEntry {
        lnk,
        child,
        rates,
    })
}
