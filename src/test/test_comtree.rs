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

//! Tests for the comtree table, its locking, and the comtree file format.

use std::collections::BTreeSet;
use std::time::Duration;

use maplit::btreeset;
use pretty_assertions::assert_eq;

use crate::comtree::{ComtreeSet, ComtreeTable, ConfigMode};
use crate::topology::Topology;
use crate::types::{ForestAddr, NodeType, RateSpec};

/// # Test network
///
/// ```text
/// r1.2 --- r2.1   r2.2 --- r3.1   r3.2 --- netMgr
/// ```
///
/// All routers in zip 1; netMgr is a controller leaf at r3.
const TOPO_FILE: &str = r#"
router(r1, 1.1, (0.0,0.0), (1.10-1.99),
	[ 1, 10.0.0.1, 1-30, (50000,30000,25000,15000) ] )
router(r2, 1.2, (0.0,0.0), (1.100-1.199),
	[ 1, 10.0.0.2, 1-30, (50000,30000,25000,15000) ] )
router(r3, 1.3, (0.0,0.0), (1.200-1.299),
	[ 1, 10.0.0.3, 1-30, (50000,30000,25000,15000) ] )
leaf(netMgr, controller, 192.168.1.3, 1.200, (0.0,0.0))
link(r2.1,r1.2,1,(100,100,100,100))
link(r3.1,r2.2,1,(100,100,100,100))
link(netMgr,r3.2,1,(100,100,100,100))
defaultLinkRates(5,5,5,5)
;
"#;

fn get_test_topo() -> Topology {
    let topo = Topology::read(TOPO_FILE).expect("test topology should parse");
    assert!(topo.check());
    topo
}

const COMT_FILE: &str = r#"
#       num, owner, root, mode,  backbone rates, leaf rates
comtree(1001, netMgr, r1, auto,
	(10,10,10,10),
	(5,5,5,5),
	(r2),
	(r2.1,r1.2,(10,10,10,10)),
	(r3.1,r2.2),
	(netMgr,r3.2)
)
;
"#;

#[test]
fn table_basics() {
    let topo = get_test_topo();
    let mut set = ComtreeSet::new();
    let ctx = set.add_comtree(1001).unwrap();
    assert!(set.add_comtree(1001).is_err());
    assert_eq!(set.lookup(1001), Some(ctx));
    assert_eq!(set.num(ctx), 1001);

    let r1 = ForestAddr::new(1, 1);
    set.set_root(ctx, r1);
    set.set_owner(ctx, ForestAddr::new(1, 200));
    set.set_config_mode(ctx, ConfigMode::Auto);
    set.add_node(ctx, r1, &topo).unwrap();
    set.add_core_node(ctx, r1, &topo).unwrap();
    assert!(set.is_comt_rtr(ctx, r1));
    assert!(set.is_core_node(ctx, r1));
    assert_eq!(set.link_cnt(ctx, r1), 0);
    assert_eq!(set.parent_link(ctx, r1), None);

    set.remove_comtree(ctx);
    assert_eq!(set.lookup(1001), None);
    // the dense slot is reused
    let ctx2 = set.add_comtree(2002).unwrap();
    assert_eq!(ctx2.index(), ctx.index());
}

#[test]
fn read_comtree_file() {
    let mut topo = get_test_topo();
    let set = ComtreeSet::read(COMT_FILE, &mut topo).expect("comtree file should parse");

    let ctx = set.lookup(1001).expect("comtree 1001 exists");
    let r1 = ForestAddr::new(1, 1);
    let r2 = ForestAddr::new(1, 2);
    let r3 = ForestAddr::new(1, 3);
    let nm = ForestAddr::new(1, 200);

    assert_eq!(set.root(ctx), r1);
    assert_eq!(set.owner(ctx), nm);
    assert_eq!(set.config_mode(ctx), ConfigMode::Auto);
    assert_eq!(set.def_bb_rates(ctx), RateSpec::new(10, 10, 10, 10));
    assert_eq!(set.def_leaf_rates(ctx), RateSpec::new(5, 5, 5, 5));

    // membership and the core set
    assert!(set.is_comt_rtr(ctx, r1));
    assert!(set.is_comt_rtr(ctx, r2));
    assert!(set.is_comt_rtr(ctx, r3));
    assert!(set.is_comt_leaf(ctx, nm));
    assert_eq!(set.cores(ctx).collect::<BTreeSet<_>>(), btreeset! {r1, r2});
    assert!(!set.is_core_node(ctx, r3));

    // tree structure
    assert_eq!(set.parent(ctx, r2, &topo), Some(r1));
    assert_eq!(set.parent(ctx, r3, &topo), Some(r2));
    assert_eq!(set.parent(ctx, nm, &topo), Some(r3));
    assert_eq!(set.link_cnt(ctx, r1), 1);
    assert_eq!(set.link_cnt(ctx, r2), 2);
    assert_eq!(set.link_cnt(ctx, r3), 2);

    // subtree rates aggregate the one leaf
    let leaf = RateSpec::new(5, 5, 5, 5);
    assert_eq!(set.subtree_rates(ctx, r3), leaf);
    assert_eq!(set.subtree_rates(ctx, r2), leaf);
    assert_eq!(set.subtree_rates(ctx, r1), leaf);

    // r2's explicit rates are frozen; r3's were recomputed by auto mode
    assert!(set.is_frozen(ctx, r2));
    assert!(!set.is_frozen(ctx, r3));
    assert_eq!(set.link_rates(ctx, r2), RateSpec::new(10, 10, 10, 10));
    assert_eq!(set.link_rates(ctx, r3), RateSpec::new(5, 0, 5, 0));

    // capacity was reserved on the underlay
    let r1n = topo.node_by_name("r1").unwrap();
    let r2n = topo.node_by_name("r2").unwrap();
    let r3n = topo.node_by_name("r3").unwrap();
    let l12 = topo.find_link(r2n, r1n).unwrap();
    let l23 = topo.find_link(r3n, r2n).unwrap();
    assert_eq!(
        topo.avail_rates(l12).unwrap(),
        RateSpec::new(90, 90, 90, 90)
    );
    // r3 is the left (child) endpoint of l23: (5,0,5,0) from its side
    assert_eq!(
        topo.avail_rates(l23).unwrap(),
        RateSpec::new(95, 100, 95, 100)
    );

    // full verification passes
    assert!(set.check(&topo));
    assert!(set.check_link_counts(ctx, &topo));
    assert!(set.check_subtree_rates(ctx, &topo));
    assert!(set.check_link_rates(ctx));
}

#[test]
fn comtree_file_round_trips() {
    let mut topo = get_test_topo();
    let first = ComtreeSet::read(COMT_FILE, &mut topo).unwrap();
    let text = first.to_file_string(&topo);

    let mut topo2 = get_test_topo();
    let second = ComtreeSet::read(&text, &mut topo2)
        .unwrap_or_else(|e| panic!("rewritten comtree file bad: {e}\n{text}"));

    let c1 = first.lookup(1001).unwrap();
    let c2 = second.lookup(1001).unwrap();
    assert_eq!(first.root(c1), second.root(c2));
    assert_eq!(first.owner(c1), second.owner(c2));
    assert_eq!(first.config_mode(c1), second.config_mode(c2));
    let cores1: Vec<_> = first.cores(c1).collect();
    let cores2: Vec<_> = second.cores(c2).collect();
    assert_eq!(cores1, cores2);
    let rtrs1: Vec<_> = first.comt_routers(c1).collect();
    let rtrs2: Vec<_> = second.comt_routers(c2).collect();
    assert_eq!(rtrs1, rtrs2);
    for r in rtrs1 {
        assert_eq!(first.rtr_info(c1, r), second.rtr_info(c2, r), "router {r}");
    }
    let leaves1: Vec<_> = first.comt_leaves(c1).collect();
    let leaves2: Vec<_> = second.comt_leaves(c2).collect();
    assert_eq!(leaves1, leaves2);
    for l in leaves1 {
        assert_eq!(first.leaf_info(c1, l), second.leaf_info(c2, l), "leaf {l}");
    }
}

#[test]
fn one_file_carries_topology_and_comtrees() {
    // the network file holds both sections, each terminated by `;`
    let combined = format!("{TOPO_FILE}{COMT_FILE}");
    let (mut topo, rest) = Topology::read_section(&combined).expect("topology section parses");
    assert!(topo.check());
    assert!(rest.contains("comtree"));

    let set = ComtreeSet::read(rest, &mut topo).expect("comtree section parses");
    let ctx = set.lookup(1001).expect("comtree 1001 exists");
    assert_eq!(set.root(ctx), ForestAddr::new(1, 1));
    assert!(set.check(&topo));

    // a file without a comtree section yields an empty set
    let (mut topo, rest) = Topology::read_section(TOPO_FILE).unwrap();
    let set = ComtreeSet::read(rest, &mut topo).unwrap();
    assert!(set.is_empty());
}

#[test]
fn startup_fails_without_capacity() {
    let text = r#"
router(r1, 1.1, (0.0,0.0), (1.10-1.99),
	[ 1, 10.0.0.1, 1-30, (50000,30000,25000,15000) ] )
router(r2, 1.2, (0.0,0.0), (1.100-1.199),
	[ 1, 10.0.0.2, 1-30, (50000,30000,25000,15000) ] )
link(r2.1,r1.2,1,(4,4,4,4))
defaultLinkRates(1,1,1,1)
;
"#;
    let mut topo = Topology::read(text).unwrap();
    let comt = r#"
comtree(1001, r1, r1, manual, (10,10,10,10), (1,1,1,1),, (r2.1,r1.2)) ;
"#;
    assert!(ComtreeSet::read(comt, &mut topo).is_err());
}

#[test]
fn busy_flag_serializes_access() {
    let mut set = ComtreeSet::new();
    set.add_comtree(1001).unwrap();
    let table = ComtreeTable::new(set);

    let table = &table;
    let (started_tx, started_rx) = crossbeam::channel::bounded(1);
    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            let lock = table.acquire(1001).expect("comtree exists");
            started_tx.send(()).unwrap();
            // hold the comtree until the main thread says so
            release_rx.recv().unwrap();
            drop(lock);
        });
        started_rx.recv().unwrap();

        // a second acquire must block until the holder is done
        let (locked_tx, locked_rx) = crossbeam::channel::bounded(1);
        s.spawn(move |_| {
            let lock = table.acquire(1001).expect("comtree exists");
            locked_tx.send(()).unwrap();
            drop(lock);
        });
        assert!(
            locked_rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "second acquire should still be blocked"
        );
        release_tx.send(()).unwrap();
        assert!(
            locked_rx.recv_timeout(Duration::from_secs(2)).is_ok(),
            "second acquire should proceed after release"
        );
    })
    .unwrap();
}

#[test]
fn acquire_unknown_comtree() {
    let table = ComtreeTable::new(ComtreeSet::new());
    assert!(table.acquire(42).is_none());
}

#[test]
fn iteration_visits_every_comtree() {
    let mut set = ComtreeSet::new();
    set.add_comtree(1001).unwrap();
    set.add_comtree(1002).unwrap();
    set.add_comtree(1003).unwrap();
    let table = ComtreeTable::new(set);

    let mut seen = Vec::new();
    let mut cursor = table.first_comtree();
    while let Some(lock) = cursor {
        seen.push(table.with_set(|s| s.num(lock.ctx())));
        cursor = table.next_comtree(lock);
    }
    assert_eq!(seen, vec![1001, 1002, 1003]);
}

#[test]
fn dynamic_leaves_are_tracked_without_topology_nodes() {
    let topo = get_test_topo();
    let mut set = ComtreeSet::new();
    let ctx = set.add_comtree(1001).unwrap();
    set.set_root(ctx, ForestAddr::new(1, 3));
    set.set_def_rates(ctx, RateSpec::new(10, 10, 10, 10), RateSpec::new(5, 5, 5, 5));
    set.add_node(ctx, ForestAddr::new(1, 3), &topo).unwrap();

    // a dynamic client: no node in the topology
    let client = ForestAddr::new(1, 250);
    assert_eq!(topo.node_by_addr(client), None);
    set.add_node(ctx, client, &topo).unwrap();
    set.set_parent(ctx, client, ForestAddr::new(1, 3), 7).unwrap();
    assert!(set.is_comt_leaf(ctx, client));
    assert_eq!(set.leaf_info(ctx, client).unwrap().llnk, 7);
    assert_eq!(set.link_cnt(ctx, ForestAddr::new(1, 3)), 1);

    set.remove_node(ctx, client, &topo).unwrap();
    assert!(!set.is_comt_leaf(ctx, client));
    assert_eq!(set.link_cnt(ctx, ForestAddr::new(1, 3)), 0);
}

#[test]
fn leaf_type_matters_for_membership() {
    let topo = get_test_topo();
    let mut set = ComtreeSet::new();
    let ctx = set.add_comtree(7).unwrap();
    // a leaf cannot be a core node
    let nm = ForestAddr::new(1, 200);
    assert!(set.add_core_node(ctx, nm, &topo).is_err());
    assert_eq!(topo.node_type(topo.node_by_addr(nm).unwrap()), Some(NodeType::Controller));
}
