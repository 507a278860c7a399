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

//! Tests for the topology structure and its file format.

use pretty_assertions::assert_eq;

use crate::topology::Topology;
use crate::types::{ForestAddr, NodeStatus, NodeType, RateSpec};

/// # Test network
///
/// ```text
/// netMgr ---- salt.2    salt.1 ---- kauai.1
/// ```
const TOPO_FILE: &str = r#"
# a small test network
router(salt, 2.1000, (40.0,-50.0), (2.1-2.200),
	[ 1, 193.168.3.4, 1, (50000,30000,25000,15000) ],
	[ 2, 193.168.3.5, 2-30, (50000,30000,25000,15000) ] )
router(kauai, 3.1000, (40.0,-50.0), (3.1-3.200),
	[ 1, 193.168.5.6, 1-30, (50000,30000,25000,15000) ] )
leaf(netMgr, controller, 192.168.1.3, 2.100, (40.0,-50.0))
link(netMgr,salt.2,1000,(3000,3000,5000,5000))
link(salt.1,kauai.1,2000,(40000,40000,20000,20000))
defaultLinkRates(50,500,25,250)
;
"#;

#[test]
fn read_topology_file() {
    let topo = Topology::read(TOPO_FILE).expect("topology file should parse");

    let salt = topo.node_by_name("salt").unwrap();
    let kauai = topo.node_by_name("kauai").unwrap();
    let nm = topo.node_by_name("netMgr").unwrap();

    assert!(topo.is_router(salt));
    assert!(topo.is_router(kauai));
    assert!(topo.is_leaf(nm));
    assert!(topo.is_controller(nm));
    assert_eq!(topo.node_type(nm), Some(NodeType::Controller));

    assert_eq!(topo.node_addr(salt), ForestAddr::new(2, 1000));
    assert_eq!(topo.node_addr(nm), ForestAddr::new(2, 100));
    assert_eq!(
        topo.leaf_range(salt).unwrap(),
        (ForestAddr::new(2, 1), ForestAddr::new(2, 200))
    );
    assert_eq!(topo.num_ifaces(salt), 2);
    let if2 = topo.iface(salt, 2).unwrap();
    assert_eq!(if2.ip, "193.168.3.5".parse::<std::net::Ipv4Addr>().unwrap());
    assert_eq!((if2.first_link, if2.last_link), (2, 30));

    // links and local link numbers
    let acc = topo.access_link(nm).expect("netMgr has an access link");
    assert_eq!(topo.peer(nm, acc).unwrap(), salt);
    assert_eq!(topo.llnum(acc, salt), 2);
    assert_eq!(topo.link_num(salt, 2), Some(acc));
    let bb = topo.find_link(salt, kauai).expect("salt -- kauai");
    assert_eq!(topo.llnum(bb, salt), 1);
    assert_eq!(topo.llnum(bb, kauai), 1);
    assert_eq!(topo.link(bb).unwrap().length, 2000);
    assert_eq!(
        topo.link(bb).unwrap().rates,
        RateSpec::new(40000, 40000, 20000, 20000)
    );
    // available rates start at capacity
    assert_eq!(topo.avail_rates(bb).unwrap(), topo.link(bb).unwrap().rates);

    assert_eq!(topo.default_leaf_rates(), RateSpec::new(50, 500, 25, 250));
    assert_eq!(topo.router_for_leaf_addr(ForestAddr::new(2, 100)), Some(salt));
    assert_eq!(topo.router_for_leaf_addr(ForestAddr::new(3, 7)), Some(kauai));
    assert_eq!(topo.router_for_leaf_addr(ForestAddr::new(9, 9)), None);

    assert!(topo.check());
}

#[test]
fn topology_round_trips() {
    let first = Topology::read(TOPO_FILE).unwrap();
    let text = first.to_string();
    let second = Topology::read(&text).unwrap_or_else(|e| panic!("rewritten file bad: {e}\n{text}"));

    // same nodes with the same addresses
    let mut names1: Vec<_> = first
        .routers()
        .chain(first.leaves())
        .map(|n| (first.node_name(n).to_string(), first.node_addr(n)))
        .collect();
    let mut names2: Vec<_> = second
        .routers()
        .chain(second.leaves())
        .map(|n| (second.node_name(n).to_string(), second.node_addr(n)))
        .collect();
    names1.sort();
    names2.sort();
    assert_eq!(names1, names2);

    // same links with the same attributes
    assert_eq!(first.links().count(), second.links().count());
    for lnk in first.links() {
        let a = first.left(lnk).unwrap();
        let b = first.right(lnk).unwrap();
        let a2 = second.node_by_name(first.node_name(a)).unwrap();
        let b2 = second.node_by_name(first.node_name(b)).unwrap();
        let lnk2 = second.find_link(a2, b2).expect("link survives round trip");
        assert_eq!(first.link(lnk).unwrap().rates, second.link(lnk2).unwrap().rates);
        assert_eq!(first.link(lnk).unwrap().length, second.link(lnk2).unwrap().length);
        assert_eq!(first.llnum(lnk, a), second.llnum(lnk2, a2));
        assert_eq!(first.llnum(lnk, b), second.llnum(lnk2, b2));
    }
    assert_eq!(first.default_leaf_rates(), second.default_leaf_rates());
}

#[test]
fn reject_duplicate_names_and_addresses() {
    let mut topo = Topology::new();
    topo.add_router("r1", ForestAddr::new(1, 1)).unwrap();
    assert!(topo.add_router("r1", ForestAddr::new(1, 2)).is_err());
    assert!(topo.add_router("r2", ForestAddr::new(1, 1)).is_err());
}

#[test]
fn leaf_gets_one_access_link() {
    let mut topo = Topology::new();
    let r1 = topo.add_router("r1", ForestAddr::new(1, 1)).unwrap();
    let r2 = topo.add_router("r2", ForestAddr::new(1, 2)).unwrap();
    let leaf = topo
        .add_leaf("c", NodeType::Client, "10.0.0.1".parse().unwrap(), ForestAddr::new(1, 50))
        .unwrap();
    let caps = RateSpec::new(10, 10, 10, 10);
    topo.add_link(leaf, r1, 1, caps).unwrap();
    assert!(topo.add_link(leaf, r2, 1, caps).is_err());
}

#[test]
fn check_rejects_leaf_outside_router_range() {
    let text = r#"
router(salt, 2.1000, (40.0,-50.0), (2.1-2.200),
	[ 1, 193.168.3.4, 1-30, (50000,30000,25000,15000) ] )
leaf(badLeaf, client, 192.168.1.9, 2.999, (40.0,-50.0))
link(badLeaf,salt.1,1,(3000,3000,5000,5000))
defaultLinkRates(50,500,25,250)
;
"#;
    let topo = Topology::read(text).unwrap();
    assert!(!topo.check());
}

#[test]
fn check_rejects_uncovered_local_link() {
    let text = r#"
router(salt, 2.1000, (40.0,-50.0), (2.1-2.200),
	[ 1, 193.168.3.4, 1-5, (50000,30000,25000,15000) ] )
leaf(netMgr, controller, 192.168.1.3, 2.100, (40.0,-50.0))
link(netMgr,salt.9,1,(3000,3000,5000,5000))
defaultLinkRates(50,500,25,250)
;
"#;
    let topo = Topology::read(text).unwrap();
    assert!(!topo.check());
}

#[test]
fn status_transitions() {
    let mut topo = Topology::new();
    let r1 = topo.add_router("r1", ForestAddr::new(1, 1)).unwrap();
    assert_eq!(topo.status(r1), NodeStatus::Down);
    topo.set_status(r1, NodeStatus::Booting);
    assert_eq!(topo.status(r1), NodeStatus::Booting);
    topo.set_status(r1, NodeStatus::Up);
    assert_eq!(topo.status(r1), NodeStatus::Up);
}

#[test]
fn unknown_names_fail() {
    let text = r#"
link(ghost,phantom.1,1,(1,1,1,1))
;
"#;
    assert!(Topology::read(text).is_err());
}
