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

//! End-to-end scenarios: controller + substrate against a scripted set of
//! routers that answer configuration requests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use pretty_assertions::assert_eq;

use crate::comtree::ConfigMode;
use crate::controller::Controller;
use crate::prefix::PrefixTable;
use crate::proto::handler::CfgHandler;
use crate::proto::{CtlMode, CtlMsg, CtlMsgType, Packet};
use crate::substrate::{Substrate, Transport};
use crate::topology::{NetView, Topology};
use crate::types::{ForestAddr, NodeStatus, RateSpec};

const ME: ForestAddr = ForestAddr::new(2, 900);
const CLIENT: ForestAddr = ForestAddr::new(1, 350);
const R1: ForestAddr = ForestAddr::new(1, 1);
const R2: ForestAddr = ForestAddr::new(1, 2);
const R3: ForestAddr = ForestAddr::new(1, 3);
const BB: RateSpec = RateSpec::new(10, 10, 10, 10);
const LEAF: RateSpec = RateSpec::new(5, 5, 5, 5);
const CAP: RateSpec = RateSpec::new(100, 100, 100, 100);

/// ```text
/// r1.2 --- r2.1   r2.2 --- r3.1   r3.2 --- nm (controller leaf)
/// ```
const TOPO: &str = r#"
router(r1, 1.1, (0.0,0.0), (1.100-1.199),
	[ 1, 10.0.0.1, 1-30, (50000,30000,25000,15000) ] )
router(r2, 1.2, (0.0,0.0), (1.200-1.299),
	[ 1, 10.0.0.2, 1-30, (50000,30000,25000,15000) ] )
router(r3, 1.3, (0.0,0.0), (1.300-1.399),
	[ 1, 10.0.0.3, 1-30, (50000,30000,25000,15000) ] )
leaf(nm, controller, 192.168.1.3, 1.301, (0.0,0.0))
link(r2.1,r1.2,1,(100,100,100,100))
link(r3.1,r2.2,1,(100,100,100,100))
link(nm,r3.2,1,(100,100,100,100))
defaultLinkRates(5,5,5,5)
;
"#;

#[derive(Default)]
struct Script {
    routers: HashSet<ForestAddr>,
    neg: HashSet<CtlMsgType>,
    silent: HashSet<CtlMsgType>,
    log: Vec<(CtlMsgType, ForestAddr)>,
    next_llnk: u32,
    next_leaf: u16,
}

/// A transport that plays every router at once: requests bound for a router
/// (by address or through a tunnel) are answered from the script, and
/// everything else lands in `client_out` for the test to inspect.
struct RouterSim {
    inject: Receiver<Packet>,
    client_out: Sender<Packet>,
    script: Arc<Mutex<Script>>,
    queue: VecDeque<Packet>,
}

impl Transport for RouterSim {
    fn send(&mut self, pkt: Packet) {
        let script = Arc::clone(&self.script);
        let mut s = script.lock().unwrap_or_else(|e| e.into_inner());
        let router_bound = pkt.dst.is_unassigned() || s.routers.contains(&pkt.dst);
        let cp = match pkt.ctl() {
            Some(cp) if router_bound && cp.mode == Some(CtlMode::Request) => cp,
            _ => {
                let _ = self.client_out.send(pkt);
                return;
            }
        };
        let typ = cp.typ.expect("scripted requests are well-formed");
        s.log.push((typ, pkt.dst));
        if s.silent.contains(&typ) {
            return;
        }
        let mut rep = if s.neg.contains(&typ) {
            CtlMsg::neg_reply(typ, cp.seq, "router says no")
        } else {
            CtlMsg::pos_reply(typ, cp.seq)
        };
        match typ {
            CtlMsgType::AddLink => {
                rep.link = cp.link.or_else(|| {
                    s.next_llnk += 1;
                    Some(30 + s.next_llnk)
                });
                rep.adr1 = cp.adr1.or_else(|| {
                    s.next_leaf += 1;
                    Some(ForestAddr::new(1, 310 + s.next_leaf))
                });
            }
            CtlMsgType::AddComtreeLink => {
                rep.link = cp.link.or_else(|| {
                    s.next_llnk += 1;
                    Some(30 + s.next_llnk)
                });
            }
            CtlMsgType::AddIface => {
                rep.port1 = Some(40000);
            }
            _ => {}
        }
        let src = if pkt.dst.is_unassigned() {
            ForestAddr::default()
        } else {
            pkt.dst
        };
        self.queue.push_back(Packet::signaling(rep, src, ME));
    }

    fn recv(&mut self) -> Option<Packet> {
        self.queue
            .pop_front()
            .or_else(|| self.inject.try_recv().ok())
    }
}

struct TestNet {
    view: Arc<NetView>,
    script: Arc<Mutex<Script>>,
    inject: Sender<Packet>,
    client_out: Receiver<Packet>,
}

fn build(prefixes: &str) -> (TestNet, Substrate<RouterSim>, Controller) {
    let topo = Topology::read(TOPO).expect("test topology parses");
    assert!(topo.check());
    let view = Arc::new(NetView::new(topo, crate::comtree::ComtreeSet::new()));
    let prefixes = PrefixTable::read(prefixes).unwrap();
    let controller = Controller::new(Arc::clone(&view), prefixes, ME, (1001, 1005));

    let script = Arc::new(Mutex::new(Script {
        routers: [R1, R2, R3].into_iter().collect(),
        ..Default::default()
    }));
    let (inject_tx, inject_rx) = unbounded();
    let (out_tx, out_rx) = unbounded();
    let sim = RouterSim {
        inject: inject_rx,
        client_out: out_tx,
        script: Arc::clone(&script),
        queue: VecDeque::new(),
    };
    let substrate = Substrate::new(ME, 4, sim);
    (
        TestNet {
            view,
            script,
            inject: inject_tx,
            client_out: out_rx,
        },
        substrate,
        controller,
    )
}

/// Seed a manual-mode comtree rooted at r1, as S1 would have left it.
fn seed_comtree(view: &NetView, num: u32) {
    view.with_state(|topo, set| {
        let ctx = set.add_comtree(num).unwrap();
        set.set_root(ctx, R1);
        set.set_owner(ctx, CLIENT);
        set.set_config_mode(ctx, ConfigMode::Manual);
        set.set_def_rates(ctx, BB, LEAF);
        set.add_node(ctx, R1, topo).unwrap();
        set.add_core_node(ctx, R1, topo).unwrap();
    });
}

fn join_request(seq: u64, comt: u32) -> Packet {
    let msg = CtlMsg {
        seq,
        comtree: Some(comt),
        ip1: Some("10.9.9.9".parse().unwrap()),
        port1: Some(5555),
        ..CtlMsg::request(CtlMsgType::ClientJoinComtree)
    };
    Packet::signaling(msg, CLIENT, ME)
}

fn logged_types(script: &Arc<Mutex<Script>>) -> Vec<CtlMsgType> {
    script
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .log
        .iter()
        .map(|(t, _)| *t)
        .collect()
}

fn assert_avail_untouched(view: &NetView) {
    view.with_topo(|t| {
        for lnk in t.links() {
            assert_eq!(t.avail_rates(lnk).unwrap(), t.link(lnk).unwrap().rates);
        }
    });
}

#[test]
fn s1_create_empty_comtree() {
    let (net, mut sub, ctl) = build("");
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(1500))));

        let msg = CtlMsg {
            seq: 11,
            zip: Some(1),
            rates1: Some(BB),
            rates2: Some(LEAF),
            ..CtlMsg::request(CtlMsgType::ClientAddComtree)
        };
        net.inject
            .send(Packet::signaling(msg, CLIENT, ME))
            .unwrap();

        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        let rep_cp = rep.ctl().unwrap();
        assert_eq!(rep.dst, CLIENT);
        assert_eq!(rep_cp.mode, Some(CtlMode::PosReply));
        let comt = rep_cp.comtree.expect("reply carries the comtree number");
        assert!((1001..=1005).contains(&comt));

        // the root router was configured and recorded
        assert_eq!(
            logged_types(&net.script),
            vec![CtlMsgType::AddComtree, CtlMsgType::ModComtree]
        );
        let root = net.view.comtrees().with_set(|set| {
            let ctx = set.lookup(comt).expect("comtree recorded");
            assert_eq!(set.owner(ctx), CLIENT);
            set.root(ctx)
        });
        assert!([R1, R2, R3].contains(&root));
        // no capacity was reserved for an empty comtree
        assert_avail_untouched(&net.view);
    })
    .unwrap();
}

#[test]
fn s2_join_with_capacity() {
    let (net, mut sub, ctl) = build("");
    seed_comtree(&net.view, 1001);
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(1500))));

        net.inject.send(join_request(21, 1001)).unwrap();

        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(rep.dst, CLIENT);
        assert_eq!(rep.ctl().unwrap().mode, Some(CtlMode::PosReply));

        // r2 and r3 joined the tree, the client hangs off r3
        net.view.with_state(|topo, set| {
            let ctx = set.lookup(1001).unwrap();
            assert!(set.is_comt_rtr(ctx, R2));
            assert!(set.is_comt_rtr(ctx, R3));
            assert!(set.is_comt_leaf(ctx, CLIENT));
            assert_eq!(set.parent(ctx, CLIENT, topo), Some(R3));
            assert!(set.check_tree(ctx, topo));
            assert!(set.check_subtree_rates(ctx, topo));
            // both backbone links debited by the default backbone rates
            let r1n = topo.node_by_name("r1").unwrap();
            let r2n = topo.node_by_name("r2").unwrap();
            let r3n = topo.node_by_name("r3").unwrap();
            let l12 = topo.find_link(r1n, r2n).unwrap();
            let l23 = topo.find_link(r2n, r3n).unwrap();
            assert_eq!(topo.avail_rates(l12).unwrap(), RateSpec::new(90, 90, 90, 90));
            assert_eq!(topo.avail_rates(l23).unwrap(), RateSpec::new(90, 90, 90, 90));
        });

        // the path was configured shallow-first, then the client link
        let types = logged_types(&net.script);
        let expected = vec![
            // hop r1 -- r2
            CtlMsgType::AddComtreeLink,
            CtlMsgType::ModComtreeLink,
            CtlMsgType::AddComtree,
            CtlMsgType::AddComtreeLink,
            CtlMsgType::ModComtree,
            CtlMsgType::ModComtreeLink,
            // hop r2 -- r3
            CtlMsgType::AddComtreeLink,
            CtlMsgType::ModComtreeLink,
            CtlMsgType::AddComtree,
            CtlMsgType::AddComtreeLink,
            CtlMsgType::ModComtree,
            CtlMsgType::ModComtreeLink,
            // the client's own link at r3
            CtlMsgType::AddComtreeLink,
            CtlMsgType::ModComtreeLink,
        ];
        assert_eq!(types, expected);
    })
    .unwrap();
}

#[test]
fn s3_join_without_capacity() {
    let (net, mut sub, ctl) = build("");
    seed_comtree(&net.view, 1001);
    // link r1 -- r2 cannot carry the backbone rates
    net.view.with_topo(|t| {
        let r1n = t.node_by_name("r1").unwrap();
        let r2n = t.node_by_name("r2").unwrap();
        let l12 = t.find_link(r1n, r2n).unwrap();
        t.link_mut(l12).unwrap().rates = LEAF;
        t.link_mut(l12).unwrap().avail = LEAF;
    });
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(1200))));

        net.inject.send(join_request(31, 1001)).unwrap();

        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        let rep_cp = rep.ctl().unwrap();
        assert_eq!(rep_cp.mode, Some(CtlMode::NegReply));
        assert_eq!(rep_cp.err_msg.as_deref(), Some("cannot find path to comtree"));

        // nothing changed: no membership, no reservations, no router talk
        assert_avail_untouched(&net.view);
        net.view.comtrees().with_set(|set| {
            let ctx = set.lookup(1001).unwrap();
            assert!(!set.is_comt_rtr(ctx, R2));
            assert!(!set.is_comt_rtr(ctx, R3));
            assert!(!set.is_comt_leaf(ctx, CLIENT));
        });
        assert!(logged_types(&net.script).is_empty());
    })
    .unwrap();
}

#[test]
fn s4_leave_returns_capacity() {
    let (net, mut sub, ctl) = build("");
    seed_comtree(&net.view, 1001);
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(2500))));

        net.inject.send(join_request(41, 1001)).unwrap();
        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(rep.ctl().unwrap().mode, Some(CtlMode::PosReply));

        let leave = CtlMsg {
            seq: 42,
            comtree: Some(1001),
            ip1: Some("10.9.9.9".parse().unwrap()),
            port1: Some(5555),
            ..CtlMsg::request(CtlMsgType::ClientLeaveComtree)
        };
        net.inject
            .send(Packet::signaling(leave, CLIENT, ME))
            .unwrap();
        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(rep.ctl().unwrap().mode, Some(CtlMode::PosReply));

        // r2 and r3 are gone again and every link is back to full capacity
        net.view.with_state(|topo, set| {
            let ctx = set.lookup(1001).unwrap();
            assert!(!set.is_comt_rtr(ctx, R2));
            assert!(!set.is_comt_rtr(ctx, R3));
            assert!(!set.is_comt_leaf(ctx, CLIENT));
            assert_eq!(set.comt_routers(ctx).count(), 1);
            for lnk in topo.links() {
                assert_eq!(topo.avail_rates(lnk).unwrap(), CAP);
            }
        });
    })
    .unwrap();
}

#[test]
fn s5_duplicate_join_is_a_noop() {
    let (net, mut sub, ctl) = build("");
    seed_comtree(&net.view, 1001);
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(1500))));

        // the same (srcAdr, seqNum) twice, back to back
        net.inject.send(join_request(51, 1001)).unwrap();
        net.inject.send(join_request(51, 1001)).unwrap();

        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(rep.ctl().unwrap().mode, Some(CtlMode::PosReply));
        // exactly one reply; the duplicate was dropped by the substrate
        assert!(net
            .client_out
            .recv_timeout(Duration::from_millis(500))
            .is_err());

        // exactly one set of reservations
        net.view.with_topo(|topo| {
            let r1n = topo.node_by_name("r1").unwrap();
            let r2n = topo.node_by_name("r2").unwrap();
            let l12 = topo.find_link(r1n, r2n).unwrap();
            assert_eq!(topo.avail_rates(l12).unwrap(), RateSpec::new(90, 90, 90, 90));
        });
    })
    .unwrap();
}

#[test]
fn s6_boot_router_sequence() {
    let (net, mut sub, ctl) = build("");
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(1500))));

        let mut boot = Packet::signaling(
            CtlMsg {
                seq: 61,
                ..CtlMsg::request(CtlMsgType::BootRouter)
            },
            R2,
            ME,
        );
        boot.tun_ip = "9.9.9.9".parse().unwrap();
        boot.tun_port = 7777;
        net.inject.send(boot).unwrap();

        // approval comes first, through the tunnel, with the leaf range
        let approve = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        let app_cp = approve.ctl().unwrap();
        assert!(approve.dst.is_unassigned());
        assert_eq!(approve.tunnel(), ("9.9.9.9".parse().unwrap(), 7777));
        assert_eq!(app_cp.mode, Some(CtlMode::PosReply));
        assert_eq!(app_cp.adr1, Some(ForestAddr::new(1, 200)));
        assert_eq!(app_cp.adr2, Some(ForestAddr::new(1, 299)));

        // wait for the boot to finish
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let up = net.view.with_topo(|t| {
                let r2 = t.node_by_name("r2").unwrap();
                t.status(r2) == NodeStatus::Up
            });
            if up {
                break;
            }
            assert!(Instant::now() < deadline, "router never came up");
            std::thread::sleep(Duration::from_millis(20));
        }

        // the configuration sequence: leaf range, interfaces, one
        // (ADD_LINK, MOD_LINK) per router-to-router link, boot complete
        let types = logged_types(&net.script);
        assert_eq!(
            types,
            vec![
                CtlMsgType::SetLeafRange,
                CtlMsgType::AddIface,
                CtlMsgType::AddLink,
                CtlMsgType::ModLink,
                CtlMsgType::AddLink,
                CtlMsgType::ModLink,
                CtlMsgType::BootComplete,
            ]
        );
        // the router's bound port was learned from the ADD_IFACE reply
        net.view.with_topo(|t| {
            let r2 = t.node_by_name("r2").unwrap();
            assert_eq!(t.iface(r2, 1).map(|i| i.port), Some(40000));
        });
    })
    .unwrap();
}

#[test]
fn s6_boot_router_aborts_on_failure() {
    let (net, mut sub, ctl) = build("");
    net.script
        .lock()
        .unwrap()
        .neg
        .insert(CtlMsgType::AddLink);
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(1500))));

        let mut boot = Packet::signaling(
            CtlMsg {
                seq: 62,
                ..CtlMsg::request(CtlMsgType::BootRouter)
            },
            R2,
            ME,
        );
        boot.tun_ip = "9.9.9.9".parse().unwrap();
        boot.tun_port = 7777;
        net.inject.send(boot).unwrap();

        // approval still arrives, then the failure rolls everything back
        let approve = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(approve.ctl().unwrap().mode, Some(CtlMode::PosReply));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let types = logged_types(&net.script);
            if types.contains(&CtlMsgType::BootAbort) {
                assert!(!types.contains(&CtlMsgType::BootComplete));
                break;
            }
            assert!(Instant::now() < deadline, "boot abort never sent");
            std::thread::sleep(Duration::from_millis(20));
        }
        let down = net.view.with_topo(|t| {
            let r2 = t.node_by_name("r2").unwrap();
            t.status(r2) == NodeStatus::Down
        });
        assert!(down, "router must be marked down after an aborted boot");
    })
    .unwrap();
}

#[test]
fn new_session_assigns_address_and_nonce() {
    let (net, mut sub, ctl) = build("10.1.1.* 1.3\n");
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(1500))));

        let msg = CtlMsg {
            seq: 71,
            ip1: Some("10.1.1.20".parse().unwrap()),
            rates1: Some(LEAF),
            ..CtlMsg::request(CtlMsgType::NewSession)
        };
        net.inject
            .send(Packet::signaling(msg, ForestAddr::new(2, 800), ME))
            .unwrap();

        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        let rep_cp = rep.ctl().unwrap();
        assert_eq!(rep_cp.mode, Some(CtlMode::PosReply));
        // the router assigned the address; the controller minted the nonce
        assert_eq!(rep_cp.adr1, Some(ForestAddr::new(1, 311)));
        assert_eq!(rep_cp.adr2, Some(R3));
        assert!(rep_cp.nonce.unwrap_or(0) != 0);

        // link setup plus the two well-known comtrees
        let types = logged_types(&net.script);
        assert_eq!(
            types,
            vec![
                CtlMsgType::AddLink,
                CtlMsgType::ModLink,
                CtlMsgType::AddComtreeLink,
                CtlMsgType::ModComtreeLink,
                CtlMsgType::AddComtreeLink,
                CtlMsgType::ModComtreeLink,
            ]
        );
    })
    .unwrap();
}

#[test]
fn new_session_without_prefix_match_is_rejected() {
    let (net, mut sub, ctl) = build("10.1.1.* 1.3\n");
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(900))));

        let msg = CtlMsg {
            seq: 72,
            ip1: Some("172.16.0.9".parse().unwrap()),
            ..CtlMsg::request(CtlMsgType::NewSession)
        };
        net.inject
            .send(Packet::signaling(msg, ForestAddr::new(2, 800), ME))
            .unwrap();

        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        let rep_cp = rep.ctl().unwrap();
        assert_eq!(rep_cp.mode, Some(CtlMode::NegReply));
        assert_eq!(
            rep_cp.err_msg.as_deref(),
            Some("No router assigned to client's IP")
        );
    })
    .unwrap();
}

#[test]
fn boot_leaf_configures_and_notifies() {
    let (net, mut sub, ctl) = build("");
    net.view.with_topo(|t| {
        let r3 = t.node_by_name("r3").unwrap();
        t.set_status(r3, NodeStatus::Up);
    });
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(1500))));

        let mut boot = Packet::signaling(
            CtlMsg {
                seq: 81,
                ..CtlMsg::request(CtlMsgType::BootLeaf)
            },
            ForestAddr::default(),
            ME,
        );
        boot.tun_ip = "192.168.1.3".parse().unwrap();
        boot.tun_port = 6666;
        net.inject.send(boot).unwrap();

        let rep = net.client_out.recv_timeout(Duration::from_secs(2)).unwrap();
        let rep_cp = rep.ctl().unwrap();
        assert_eq!(rep_cp.typ, Some(CtlMsgType::BootLeaf));
        assert_eq!(rep_cp.mode, Some(CtlMode::PosReply));

        // a controller leaf joins all three well-known comtrees, and the
        // CONFIG_LEAF went out before the final ack
        let types = logged_types(&net.script);
        assert_eq!(
            types,
            vec![
                CtlMsgType::AddLink,
                CtlMsgType::ModLink,
                CtlMsgType::AddComtreeLink,
                CtlMsgType::ModComtreeLink,
                CtlMsgType::AddComtreeLink,
                CtlMsgType::ModComtreeLink,
                CtlMsgType::AddComtreeLink,
                CtlMsgType::ModComtreeLink,
                CtlMsgType::ConfigLeaf,
            ]
        );
        let up = net.view.with_topo(|t| {
            let nm = t.node_by_name("nm").unwrap();
            t.status(nm) == NodeStatus::Up
        });
        assert!(up);
    })
    .unwrap();
}

#[test]
fn cancel_session_drops_the_link() {
    let (net, mut sub, ctl) = build("");
    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(|p, c: &mut CfgHandler| ctl.dispatch(p, c), Some(Duration::from_millis(900))));

        let msg = CtlMsg {
            seq: 91,
            adr1: Some(CLIENT),
            adr2: Some(R3),
            ..CtlMsg::request(CtlMsgType::CancelSession)
        };
        net.inject
            .send(Packet::signaling(msg, ForestAddr::new(2, 800), ME))
            .unwrap();

        let rep = net.client_out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(rep.ctl().unwrap().mode, Some(CtlMode::PosReply));
        assert_eq!(logged_types(&net.script), vec![CtlMsgType::DropLink]);
    })
    .unwrap();
}
