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

//! Tests for the substrate: request/reply correlation, retransmission,
//! deduplication and timeouts, driven through a scripted transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::proto::handler::CfgHandler;
use crate::proto::{CtlMode, CtlMsg, CtlMsgType, Packet};
use crate::substrate::{Substrate, Transport};
use crate::types::ForestAddr;

/// A transport backed by a pair of channels: the test plays the network.
struct PipeTransport {
    inbox: Receiver<Packet>,
    outbox: Sender<Packet>,
}

impl Transport for PipeTransport {
    fn send(&mut self, pkt: Packet) {
        let _ = self.outbox.send(pkt);
    }

    fn recv(&mut self) -> Option<Packet> {
        self.inbox.try_recv().ok()
    }
}

fn pipe() -> (PipeTransport, Sender<Packet>, Receiver<Packet>) {
    let (in_tx, in_rx) = unbounded();
    let (out_tx, out_rx) = unbounded();
    (
        PipeTransport {
            inbox: in_rx,
            outbox: out_tx,
        },
        in_tx,
        out_rx,
    )
}

const ME: ForestAddr = ForestAddr::new(2, 900);
const CLIENT: ForestAddr = ForestAddr::new(1, 500);
const ROUTER: ForestAddr = ForestAddr::new(1, 1);

fn client_request(seq: u64) -> Packet {
    let mut msg = CtlMsg::request(CtlMsgType::ClientAddComtree);
    msg.seq = seq;
    msg.zip = Some(1);
    Packet::signaling(msg, CLIENT, ME)
}

#[test]
fn routes_requests_and_replies() {
    let (transport, net_tx, net_rx) = pipe();
    let mut sub = Substrate::new(ME, 4, transport);

    let handler = |pkt: Packet, cph: &mut CfgHandler| {
        let reply = cph.send_request(
            CtlMsg {
                comtree: Some(9),
                ..CtlMsg::request(CtlMsgType::AddComtree)
            },
            Some(ROUTER),
        );
        let cp = pkt.ctl().expect("signaling packet");
        match reply {
            Ok(rep) if rep.is_pos_reply() => {
                cph.send_reply(CtlMsg::pos_reply(CtlMsgType::ClientAddComtree, cp.seq), Some(pkt.src))
            }
            _ => cph.err_reply(&pkt, "router never replied"),
        }
    };

    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(handler, Some(Duration::from_millis(1500))));

        net_tx.send(client_request(7)).unwrap();

        // the worker's request goes out with the first global sequence number
        let out = net_rx.recv_timeout(Duration::from_millis(500)).unwrap();
        let out_cp = out.ctl().unwrap().clone();
        assert_eq!(out.dst, ROUTER);
        assert_eq!(out_cp.typ, Some(CtlMsgType::AddComtree));
        assert_eq!(out_cp.mode, Some(CtlMode::Request));
        assert_eq!(out_cp.seq, 1);

        // answer it; the reply must reach the very worker that asked
        let rep = Packet::signaling(CtlMsg::pos_reply(CtlMsgType::AddComtree, out_cp.seq), ROUTER, ME);
        net_tx.send(rep).unwrap();

        let fin = net_rx.recv_timeout(Duration::from_millis(500)).unwrap();
        let fin_cp = fin.ctl().unwrap();
        assert_eq!(fin.dst, CLIENT);
        assert_eq!(fin_cp.mode, Some(CtlMode::PosReply));
        assert_eq!(fin_cp.seq, 7);
    })
    .unwrap();
}

#[test]
fn duplicate_inflight_requests_are_dropped() {
    let (transport, net_tx, net_rx) = pipe();
    let mut sub = Substrate::new(ME, 4, transport);
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    let handler = |pkt: Packet, cph: &mut CfgHandler| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        let cp = pkt.ctl().unwrap();
        cph.send_reply(
            CtlMsg::pos_reply(CtlMsgType::ClientAddComtree, cp.seq),
            Some(pkt.src),
        );
    };

    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(handler, Some(Duration::from_millis(1200))));

        // the same (srcAdr, seqNum) twice: the second is a duplicate
        net_tx.send(client_request(42)).unwrap();
        net_tx.send(client_request(42)).unwrap();

        let first = net_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.ctl().unwrap().seq, 42);
        // no second reply
        assert!(net_rx.recv_timeout(Duration::from_millis(600)).is_err());
    })
    .unwrap();
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn retries_reuse_the_sequence_number_then_give_up() {
    let (transport, net_tx, net_rx) = pipe();
    let mut sub = Substrate::new(ME, 2, transport);

    let handler = |pkt: Packet, cph: &mut CfgHandler| {
        let reply = cph.send_request(CtlMsg::request(CtlMsgType::AddComtree), Some(ROUTER));
        assert!(reply.is_err(), "nobody answers in this test");
        cph.err_reply(&pkt, "router never replied");
    };

    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(handler, Some(Duration::from_millis(4200))));

        net_tx.send(client_request(5)).unwrap();

        // three transmissions, all carrying the same assigned sequence number
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let out = net_rx.recv_timeout(Duration::from_millis(1800)).unwrap();
            let cp = out.ctl().unwrap();
            assert_eq!(cp.typ, Some(CtlMsgType::AddComtree));
            seqs.push(cp.seq);
        }
        assert_eq!(seqs, vec![1, 1, 1]);

        // then the handler gives up and the client hears the bad news
        let neg = net_rx.recv_timeout(Duration::from_millis(1800)).unwrap();
        let neg_cp = neg.ctl().unwrap();
        assert_eq!(neg.dst, CLIENT);
        assert_eq!(neg_cp.mode, Some(CtlMode::NegReply));
        assert_eq!(neg_cp.seq, 5);
    })
    .unwrap();
}

#[test]
fn stray_packets_are_dropped() {
    let (transport, net_tx, net_rx) = pipe();
    let mut sub = Substrate::new(ME, 2, transport);
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    let handler = |_pkt: Packet, _cph: &mut CfgHandler| {
        CALLS.fetch_add(1, Ordering::SeqCst);
    };

    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(handler, Some(Duration::from_millis(500))));

        // a reply nobody is waiting for
        net_tx
            .send(Packet::signaling(
                CtlMsg::pos_reply(CtlMsgType::AddComtree, 99),
                ROUTER,
                ME,
            ))
            .unwrap();
        // a non-signaling packet
        net_tx.send(Packet::connect(CLIENT, ME, 1234, false)).unwrap();

        assert!(net_rx.recv_timeout(Duration::from_millis(400)).is_err());
    })
    .unwrap();
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
}

#[test]
fn pool_exhaustion_drops_requests() {
    let (transport, net_tx, net_rx) = pipe();
    let mut sub = Substrate::new(ME, 1, transport);

    let handler = |pkt: Packet, cph: &mut CfgHandler| {
        std::thread::sleep(Duration::from_millis(400));
        let cp = pkt.ctl().unwrap();
        cph.send_reply(
            CtlMsg::pos_reply(CtlMsgType::ClientAddComtree, cp.seq),
            Some(pkt.src),
        );
    };

    crossbeam::thread::scope(|s| {
        s.spawn(|_| sub.run(handler, Some(Duration::from_millis(1200))));

        net_tx.send(client_request(1)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        // a different request while the only worker is busy
        net_tx.send(client_request(2)).unwrap();

        let first = net_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.ctl().unwrap().seq, 1);
        assert!(net_rx.recv_timeout(Duration::from_millis(500)).is_err());
    })
    .unwrap();
}
