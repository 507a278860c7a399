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

//! # Configuration-protocol handler
//!
//! A [`CfgHandler`] is the per-worker handle for talking to routers and
//! leaves: one method per request type, a [`CfgHandler::send_request`] core
//! that retries up to three times at one-second intervals, and the
//! [`CfgHandler::process_reply`] pattern that converts a missing or negative
//! reply into a negative reply to the original requester.

use std::net::Ipv4Addr;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::*;

use crate::proto::{CtlMode, CtlMsg, CtlMsgType, Packet, SEQ_RETRY};
use crate::types::{ComtreeNum, ForestAddr, NodeType, ProtoError, RateSpec};

/// How long to wait for a reply before retransmitting.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
/// Total number of transmissions before giving up.
const SEND_ATTEMPTS: u32 = 3;

/// What a worker hands back to the I/O thread: an outgoing packet, or the
/// completion sentinel that returns the worker to the idle set.
#[derive(Debug)]
pub enum WorkerOut {
    /// An outgoing packet.
    Pkt(Packet),
    /// The worker finished its current task.
    Done,
}

/// Per-worker handle for issuing configuration transactions.
#[derive(Debug, Clone)]
pub struct CfgHandler {
    my_adr: ForestAddr,
    wid: usize,
    tunnel: Option<(Ipv4Addr, u16)>,
    inq: Receiver<Packet>,
    outq: Sender<(usize, WorkerOut)>,
}

impl CfgHandler {
    /// Create the handler for one worker.
    pub fn new(
        my_adr: ForestAddr,
        wid: usize,
        inq: Receiver<Packet>,
        outq: Sender<(usize, WorkerOut)>,
    ) -> Self {
        CfgHandler {
            my_adr,
            wid,
            tunnel: None,
            inq,
            outq,
        }
    }

    /// The controller's own forest address.
    pub fn my_adr(&self) -> ForestAddr {
        self.my_adr
    }

    /// Address packets with an unassigned destination to this tunnel
    /// endpoint. Used while configuring a node that is not yet routable.
    pub fn set_tunnel(&mut self, tunnel: (Ipv4Addr, u16)) {
        self.tunnel = Some(tunnel);
    }

    fn push(&self, pkt: Packet) {
        // an error here means the I/O loop is gone; nothing left to do
        let _ = self.outq.send((self.wid, WorkerOut::Pkt(pkt)));
    }

    fn make_pkt(&self, msg: CtlMsg, dest: Option<ForestAddr>) -> Packet {
        let mut pkt = Packet::signaling(msg, self.my_adr, dest.unwrap_or_default());
        if dest.is_none() {
            if let Some((ip, port)) = self.tunnel {
                pkt.tun_ip = ip;
                pkt.tun_port = port;
            }
        }
        pkt
    }

    /// Send a request and wait for the matching reply.
    ///
    /// The request is transmitted up to three times at one-second intervals;
    /// retransmissions carry the retry flag so the substrate can reuse the
    /// already-assigned sequence number or suppress the retry when a reply
    /// is already in the pipeline. Returns the reply control message
    /// (positive or negative), or [`ProtoError::NoResponse`] after the last
    /// timeout.
    ///
    /// A destination of `None` sends through the handler's tunnel endpoint,
    /// for peers that are not yet routable.
    pub fn send_request(
        &self,
        msg: CtlMsg,
        dest: Option<ForestAddr>,
    ) -> Result<CtlMsg, ProtoError> {
        debug!("-> {} to {:?}", msg, dest);
        self.push(self.make_pkt(msg.clone(), dest));
        for attempt in 1..=SEND_ATTEMPTS {
            match self.inq.recv_timeout(REPLY_TIMEOUT) {
                Ok(reply) => {
                    if let Some(rep) = reply.ctl() {
                        if rep.mode == Some(CtlMode::NegReply) {
                            warn!(
                                "negative reply ({}) to control packet {}",
                                rep.err_msg.as_deref().unwrap_or("?"),
                                msg
                            );
                        }
                        return Ok(rep.clone());
                    }
                    // not a signaling packet; cannot happen with a sane
                    // substrate, drop and keep waiting
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if attempt < SEND_ATTEMPTS {
                        let mut retry = msg.clone();
                        retry.seq = SEQ_RETRY;
                        self.push(self.make_pkt(retry, dest));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        warn!("no response to control packet {}", msg);
        Err(ProtoError::NoResponse)
    }

    /// Send a reply. A destination of `None` sends through the tunnel.
    pub fn send_reply(&self, msg: CtlMsg, dest: Option<ForestAddr>) {
        self.push(self.make_pkt(msg, dest));
    }

    /// Send a negative reply for the given request packet, quoting `text`.
    pub fn err_reply(&self, orig: &Packet, text: impl Into<String>) {
        let (typ, seq) = match orig.ctl() {
            Some(cp) => (cp.typ.unwrap_or(CtlMsgType::BootAbort), cp.seq),
            None => return,
        };
        let mut pkt = Packet::signaling(CtlMsg::neg_reply(typ, seq, text), self.my_adr, orig.src);
        pkt.ptype = orig.ptype;
        pkt.comtree = orig.comtree;
        pkt.tun_ip = orig.tun_ip;
        pkt.tun_port = orig.tun_port;
        self.push(pkt);
    }

    /// Common reply handling for handlers that configure routers on behalf
    /// of a received request: a missing or negative reply sends a negative
    /// reply (quoting `msg`) back to the sender of `orig` and yields `None`.
    pub fn process_reply(
        &self,
        orig: &Packet,
        reply: Result<CtlMsg, ProtoError>,
        msg: &str,
    ) -> Option<CtlMsg> {
        match reply {
            Ok(rep) if rep.is_pos_reply() => Some(rep),
            Ok(rep) => {
                let detail = rep.err_msg.as_deref().unwrap_or("request failed");
                self.err_reply(orig, format!("{msg} ({detail})"));
                None
            }
            Err(_) => {
                self.err_reply(orig, format!("{msg} (no response from target)"));
                None
            }
        }
    }

    // ********************
    // * Request builders *
    // ********************

    /// ADD_IFACE: create an interface at a router.
    pub fn add_iface(
        &self,
        dest: Option<ForestAddr>,
        iface: u32,
        ip: Ipv4Addr,
        rates: RateSpec,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            iface: Some(iface),
            ip1: Some(ip),
            rates1: Some(rates),
            ..CtlMsg::request(CtlMsgType::AddIface)
        };
        self.send_request(msg, dest)
    }

    /// DROP_IFACE: remove an interface at a router.
    pub fn drop_iface(&self, dest: Option<ForestAddr>, iface: u32) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            iface: Some(iface),
            ..CtlMsg::request(CtlMsgType::DropIface)
        };
        self.send_request(msg, dest)
    }

    /// MOD_IFACE: change the rates of an interface.
    pub fn mod_iface(
        &self,
        dest: Option<ForestAddr>,
        iface: u32,
        ip: Ipv4Addr,
        rates: RateSpec,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            iface: Some(iface),
            ip1: Some(ip),
            rates1: Some(rates),
            ..CtlMsg::request(CtlMsgType::ModIface)
        };
        self.send_request(msg, dest)
    }

    /// ADD_LINK: create a link at a router. For a pre-configured peer the
    /// local link number, peer address and peer (ip, port) are given; for a
    /// dynamic client they are left out and the router assigns them.
    #[allow(clippy::too_many_arguments)]
    pub fn add_link(
        &self,
        dest: Option<ForestAddr>,
        peer_type: NodeType,
        iface: u32,
        llnum: Option<u32>,
        peer_ip: Option<Ipv4Addr>,
        peer_port: Option<u16>,
        peer_adr: Option<ForestAddr>,
        nonce: u64,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            node_type: Some(peer_type),
            iface: Some(iface),
            link: llnum,
            ip1: peer_ip,
            port1: peer_port,
            adr1: peer_adr,
            nonce: Some(nonce),
            ..CtlMsg::request(CtlMsgType::AddLink)
        };
        self.send_request(msg, dest)
    }

    /// DROP_LINK: remove a link at a router, by local link number or by the
    /// peer's address.
    pub fn drop_link(
        &self,
        dest: Option<ForestAddr>,
        llnum: Option<u32>,
        peer_adr: Option<ForestAddr>,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            link: llnum,
            adr1: peer_adr,
            ..CtlMsg::request(CtlMsgType::DropLink)
        };
        self.send_request(msg, dest)
    }

    /// MOD_LINK: set the rates of a link.
    pub fn mod_link(
        &self,
        dest: Option<ForestAddr>,
        llnum: u32,
        rates: RateSpec,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            link: Some(llnum),
            rates1: Some(rates),
            ..CtlMsg::request(CtlMsgType::ModLink)
        };
        self.send_request(msg, dest)
    }

    /// ADD_COMTREE: create a comtree entry at a router.
    pub fn add_comtree(
        &self,
        dest: Option<ForestAddr>,
        comt: ComtreeNum,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            comtree: Some(comt),
            ..CtlMsg::request(CtlMsgType::AddComtree)
        };
        self.send_request(msg, dest)
    }

    /// DROP_COMTREE: remove a comtree entry at a router.
    pub fn drop_comtree(
        &self,
        dest: Option<ForestAddr>,
        comt: ComtreeNum,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            comtree: Some(comt),
            ..CtlMsg::request(CtlMsgType::DropComtree)
        };
        self.send_request(msg, dest)
    }

    /// MOD_COMTREE: set the parent link and core flag of a comtree at a
    /// router.
    pub fn mod_comtree(
        &self,
        dest: Option<ForestAddr>,
        comt: ComtreeNum,
        parent_llnum: u32,
        core_flag: bool,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            comtree: Some(comt),
            link: Some(parent_llnum),
            core_flag: Some(core_flag),
            ..CtlMsg::request(CtlMsgType::ModComtree)
        };
        self.send_request(msg, dest)
    }

    /// ADD_COMTREE_LINK: attach a link to a comtree at a router, either by
    /// local link number or by the peer's (ip, port).
    pub fn add_comtree_link(
        &self,
        dest: Option<ForestAddr>,
        comt: ComtreeNum,
        llnum: Option<u32>,
        core_flag: Option<bool>,
        peer: Option<(Ipv4Addr, u16)>,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            comtree: Some(comt),
            link: llnum,
            core_flag,
            ip1: peer.map(|p| p.0),
            port1: peer.map(|p| p.1),
            ..CtlMsg::request(CtlMsgType::AddComtreeLink)
        };
        self.send_request(msg, dest)
    }

    /// DROP_COMTREE_LINK: detach a link from a comtree at a router.
    pub fn drop_comtree_link(
        &self,
        dest: Option<ForestAddr>,
        comt: ComtreeNum,
        llnum: Option<u32>,
        peer: Option<(Ipv4Addr, u16)>,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            comtree: Some(comt),
            link: llnum,
            ip1: peer.map(|p| p.0),
            port1: peer.map(|p| p.1),
            ..CtlMsg::request(CtlMsgType::DropComtreeLink)
        };
        self.send_request(msg, dest)
    }

    /// MOD_COMTREE_LINK: set the rates of a comtree link.
    pub fn mod_comtree_link(
        &self,
        dest: Option<ForestAddr>,
        comt: ComtreeNum,
        llnum: u32,
        rates: RateSpec,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            comtree: Some(comt),
            link: Some(llnum),
            rates1: Some(rates),
            ..CtlMsg::request(CtlMsgType::ModComtreeLink)
        };
        self.send_request(msg, dest)
    }

    /// SET_LEAF_RANGE: configure the assignable leaf-address range.
    pub fn set_leaf_range(
        &self,
        dest: Option<ForestAddr>,
        first: ForestAddr,
        last: ForestAddr,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            adr1: Some(first),
            adr2: Some(last),
            ..CtlMsg::request(CtlMsgType::SetLeafRange)
        };
        self.send_request(msg, dest)
    }

    /// CONFIG_LEAF: hand a booted leaf its address, router and nonce.
    pub fn config_leaf(
        &self,
        dest: Option<ForestAddr>,
        leaf_adr: ForestAddr,
        rtr_adr: ForestAddr,
        rtr_ip: Ipv4Addr,
        rtr_port: u16,
        nonce: u64,
    ) -> Result<CtlMsg, ProtoError> {
        let msg = CtlMsg {
            adr1: Some(leaf_adr),
            adr2: Some(rtr_adr),
            ip1: Some(rtr_ip),
            port1: Some(rtr_port),
            nonce: Some(nonce),
            ..CtlMsg::request(CtlMsgType::ConfigLeaf)
        };
        self.send_request(msg, dest)
    }

    /// BOOT_COMPLETE: tell a router its configuration is done.
    pub fn boot_complete(&self, dest: Option<ForestAddr>) -> Result<CtlMsg, ProtoError> {
        self.send_request(CtlMsg::request(CtlMsgType::BootComplete), dest)
    }

    /// BOOT_ABORT: tell a router its boot failed; it should start over.
    pub fn boot_abort(&self, dest: Option<ForestAddr>) -> Result<CtlMsg, ProtoError> {
        self.send_request(CtlMsg::request(CtlMsgType::BootAbort), dest)
    }

    /// CLIENT_CONNECT / CLIENT_DISCONNECT: notify the client manager.
    pub fn client_con_disc(
        &self,
        dest: Option<ForestAddr>,
        disconnect: bool,
        client_adr: ForestAddr,
        rtr_adr: ForestAddr,
    ) -> Result<CtlMsg, ProtoError> {
        let typ = if disconnect {
            CtlMsgType::ClientDisconnect
        } else {
            CtlMsgType::ClientConnect
        };
        let msg = CtlMsg {
            adr1: Some(client_adr),
            adr2: Some(rtr_adr),
            ..CtlMsg::request(typ)
        };
        self.send_request(msg, dest)
    }
}
