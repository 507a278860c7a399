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

//! # Control packets
//!
//! In-memory form of the Forest packets the control plane consumes and
//! produces. The byte-level codec is not part of this crate; a
//! [`crate::substrate::Transport`] moves whole [`Packet`] values, and every
//! received packet round-trips intact.
//!
//! Signaling packets carry a [`CtlMsg`]: a request type, a mode, a 64-bit
//! sequence number, and a typed attribute set. On an outgoing request the
//! sequence number `0` asks the substrate to assign the next global number,
//! and `1` flags a retry of the previously assigned one.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::types::{ComtreeNum, ForestAddr, NodeType, ProtoError, RateSpec};

pub mod handler;

/// The well-known comtree every leaf uses for connection upkeep.
pub const CONNECT_COMT: ComtreeNum = 1;
/// The well-known comtree for client signaling.
pub const CLIENT_SIG_COMT: ComtreeNum = 2;
/// The well-known comtree for network signaling among controllers/routers.
pub const NET_SIG_COMT: ComtreeNum = 100;
/// The well-known UDP port of the network manager.
pub const NM_PORT: u16 = 30122;

/// Sequence number on an outgoing request asking the substrate to assign
/// the next global number.
pub const SEQ_ASSIGN: u64 = 0;
/// Sequence number flagging a retry of the previously assigned request.
pub const SEQ_RETRY: u64 = 1;

/// The Forest packet types the control plane deals with.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PacketType {
    /// A leaf connecting its access link.
    Connect,
    /// A leaf disconnecting its access link.
    Disconnect,
    /// Signaling between clients and controllers.
    ClientSig,
    /// Signaling among controllers and routers.
    NetSig,
}

/// The mode of a control message.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum CtlMode {
    /// A request, to be answered with a reply carrying the same sequence
    /// number.
    Request,
    /// A successful reply, possibly carrying a payload.
    PosReply,
    /// A failed reply; always carries an error string.
    NegReply,
}

/// All control-message types understood by the controllers.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum CtlMsgType {
    // client-side operations
    ClientAddComtree,
    ClientDropComtree,
    ClientJoinComtree,
    ClientLeaveComtree,
    NewSession,
    CancelSession,
    ConfigLeaf,
    BootLeaf,
    // router configuration
    AddIface,
    DropIface,
    ModIface,
    AddLink,
    DropLink,
    ModLink,
    AddComtree,
    DropComtree,
    ModComtree,
    AddComtreeLink,
    DropComtreeLink,
    ModComtreeLink,
    SetLeafRange,
    BootRouter,
    BootComplete,
    BootAbort,
    ClientConnect,
    ClientDisconnect,
}

impl CtlMsgType {
    /// Client-signaling types travel on the client signaling comtree; the
    /// rest are network signaling.
    pub fn is_client_sig(&self) -> bool {
        matches!(
            self,
            CtlMsgType::ClientAddComtree
                | CtlMsgType::ClientDropComtree
                | CtlMsgType::ClientJoinComtree
                | CtlMsgType::ClientLeaveComtree
                | CtlMsgType::NewSession
                | CtlMsgType::CancelSession
                | CtlMsgType::ConfigLeaf
                | CtlMsgType::BootLeaf
        )
    }
}

/// A control message: type, mode, sequence number and typed attributes.
///
/// Attributes that a message type does not use stay `None`; the accessor
/// methods turn a missing required attribute into
/// [`ProtoError::MissingAttribute`].
#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct CtlMsg {
    /// The request type.
    pub typ: Option<CtlMsgType>,
    /// Request, positive reply or negative reply.
    pub mode: Option<CtlMode>,
    /// The sequence number; see [`SEQ_ASSIGN`] and [`SEQ_RETRY`].
    pub seq: u64,
    /// A comtree number.
    pub comtree: Option<ComtreeNum>,
    /// A local link number.
    pub link: Option<u32>,
    /// An interface number.
    pub iface: Option<u32>,
    /// First address attribute.
    pub adr1: Option<ForestAddr>,
    /// Second address attribute.
    pub adr2: Option<ForestAddr>,
    /// Third address attribute.
    pub adr3: Option<ForestAddr>,
    /// An IP address.
    pub ip1: Option<Ipv4Addr>,
    /// A UDP port.
    pub port1: Option<u16>,
    /// First rate spec attribute.
    pub rates1: Option<RateSpec>,
    /// Second rate spec attribute.
    pub rates2: Option<RateSpec>,
    /// The core flag of a comtree operation.
    pub core_flag: Option<bool>,
    /// A zip code.
    pub zip: Option<u16>,
    /// The type of a peer node.
    pub node_type: Option<NodeType>,
    /// A link nonce.
    pub nonce: Option<u64>,
    /// The error string of a negative reply.
    pub err_msg: Option<String>,
}

impl CtlMsg {
    /// Create a request of the given type, with the sequence number left for
    /// the substrate to assign.
    pub fn request(typ: CtlMsgType) -> Self {
        CtlMsg {
            typ: Some(typ),
            mode: Some(CtlMode::Request),
            seq: SEQ_ASSIGN,
            ..Default::default()
        }
    }

    /// Create a positive reply echoing the request's sequence number.
    pub fn pos_reply(typ: CtlMsgType, seq: u64) -> Self {
        CtlMsg {
            typ: Some(typ),
            mode: Some(CtlMode::PosReply),
            seq,
            ..Default::default()
        }
    }

    /// Create a negative reply with an error string.
    pub fn neg_reply(typ: CtlMsgType, seq: u64, msg: impl Into<String>) -> Self {
        CtlMsg {
            typ: Some(typ),
            mode: Some(CtlMode::NegReply),
            seq,
            err_msg: Some(msg.into()),
            ..Default::default()
        }
    }

    /// The message type, or an error for malformed messages.
    pub fn req_type(&self) -> Result<CtlMsgType, ProtoError> {
        self.typ.ok_or(ProtoError::MissingAttribute("type"))
    }

    /// Whether this message is a request.
    pub fn is_request(&self) -> bool {
        self.mode == Some(CtlMode::Request)
    }

    /// Whether this message is a positive reply.
    pub fn is_pos_reply(&self) -> bool {
        self.mode == Some(CtlMode::PosReply)
    }

    /// The required comtree attribute.
    pub fn req_comtree(&self) -> Result<ComtreeNum, ProtoError> {
        self.comtree.ok_or(ProtoError::MissingAttribute("comtree"))
    }

    /// The required link attribute.
    pub fn req_link(&self) -> Result<u32, ProtoError> {
        self.link.ok_or(ProtoError::MissingAttribute("link"))
    }

    /// The required first address attribute.
    pub fn req_adr1(&self) -> Result<ForestAddr, ProtoError> {
        self.adr1.ok_or(ProtoError::MissingAttribute("adr1"))
    }

    /// The required second address attribute.
    pub fn req_adr2(&self) -> Result<ForestAddr, ProtoError> {
        self.adr2.ok_or(ProtoError::MissingAttribute("adr2"))
    }

    /// The required IP attribute.
    pub fn req_ip1(&self) -> Result<Ipv4Addr, ProtoError> {
        self.ip1.ok_or(ProtoError::MissingAttribute("ip1"))
    }

    /// The required port attribute.
    pub fn req_port1(&self) -> Result<u16, ProtoError> {
        self.port1.ok_or(ProtoError::MissingAttribute("port1"))
    }

    /// The required first rate spec attribute.
    pub fn req_rates1(&self) -> Result<RateSpec, ProtoError> {
        self.rates1.ok_or(ProtoError::MissingAttribute("rates1"))
    }

    /// The required zip attribute.
    pub fn req_zip(&self) -> Result<u16, ProtoError> {
        self.zip.ok_or(ProtoError::MissingAttribute("zip"))
    }

    /// The required nonce attribute.
    pub fn req_nonce(&self) -> Result<u64, ProtoError> {
        self.nonce.ok_or(ProtoError::MissingAttribute("nonce"))
    }
}

impl std::fmt::Display for CtlMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{:?} seq={}", self.typ, self.mode, self.seq)?;
        if let Some(c) = self.comtree {
            write!(f, " comtree={c}")?;
        }
        if let Some(e) = &self.err_msg {
            write!(f, " err=\"{e}\"")?;
        }
        Ok(())
    }
}

/// The payload of a packet.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// A control message (signaling packets).
    Ctl(CtlMsg),
    /// A connect/disconnect payload carrying the link nonce.
    Nonce(u64),
    /// Anything else; the control plane never inspects it.
    Opaque(Vec<u8>),
}

/// A Forest packet in decoded form.
///
/// The byte header (version, length, checksums) belongs to the external
/// codec; this struct keeps the routed fields plus the tunnel source the
/// packet arrived from, which is where replies to not-yet-booted nodes must
/// be sent.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// The packet type.
    pub ptype: PacketType,
    /// Header flags; carried through untouched.
    pub flags: u8,
    /// The comtree the packet travels on.
    pub comtree: ComtreeNum,
    /// The source forest address.
    pub src: ForestAddr,
    /// The destination forest address; the unassigned address means "send to
    /// the tunnel endpoint".
    pub dst: ForestAddr,
    /// Source IP the packet arrived from (filled by the transport).
    pub tun_ip: Ipv4Addr,
    /// Source port the packet arrived from (filled by the transport).
    pub tun_port: u16,
    /// The payload.
    pub payload: Payload,
}

impl Packet {
    /// Build a signaling packet around a control message. The packet type
    /// and comtree follow from the message type.
    pub fn signaling(msg: CtlMsg, src: ForestAddr, dst: ForestAddr) -> Self {
        let client = msg.typ.map(|t| t.is_client_sig()).unwrap_or(false);
        Packet {
            ptype: if client {
                PacketType::ClientSig
            } else {
                PacketType::NetSig
            },
            flags: 0,
            comtree: if client { CLIENT_SIG_COMT } else { NET_SIG_COMT },
            src,
            dst,
            tun_ip: Ipv4Addr::UNSPECIFIED,
            tun_port: 0,
            payload: Payload::Ctl(msg),
        }
    }

    /// Build a connect or disconnect packet for the access link.
    pub fn connect(src: ForestAddr, dst: ForestAddr, nonce: u64, disconnect: bool) -> Self {
        Packet {
            ptype: if disconnect {
                PacketType::Disconnect
            } else {
                PacketType::Connect
            },
            flags: 0,
            comtree: CONNECT_COMT,
            src,
            dst,
            tun_ip: Ipv4Addr::UNSPECIFIED,
            tun_port: 0,
            payload: Payload::Nonce(nonce),
        }
    }

    /// The control message of a signaling packet.
    pub fn ctl(&self) -> Option<&CtlMsg> {
        match &self.payload {
            Payload::Ctl(msg) => Some(msg),
            _ => None,
        }
    }

    /// Mutable access to the control message of a signaling packet.
    pub fn ctl_mut(&mut self) -> Option<&mut CtlMsg> {
        match &mut self.payload {
            Payload::Ctl(msg) => Some(msg),
            _ => None,
        }
    }

    /// The tunnel endpoint the packet arrived from.
    pub fn tunnel(&self) -> (Ipv4Addr, u16) {
        (self.tun_ip, self.tun_port)
    }
}
