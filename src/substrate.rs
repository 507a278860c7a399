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

//! # The controller substrate
//!
//! The shared runtime under every controller: one I/O thread and a fixed
//! pool of worker threads. The I/O thread polls the [`Transport`] for
//! packets, hands each new signaling request to an idle worker, routes
//! replies back to the worker that sent the matching request, assigns
//! sequence numbers to outgoing requests, and expires requests whose replies
//! never arrive. Duplicate inbound requests, keyed by (source address,
//! sequence number), are dropped while the first one is still in flight.
//!
//! Ownership of a packet moves with it: a packet sent through a channel is
//! gone from the sender's side, so no two threads ever look at one packet.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::*;

use crate::proto::handler::{CfgHandler, WorkerOut};
use crate::proto::{CtlMode, Packet, PacketType, SEQ_ASSIGN};
use crate::types::ForestAddr;

/// How long the I/O thread keeps an outbound request mapped before the
/// worker is assumed to have given up on it.
const OUT_REQ_TIMEOUT: Duration = Duration::from_secs(2);
/// Sleep when there is nothing to do.
const IDLE_SLEEP: Duration = Duration::from_millis(1);
/// Default number of worker threads.
pub const DEFAULT_POOL_SIZE: usize = 100;

/// The seam over the datagram socket.
///
/// A transport moves whole packets; the byte-level codec lives behind this
/// trait. `recv` must not block. Implementations fill the tunnel fields of
/// received packets with the datagram's source endpoint, and honor an
/// unassigned destination address by sending to the packet's tunnel
/// endpoint.
pub trait Transport: Send {
    /// Transmit one packet.
    fn send(&mut self, pkt: Packet);
    /// Poll for one received packet.
    fn recv(&mut self) -> Option<Packet>;
}

/// A [`Transport`] over a UDP socket with JSON-encoded packets, standing in
/// for the production codec. Routable destinations go to the configured
/// forest router; unassigned destinations go to the packet's tunnel
/// endpoint.
#[derive(Debug)]
pub struct UdpTransport {
    sock: UdpSocket,
    rtr: (Ipv4Addr, u16),
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind a UDP transport on the given local port, forwarding routable
    /// packets to `rtr`.
    pub fn bind(port: u16, rtr: (Ipv4Addr, u16)) -> io::Result<Self> {
        let sock = UdpSocket::bind(("0.0.0.0", port))?;
        sock.set_nonblocking(true)?;
        Ok(UdpTransport {
            sock,
            rtr,
            buf: vec![0; 65536],
        })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, pkt: Packet) {
        let (ip, port) = if pkt.dst.is_unassigned() {
            pkt.tunnel()
        } else {
            self.rtr
        };
        match serde_json::to_vec(&pkt) {
            Ok(buf) => {
                if let Err(e) = self.sock.send_to(&buf, SocketAddrV4::new(ip, port)) {
                    warn!("send to {ip}:{port} failed: {e}");
                }
            }
            Err(e) => error!("cannot encode outgoing packet: {e}"),
        }
    }

    fn recv(&mut self) -> Option<Packet> {
        match self.sock.recv_from(&mut self.buf) {
            Ok((n, from)) => match serde_json::from_slice::<Packet>(&self.buf[..n]) {
                Ok(mut pkt) => {
                    if let SocketAddr::V4(v4) = from {
                        pkt.tun_ip = *v4.ip();
                        pkt.tun_port = v4.port();
                    }
                    Some(pkt)
                }
                Err(e) => {
                    warn!("dropping undecodable packet from {from}: {e}");
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("recv failed: {e}");
                None
            }
        }
    }
}

struct WorkerSlot {
    tx: Sender<Packet>,
    idle: bool,
    /// the inbound (srcAdr, seqNum) key this worker is serving
    in_key: Option<u64>,
    /// the worker's outstanding outbound request and its deadline
    pending: Option<(u64, Instant)>,
}

struct IoState {
    slots: Vec<WorkerSlot>,
    in_req_map: HashMap<u64, usize>,
    out_req_map: HashMap<u64, usize>,
    next_seq: u64,
}

fn req_key(src: ForestAddr, seq: u64) -> u64 {
    ((src.0 as u64) << 32) | (seq & 0xffff_ffff)
}

impl IoState {
    fn idle_worker(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.idle)
    }

    /// Route one received packet.
    fn inbound(&mut self, pkt: Packet) {
        if !matches!(pkt.ptype, PacketType::ClientSig | PacketType::NetSig) {
            return; // non-signaling packets are not ours
        }
        let (mode, seq) = match pkt.ctl() {
            Some(cp) => (cp.mode, cp.seq),
            None => return,
        };
        if mode == Some(CtlMode::Request) {
            let key = req_key(pkt.src, seq);
            if self.in_req_map.contains_key(&key) {
                trace!("duplicate request from {} seq {seq}, dropped", pkt.src);
                return;
            }
            let wid = match self.idle_worker() {
                Some(w) => w,
                None => {
                    warn!("worker pool is exhausted, dropping request from {}", pkt.src);
                    return;
                }
            };
            self.in_req_map.insert(key, wid);
            let slot = &mut self.slots[wid];
            slot.idle = false;
            slot.in_key = Some(key);
            let _ = slot.tx.send(pkt);
        } else {
            // a reply: route to the worker that sent the request
            match self.out_req_map.remove(&seq) {
                Some(wid) => {
                    self.slots[wid].pending = None;
                    let _ = self.slots[wid].tx.send(pkt);
                }
                None => trace!("reply with unknown seq {seq}, dropped"),
            }
        }
    }

    /// Process one item from a worker's output.
    fn outbound<T: Transport>(&mut self, wid: usize, out: WorkerOut, transport: &mut T) {
        match out {
            WorkerOut::Done => {
                let slot = &mut self.slots[wid];
                if let Some(key) = slot.in_key.take() {
                    self.in_req_map.remove(&key);
                }
                if let Some((seq, _)) = slot.pending.take() {
                    self.out_req_map.remove(&seq);
                }
                slot.idle = true;
            }
            WorkerOut::Pkt(mut pkt) => {
                let req_seq = match pkt.ctl() {
                    Some(cp) if cp.mode == Some(CtlMode::Request) => cp.seq,
                    _ => {
                        transport.send(pkt);
                        return;
                    }
                };
                if req_seq == SEQ_ASSIGN {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    if let Some(cp) = pkt.ctl_mut() {
                        cp.seq = seq;
                    }
                    self.out_req_map.insert(seq, wid);
                    self.slots[wid].pending = Some((seq, Instant::now() + OUT_REQ_TIMEOUT));
                    transport.send(pkt);
                } else {
                    // a retry: reuse the assigned number if the request is
                    // still outstanding, else a reply is already on its way
                    let pending = self.slots[wid].pending;
                    match pending {
                        Some((seq, _)) if self.out_req_map.contains_key(&seq) => {
                            if let Some(cp) = pkt.ctl_mut() {
                                cp.seq = seq;
                            }
                            self.slots[wid].pending =
                                Some((seq, Instant::now() + OUT_REQ_TIMEOUT));
                            transport.send(pkt);
                        }
                        _ => {
                            self.slots[wid].pending = None;
                            trace!("suppressing retry from worker {wid}");
                        }
                    }
                }
            }
        }
    }

    /// Drop the outbound mappings of requests whose replies are overdue.
    fn expire(&mut self, now: Instant) {
        for slot in self.slots.iter_mut() {
            if let Some((seq, deadline)) = slot.pending {
                if deadline < now {
                    self.out_req_map.remove(&seq);
                    slot.pending = None;
                }
            }
        }
    }
}

/// # The substrate runtime
///
/// Owns the transport and the worker pool. [`Substrate::run`] blocks in the
/// I/O loop until the optional finish time elapses; the handler closure is
/// invoked on a worker thread once per inbound request.
pub struct Substrate<T> {
    my_adr: ForestAddr,
    pool_size: usize,
    transport: T,
    rtr_adr: Option<ForestAddr>,
    nonce: u64,
}

impl<T> std::fmt::Debug for Substrate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substrate")
            .field("my_adr", &self.my_adr)
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Substrate<T> {
    /// Create a substrate for the controller at `my_adr` with the given
    /// worker-pool size.
    pub fn new(my_adr: ForestAddr, pool_size: usize, transport: T) -> Self {
        Substrate {
            my_adr,
            pool_size,
            transport,
            rtr_adr: None,
            nonce: 0,
        }
    }

    /// Connect to the access router on startup using this nonce, and
    /// disconnect on shutdown.
    pub fn with_router(mut self, rtr_adr: ForestAddr, nonce: u64) -> Self {
        self.rtr_adr = Some(rtr_adr);
        self.nonce = nonce;
        self
    }

    /// Run the I/O loop, dispatching inbound requests to `handler` on the
    /// worker threads. Returns when `fin_time` elapses (run forever if
    /// `None`).
    pub fn run<F>(&mut self, handler: F, fin_time: Option<Duration>)
    where
        F: Fn(Packet, &mut CfgHandler) + Sync,
    {
        let my_adr = self.my_adr;
        let pool_size = self.pool_size;
        if let Some(rtr) = self.rtr_adr {
            self.transport.send(Packet::connect(my_adr, rtr, self.nonce, false));
        }
        let transport = &mut self.transport;
        let handler = &handler;
        let result = crossbeam::thread::scope(|s| {
            let (out_tx, out_rx) = unbounded::<(usize, WorkerOut)>();
            let mut state = IoState {
                slots: Vec::with_capacity(pool_size),
                in_req_map: HashMap::new(),
                out_req_map: HashMap::new(),
                next_seq: 1,
            };
            for wid in 0..pool_size {
                let (in_tx, in_rx) = unbounded::<Packet>();
                let otx = out_tx.clone();
                s.builder()
                    .name(format!("worker-{wid}"))
                    .spawn(move |_| worker_loop(wid, my_adr, in_rx, otx, handler))
                    .expect("failed to spawn worker thread");
                state.slots.push(WorkerSlot {
                    tx: in_tx,
                    idle: true,
                    in_key: None,
                    pending: None,
                });
            }
            drop(out_tx);

            let start = Instant::now();
            loop {
                if let Some(fin) = fin_time {
                    if start.elapsed() >= fin {
                        break;
                    }
                }
                let mut nothing2do = true;
                while let Some(pkt) = transport.recv() {
                    nothing2do = false;
                    state.inbound(pkt);
                }
                while let Ok((wid, out)) = out_rx.try_recv() {
                    nothing2do = false;
                    state.outbound(wid, out, transport);
                }
                state.expire(Instant::now());
                if nothing2do {
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
            // dropping the slots closes the worker inputs; the scope joins
            state.slots.clear();
        });
        if result.is_err() {
            error!("a worker thread panicked");
        }
        if let Some(rtr) = self.rtr_adr {
            self.transport.send(Packet::connect(my_adr, rtr, self.nonce, true));
        }
    }
}

/// One worker: block on the input queue, run the handler for each request,
/// signal completion so the I/O thread returns the worker to the idle set.
fn worker_loop<F>(
    wid: usize,
    my_adr: ForestAddr,
    inq: Receiver<Packet>,
    outq: Sender<(usize, WorkerOut)>,
    handler: &F,
) where
    F: Fn(Packet, &mut CfgHandler) + Sync,
{
    while let Ok(pkt) = inq.recv() {
        let mut cph = CfgHandler::new(my_adr, wid, inq.clone(), outq.clone());
        handler(pkt, &mut cph);
        if outq.send((wid, WorkerOut::Done)).is_err() {
            break;
        }
    }
}
