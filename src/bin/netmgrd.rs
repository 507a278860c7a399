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

//! The Forest network manager daemon.
//!
//! ```text
//! netmgrd <topologyFile> <prefixFile> <finTime>
//! ```
//!
//! The topology file describes the network plus any pre-configured
//! comtrees: the topology records come first, terminated by `;`, followed
//! by an optional comtree section. The daemon reads and verifies both,
//! provisions the pre-configured comtrees, and runs the substrate until
//! `finTime` seconds have elapsed (0 = run forever). Logs go to stderr;
//! exits non-zero on any initialization failure.

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::*;

use forestctl::comtree::ComtreeSet;
use forestctl::controller::{generate_nonce, Controller};
use forestctl::prefix::PrefixTable;
use forestctl::proto::NM_PORT;
use forestctl::substrate::{Substrate, UdpTransport, DEFAULT_POOL_SIZE};
use forestctl::topology::{NetView, Topology};

/// The UDP port Forest routers listen on.
const RTR_PORT: u16 = 30123;
/// The comtree numbers this controller hands out.
const COMT_RANGE: (u32, u32) = (1001, 10_000);

fn init() -> Result<(Substrate<UdpTransport>, Controller, Option<Duration>), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        return Err("usage: netmgrd topologyFile prefixFile finTime".into());
    }
    let fin_time: u64 = args[3]
        .parse()
        .map_err(|_| format!("invalid finTime {}", args[3]))?;

    // the topology file carries the comtree section after the topology
    let topo_text =
        std::fs::read_to_string(&args[1]).map_err(|e| format!("cannot read {}: {e}", args[1]))?;
    let (mut topo, comt_text) =
        Topology::read_section(&topo_text).map_err(|e| format!("error in topology file: {e}"))?;
    if !topo.check() {
        return Err("topology file failed consistency checks".into());
    }
    let comts = ComtreeSet::read(comt_text, &mut topo)
        .map_err(|e| format!("error in comtree section: {e}"))?;

    let prefix_text =
        std::fs::read_to_string(&args[2]).map_err(|e| format!("cannot read {}: {e}", args[2]))?;
    let prefixes =
        PrefixTable::read(&prefix_text).map_err(|e| format!("error in prefix file: {e}"))?;

    // our own node, access router and the router's interface address
    let me = topo
        .node_by_name("netMgr")
        .map_err(|_| "could not find netMgr in topology file".to_string())?;
    let my_adr = topo.node_addr(me);
    let (rtr_adr, rtr_ip) = {
        let lnk = topo
            .access_link(me)
            .ok_or_else(|| "netMgr has no access link".to_string())?;
        let rtr = topo
            .peer(me, lnk)
            .map_err(|e| format!("bad access link: {e}"))?;
        let iface = topo
            .first_iface(rtr)
            .ok_or_else(|| "netMgr's router has no interface".to_string())?;
        let ip = topo
            .iface(rtr, iface)
            .map(|i| i.ip)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        (topo.node_addr(rtr), ip)
    };

    let view = Arc::new(NetView::new(topo, comts));
    let controller = Controller::new(view, prefixes, my_adr, COMT_RANGE);

    let transport = UdpTransport::bind(NM_PORT, (rtr_ip, RTR_PORT))
        .map_err(|e| format!("cannot bind UDP port {NM_PORT}: {e}"))?;
    let substrate = Substrate::new(my_adr, DEFAULT_POOL_SIZE, transport)
        .with_router(rtr_adr, generate_nonce());

    let fin = (fin_time > 0).then(|| Duration::from_secs(fin_time));
    Ok((substrate, controller, fin))
}

fn main() -> ExitCode {
    env_logger::init();
    let (mut substrate, controller, fin) = match init() {
        Ok(parts) => parts,
        Err(msg) => {
            error!("netmgrd: {msg}");
            return ExitCode::FAILURE;
        }
    };
    info!("netmgrd running");
    substrate.run(|pkt, cph| controller.dispatch(pkt, cph), fin);
    ExitCode::SUCCESS
}
