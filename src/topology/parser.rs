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

//! Reader and writer for the topology file format.
//!
//! A topology file is a sequence of `router(...)`, `leaf(...)`, `link(...)`
//! and `defaultLinkRates(...)` records terminated by `;`. Order matters only
//! within each record; `#` starts a comment. Writing a topology with
//! [`std::fmt::Display`] regenerates a file that reads back to the same
//! observable state.

use std::net::Ipv4Addr;
use std::str::FromStr;

use itertools::Itertools;
use thiserror::Error;

use crate::topology::{Interface, Topology};
use crate::types::{ForestAddr, NetError, NodeType, RateSpec};

/// Errors raised while reading a topology or comtree file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileError {
    /// The input ended or continued with something unexpected
    #[error("syntax error: expected {0}")]
    Expected(&'static str),
    /// A record keyword that this reader does not know
    #[error("unrecognized keyword {0}")]
    UnknownKeyword(String),
    /// A record references a node name that has not been defined
    #[error("unknown node {0}")]
    UnknownNode(String),
    /// A link record does not name a usable link
    #[error("invalid link ({0},{1})")]
    InvalidLink(String, String),
    /// A number was out of range or malformed
    #[error("invalid number {0}")]
    InvalidNumber(String),
    /// Error applying the record to the topology
    #[error("{0}")]
    Net(#[from] NetError),
    /// Error applying a record to the comtree set
    #[error("{0}")]
    Comtree(#[from] crate::types::ComtreeError),
    /// The file read back, but its contents are inconsistent
    #[error("file failed consistency checks")]
    CheckFailed,
}

/// Character-level tokenizer shared by the topology and comtree readers.
#[derive(Debug)]
pub(crate) struct Tokenizer<'a> {
    src: &'a str,
    input: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self {
            src: input,
            input: input.as_bytes(),
            pos: 0,
        }
    }

    /// The unconsumed remainder of the input. Every token is ASCII, so the
    /// position always sits on a character boundary.
    pub(crate) fn rest(&self) -> &'a str {
        self.src.get(self.pos..).unwrap_or("")
    }

    /// Skip whitespace and `#` comments.
    pub(crate) fn skip_blank(&mut self) {
        while self.pos < self.input.len() {
            let c = self.input[self.pos];
            if c == b'#' {
                while self.pos < self.input.len() && self.input[self.pos] != b'\n' {
                    self.pos += 1;
                }
            } else if c.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    pub(crate) fn at_end(&mut self) -> bool {
        self.skip_blank();
        self.pos >= self.input.len()
    }

    /// Consume `c` if it is the next non-blank character.
    pub(crate) fn verify(&mut self, c: char) -> bool {
        self.skip_blank();
        if self.pos < self.input.len() && self.input[self.pos] == c as u8 {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, c: char, what: &'static str) -> Result<(), FileError> {
        if self.verify(c) {
            Ok(())
        } else {
            Err(FileError::Expected(what))
        }
    }

    /// Read an identifier: letters, digits and underscores.
    pub(crate) fn word(&mut self) -> Result<String, FileError> {
        self.skip_blank();
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_alphanumeric() || self.input[self.pos] == b'_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(FileError::Expected("identifier"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    /// Read a run of characters satisfying `pred` and parse it.
    fn lexeme<T: FromStr>(&mut self, pred: fn(u8) -> bool, what: &'static str) -> Result<T, FileError> {
        self.skip_blank();
        let start = self.pos;
        while self.pos < self.input.len() && pred(self.input[self.pos]) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(FileError::Expected(what));
        }
        let s = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        s.parse().map_err(|_| FileError::InvalidNumber(s))
    }

    /// Read an unsigned integer.
    pub(crate) fn uint(&mut self) -> Result<u64, FileError> {
        self.lexeme(|c| c.is_ascii_digit(), "number")
    }

    /// Read a (possibly negative) floating point number.
    pub(crate) fn float(&mut self) -> Result<f64, FileError> {
        self.lexeme(
            |c| c.is_ascii_digit() || c == b'.' || c == b'-',
            "floating point number",
        )
    }

    /// Read a dotted IPv4 address.
    pub(crate) fn ipv4(&mut self) -> Result<Ipv4Addr, FileError> {
        self.lexeme(|c| c.is_ascii_digit() || c == b'.', "IP address")
    }

    /// Read a forest address `zip.local`.
    pub(crate) fn forest_addr(&mut self) -> Result<ForestAddr, FileError> {
        self.skip_blank();
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_digit() || self.input[self.pos] == b'.')
        {
            self.pos += 1;
        }
        let s = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        s.parse().map_err(|_| FileError::Expected("forest address"))
    }

    /// Read a rate spec `(bru,brd,pru,prd)`.
    pub(crate) fn rate_spec(&mut self) -> Result<RateSpec, FileError> {
        self.expect('(', "( before rate spec")?;
        let bru = self.uint()? as u32;
        self.expect(',', "comma in rate spec")?;
        let brd = self.uint()? as u32;
        self.expect(',', "comma in rate spec")?;
        let pru = self.uint()? as u32;
        self.expect(',', "comma in rate spec")?;
        let prd = self.uint()? as u32;
        self.expect(')', ") after rate spec")?;
        Ok(RateSpec::new(bru, brd, pru, prd))
    }

    /// Read a location `(lat,long)`.
    pub(crate) fn location(&mut self) -> Result<(f64, f64), FileError> {
        self.expect('(', "( before location")?;
        let lat = self.float()?;
        self.expect(',', "comma in location")?;
        let lng = self.float()?;
        self.expect(')', ") after location")?;
        Ok((lat, lng))
    }

    /// Read an address range `(first-last)`.
    pub(crate) fn addr_range(&mut self) -> Result<(ForestAddr, ForestAddr), FileError> {
        self.expect('(', "( before address range")?;
        let first = self.forest_addr()?;
        self.expect('-', "dash in address range")?;
        let last = self.forest_addr()?;
        self.expect(')', ") after address range")?;
        Ok((first, last))
    }

    /// Read a link endpoint `name` or `name.llnum`.
    pub(crate) fn link_endpoint(&mut self) -> Result<(String, u32), FileError> {
        let name = self.word()?;
        let mut num = 0;
        if self.verify('.') {
            num = self.uint()? as u32;
        }
        Ok((name, num))
    }
}

impl Topology {
    /// Read a topology from the textual file format. Anything after the
    /// terminating `;` is ignored; see [`Topology::read_section`].
    pub fn read(input: &str) -> Result<Topology, FileError> {
        Self::read_section(input).map(|(topo, _)| topo)
    }

    /// Read the topology section of a network file, returning the topology
    /// and the unconsumed remainder after the terminating `;`. A network
    /// file describes the underlay plus any pre-configured comtrees: the
    /// topology records come first, and the comtree section (if present)
    /// follows for [`crate::comtree::ComtreeSet::read`].
    pub fn read_section(input: &str) -> Result<(Topology, &str), FileError> {
        let mut topo = Topology::new();
        let mut tok = Tokenizer::new(input);
        loop {
            if tok.at_end() || tok.verify(';') {
                break;
            }
            let word = tok.word()?;
            match word.as_str() {
                "router" => read_router(&mut tok, &mut topo)?,
                "leaf" => read_leaf(&mut tok, &mut topo)?,
                "link" => read_link(&mut tok, &mut topo)?,
                "defaultLinkRates" => {
                    let rates = tok.rate_spec()?;
                    topo.set_default_leaf_rates(rates);
                }
                other => return Err(FileError::UnknownKeyword(other.to_string())),
            }
        }
        Ok((topo, tok.rest()))
    }
}

fn read_router(tok: &mut Tokenizer, topo: &mut Topology) -> Result<(), FileError> {
    tok.expect('(', "( after router")?;
    let name = tok.word()?;
    tok.expect(',', "comma after router name")?;
    let addr = tok.forest_addr()?;
    tok.expect(',', "comma after router address")?;
    let location = tok.location()?;
    tok.expect(',', "comma after location")?;
    let leaf_range = tok.addr_range()?;

    let mut ifaces: Vec<Interface> = Vec::new();
    while tok.verify(',') {
        tok.expect('[', "[ before interface")?;
        let num = tok.uint()? as u32;
        if num == 0 {
            return Err(FileError::InvalidNumber("interface 0".to_string()));
        }
        tok.expect(',', "comma after interface number")?;
        let ip = tok.ipv4()?;
        tok.expect(',', "comma after interface IP")?;
        let first_link = tok.uint()? as u32;
        let last_link = if tok.verify('-') {
            tok.uint()? as u32
        } else {
            first_link
        };
        tok.expect(',', "comma after link range")?;
        let rates = tok.rate_spec()?;
        tok.expect(']', "] after interface")?;
        // interface numbers may leave gaps; pad with unconfigured slots
        while ifaces.len() < num as usize {
            ifaces.push(Interface {
                ip: Ipv4Addr::UNSPECIFIED,
                port: 0,
                first_link: 0,
                last_link: 0,
                rates: RateSpec::ZERO,
            });
        }
        ifaces[num as usize - 1] = Interface {
            ip,
            port: 0,
            first_link,
            last_link,
            rates,
        };
    }
    tok.expect(')', ") after router")?;

    let r = topo.add_router(name, addr)?;
    topo.set_location(r, location);
    topo.set_leaf_range(r, leaf_range)?;
    topo.set_interfaces(r, ifaces)?;
    Ok(())
}

fn read_leaf(tok: &mut Tokenizer, topo: &mut Topology) -> Result<(), FileError> {
    tok.expect('(', "( after leaf")?;
    let name = tok.word()?;
    tok.expect(',', "comma after leaf name")?;
    let ntype: NodeType = tok
        .word()?
        .parse()
        .map_err(|_| FileError::Expected("leaf type"))?;
    tok.expect(',', "comma after leaf type")?;
    let ip = tok.ipv4()?;
    tok.expect(',', "comma after leaf IP")?;
    let addr = tok.forest_addr()?;
    tok.expect(',', "comma after leaf address")?;
    let location = tok.location()?;
    tok.expect(')', ") after leaf")?;

    let n = topo.add_leaf(name, ntype, ip, addr)?;
    topo.set_location(n, location);
    Ok(())
}

fn read_link(tok: &mut Tokenizer, topo: &mut Topology) -> Result<(), FileError> {
    tok.expect('(', "( after link")?;
    let (name_l, num_l) = tok.link_endpoint()?;
    tok.expect(',', "comma after first endpoint")?;
    let (name_r, num_r) = tok.link_endpoint()?;
    tok.expect(',', "comma after second endpoint")?;
    let length = tok.uint()? as u32;
    let rates = if tok.verify(',') {
        tok.rate_spec()?
    } else {
        topo.default_leaf_rates()
    };
    tok.expect(')', ") after link")?;

    let a = topo
        .node_by_name(&name_l)
        .map_err(|_| FileError::UnknownNode(name_l.clone()))?;
    let b = topo
        .node_by_name(&name_r)
        .map_err(|_| FileError::UnknownNode(name_r.clone()))?;
    if (topo.is_router(a) && num_l == 0) || (topo.is_router(b) && num_r == 0) {
        return Err(FileError::InvalidLink(name_l, name_r));
    }
    let lnk = topo.add_link(a, b, length, rates)?;
    if topo.is_router(a) {
        topo.set_llnum(lnk, a, num_l)?;
    }
    if topo.is_router(b) {
        topo.set_llnum(lnk, b, num_r)?;
    }
    Ok(())
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // routers, ordered by address for a stable output
        for r in self.routers().sorted_by_key(|r| self.node_addr(*r)) {
            let (lat, lng) = self.location(r);
            let (first, last) = self.leaf_range(r).map_err(|_| std::fmt::Error)?;
            write!(
                f,
                "router({}, {}, ({},{}), ({}-{})",
                self.node_name(r),
                self.node_addr(r),
                lat,
                lng,
                first,
                last
            )?;
            for i in 1..=self.num_ifaces(r) {
                let ifc = match self.iface(r, i) {
                    Some(ifc) if ifc.ip != Ipv4Addr::UNSPECIFIED => ifc,
                    _ => continue,
                };
                write!(f, ",\n\t[ {}, {}, ", i, ifc.ip)?;
                if ifc.first_link == ifc.last_link {
                    write!(f, "{}", ifc.first_link)?;
                } else {
                    write!(f, "{}-{}", ifc.first_link, ifc.last_link)?;
                }
                write!(f, ", {} ]", ifc.rates)?;
            }
            writeln!(f, " )")?;
        }
        // leaves
        for l in self.leaves().sorted_by_key(|l| self.node_addr(*l)) {
            let (lat, lng) = self.location(l);
            let ntype = self.node_type(l).ok_or(std::fmt::Error)?;
            writeln!(
                f,
                "leaf({}, {}, {}, {}, ({},{}))",
                self.node_name(l),
                ntype,
                self.leaf_ip(l).ok_or(std::fmt::Error)?,
                self.node_addr(l),
                lat,
                lng
            )?;
        }
        // links, child endpoint first
        for lnk in self
            .links()
            .sorted_by_key(|l| (self.left(*l).ok(), self.llnum(*l, self.left(*l).unwrap_or_default())))
        {
            let left = self.left(lnk).map_err(|_| std::fmt::Error)?;
            let right = self.right(lnk).map_err(|_| std::fmt::Error)?;
            let link = self.link(lnk).map_err(|_| std::fmt::Error)?;
            write!(f, "link({}", self.node_name(left))?;
            if self.is_router(left) {
                write!(f, ".{}", link.left_llnum)?;
            }
            write!(f, ",{}", self.node_name(right))?;
            if self.is_router(right) {
                write!(f, ".{}", link.right_llnum)?;
            }
            writeln!(f, ",{},{})", link.length, link.rates)?;
        }
        writeln!(f, "defaultLinkRates{}", self.default_leaf_rates())?;
        writeln!(f, ";")
    }
}
