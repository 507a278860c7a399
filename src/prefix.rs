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

//! # Client prefix table
//!
//! Maps a client's IP address to the forest address of its access router.
//! The prefix file holds one `<ip-prefix-with-*> <router-forest-addr>` pair
//! per line, most specific first; `*` matches any remaining octets. The
//! first matching line wins.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ForestAddr;

/// Errors raised while reading a prefix file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefixError {
    /// A line did not split into a prefix and an address
    #[error("malformed prefix line: {0}")]
    MalformedLine(String),
    /// The router address did not parse
    #[error("invalid router address in prefix line: {0}")]
    InvalidAddr(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PrefixEntry {
    /// leading octets; `None` marks the `*` wildcard position
    octets: Vec<Option<u8>>,
    rtr_adr: ForestAddr,
}

/// The prefix-to-router table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixTable {
    entries: Vec<PrefixEntry>,
}

impl PrefixTable {
    /// Read a prefix table from its file format.
    pub fn read(input: &str) -> Result<PrefixTable, PrefixError> {
        let mut entries = Vec::new();
        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (prefix, addr) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| PrefixError::MalformedLine(line.to_string()))?;
            let rtr_adr: ForestAddr = addr
                .trim()
                .parse()
                .map_err(|_| PrefixError::InvalidAddr(line.to_string()))?;
            let mut octets = Vec::new();
            for part in prefix.split('.') {
                if part == "*" {
                    octets.push(None);
                    break;
                }
                let o: u8 = part
                    .parse()
                    .map_err(|_| PrefixError::MalformedLine(line.to_string()))?;
                octets.push(Some(o));
            }
            entries.push(PrefixEntry { octets, rtr_adr });
        }
        Ok(PrefixTable { entries })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the access router for a client IP. Entries are scanned in file
    /// order; the first match wins.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<ForestAddr> {
        let ip = ip.octets();
        'entry: for e in &self.entries {
            for (i, oct) in e.octets.iter().enumerate() {
                match oct {
                    None => return Some(e.rtr_adr), // wildcard
                    Some(o) if i < 4 && *o == ip[i] => continue,
                    _ => continue 'entry,
                }
            }
            // a fully literal prefix must cover all four octets
            if e.octets.len() == 4 {
                return Some(e.rtr_adr);
            }
        }
        None
    }
}
