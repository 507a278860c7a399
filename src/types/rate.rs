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

//! Rate specifications for links and comtrees.
//!
//! A [`RateSpec`] describes the contract of a link as four non-negative
//! numbers: bit rate and packet rate, each in the "up" and "down" direction.
//! For underlay links, "up" means from the left endpoint. A [`RateDelta`] is
//! the signed difference of two rate specs; rate re-provisioning works in
//! deltas so that a shrinking subtree can release capacity.

use serde::{Deserialize, Serialize};

/// A bandwidth contract: (bitRateUp, bitRateDown, pktRateUp, pktRateDown).
///
/// All components are non-negative; arithmetic saturates at zero.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateSpec {
    /// Bit rate away from the child (towards the tree root), in kb/s.
    pub bit_rate_up: u32,
    /// Bit rate towards the child, in kb/s.
    pub bit_rate_down: u32,
    /// Packet rate away from the child, in p/s.
    pub pkt_rate_up: u32,
    /// Packet rate towards the child, in p/s.
    pub pkt_rate_down: u32,
}

impl RateSpec {
    /// Create a rate spec from its four components.
    pub const fn new(bru: u32, brd: u32, pru: u32, prd: u32) -> Self {
        RateSpec {
            bit_rate_up: bru,
            bit_rate_down: brd,
            pkt_rate_up: pru,
            pkt_rate_down: prd,
        }
    }

    /// The all-zero rate spec.
    pub const ZERO: RateSpec = RateSpec::new(0, 0, 0, 0);

    /// Componentwise sum, saturating.
    pub fn add(&mut self, other: RateSpec) {
        self.bit_rate_up = self.bit_rate_up.saturating_add(other.bit_rate_up);
        self.bit_rate_down = self.bit_rate_down.saturating_add(other.bit_rate_down);
        self.pkt_rate_up = self.pkt_rate_up.saturating_add(other.pkt_rate_up);
        self.pkt_rate_down = self.pkt_rate_down.saturating_add(other.pkt_rate_down);
    }

    /// Componentwise difference, saturating at zero.
    pub fn subtract(&mut self, other: RateSpec) {
        self.bit_rate_up = self.bit_rate_up.saturating_sub(other.bit_rate_up);
        self.bit_rate_down = self.bit_rate_down.saturating_sub(other.bit_rate_down);
        self.pkt_rate_up = self.pkt_rate_up.saturating_sub(other.pkt_rate_up);
        self.pkt_rate_down = self.pkt_rate_down.saturating_sub(other.pkt_rate_down);
    }

    /// Swap the up and down components. Used whenever a rate spec expressed
    /// from one endpoint of a link must be applied at the other endpoint.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.bit_rate_up, &mut self.bit_rate_down);
        std::mem::swap(&mut self.pkt_rate_up, &mut self.pkt_rate_down);
    }

    /// Return a flipped copy.
    pub fn flipped(mut self) -> Self {
        self.flip();
        self
    }

    /// Scale every component by the given factor, rounding to nearest.
    pub fn scale(&mut self, factor: f64) {
        self.bit_rate_up = (self.bit_rate_up as f64 * factor).round() as u32;
        self.bit_rate_down = (self.bit_rate_down as f64 * factor).round() as u32;
        self.pkt_rate_up = (self.pkt_rate_up as f64 * factor).round() as u32;
        self.pkt_rate_down = (self.pkt_rate_down as f64 * factor).round() as u32;
    }

    /// Componentwise comparison; the feasibility test used everywhere.
    pub fn leq(&self, other: &RateSpec) -> bool {
        self.bit_rate_up <= other.bit_rate_up
            && self.bit_rate_down <= other.bit_rate_down
            && self.pkt_rate_up <= other.pkt_rate_up
            && self.pkt_rate_down <= other.pkt_rate_down
    }

    /// Returns `true` if all components are zero.
    pub fn is_zero(&self) -> bool {
        *self == RateSpec::ZERO
    }

    /// Signed componentwise difference `self - other`.
    pub fn diff(&self, other: &RateSpec) -> RateDelta {
        RateDelta {
            bit_rate_up: self.bit_rate_up as i64 - other.bit_rate_up as i64,
            bit_rate_down: self.bit_rate_down as i64 - other.bit_rate_down as i64,
            pkt_rate_up: self.pkt_rate_up as i64 - other.pkt_rate_up as i64,
            pkt_rate_down: self.pkt_rate_down as i64 - other.pkt_rate_down as i64,
        }
    }

    /// Apply a signed delta, clamping every component at zero.
    pub fn apply(&mut self, delta: RateDelta) {
        self.bit_rate_up = clamp(self.bit_rate_up as i64 + delta.bit_rate_up);
        self.bit_rate_down = clamp(self.bit_rate_down as i64 + delta.bit_rate_down);
        self.pkt_rate_up = clamp(self.pkt_rate_up as i64 + delta.pkt_rate_up);
        self.pkt_rate_down = clamp(self.pkt_rate_down as i64 + delta.pkt_rate_down);
    }
}

fn clamp(x: i64) -> u32 {
    x.clamp(0, u32::MAX as i64) as u32
}

impl std::fmt::Display for RateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.bit_rate_up, self.bit_rate_down, self.pkt_rate_up, self.pkt_rate_down
        )
    }
}

impl std::fmt::Debug for RateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// The signed difference between two [`RateSpec`]s.
///
/// Produced by [`RateSpec::diff`]; components are negative when a link needs
/// less capacity than it currently holds.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateDelta {
    /// Change of the up bit rate.
    pub bit_rate_up: i64,
    /// Change of the down bit rate.
    pub bit_rate_down: i64,
    /// Change of the up packet rate.
    pub pkt_rate_up: i64,
    /// Change of the down packet rate.
    pub pkt_rate_down: i64,
}

impl RateDelta {
    /// Returns `true` if all components are zero.
    pub fn is_zero(&self) -> bool {
        *self == RateDelta::default()
    }

    /// Swap the up and down components.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.bit_rate_up, &mut self.bit_rate_down);
        std::mem::swap(&mut self.pkt_rate_up, &mut self.pkt_rate_down);
    }

    /// Return a flipped copy.
    pub fn flipped(mut self) -> Self {
        self.flip();
        self
    }

    /// Return the componentwise negation.
    pub fn negated(&self) -> Self {
        RateDelta {
            bit_rate_up: -self.bit_rate_up,
            bit_rate_down: -self.bit_rate_down,
            pkt_rate_up: -self.pkt_rate_up,
            pkt_rate_down: -self.pkt_rate_down,
        }
    }

    /// Check whether this change fits within the given available capacity.
    /// Only positive components consume capacity; negative ones release it.
    pub fn fits(&self, avail: &RateSpec) -> bool {
        self.bit_rate_up <= avail.bit_rate_up as i64
            && self.bit_rate_down <= avail.bit_rate_down as i64
            && self.pkt_rate_up <= avail.pkt_rate_up as i64
            && self.pkt_rate_down <= avail.pkt_rate_down as i64
    }
}

impl std::fmt::Display for RateDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:+},{:+},{:+},{:+})",
            self.bit_rate_up, self.bit_rate_down, self.pkt_rate_up, self.pkt_rate_down
        )
    }
}

impl std::fmt::Debug for RateDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
