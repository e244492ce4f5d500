// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time.
//!
//! Time is counted in ticks since boot. The counter is deliberately 64
//! bits wide: a 32-bit tick count at 1 kHz wraps after about 49 days,
//! and sleep deadlines compared against a wrapping counter can fire
//! spuriously. At 64 bits the counter outlives the hardware, so
//! deadline checks are a plain `<=` with no wrap handling anywhere.
//!
//! The target CPU cannot store 64 bits atomically; the tick handler
//! therefore maintains the count as two 32-bit halves and code reads
//! them under conditions where the halves cannot tear (see the `TICKS`
//! notes in `arch::arm_m`). [`Timestamp::from_halves`] is the seam
//! where those halves become a value again.

/// A point in kernel time, in ticks since boot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Timestamp {
    ticks: u64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp::from_ticks(0);

    pub const fn from_ticks(ticks: u64) -> Self {
        Timestamp { ticks }
    }

    /// Reassembles a timestamp from the split representation the tick
    /// handler maintains.
    pub const fn from_halves(lo: u32, hi: u32) -> Self {
        Timestamp::from_ticks((hi as u64) << 32 | lo as u64)
    }

    /// The raw tick count.
    pub const fn ticks(self) -> u64 {
        self.ticks
    }

    /// Splits the count back into the halves the tick handler stores.
    pub const fn halves(self) -> (u32, u32) {
        (self.ticks as u32, (self.ticks >> 32) as u32)
    }
}

impl core::ops::Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, ticks: u64) -> Timestamp {
        Timestamp::from_ticks(self.ticks.wrapping_add(ticks))
    }
}
