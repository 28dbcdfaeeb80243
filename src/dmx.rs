//! DMX512 addressing for the daemon's output space.
//!
//! The daemon drives a fixed set of four universes, each a 512-slot frame of
//! one byte per slot. Addresses are numbered from 1 on the wire and in
//! configuration; buffers index from 0.

use std::fmt::Display;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// The number of universes the daemon drives, indexed 0-3.
pub const UNIVERSE_COUNT: usize = 4;

/// Slots in one DMX512 universe frame.
pub const SLOTS_PER_UNIVERSE: usize = 512;

/// Index into the DMX universes.
pub type UniverseIdx = usize;

/// A data buffer for one DMX universe.
pub type DmxBuffer = [u8; SLOTS_PER_UNIVERSE];

/// Ensure a universe index names one of the universes the daemon owns.
pub fn validate_universe(universe: UniverseIdx) -> Result<()> {
    ensure!(
        universe < UNIVERSE_COUNT,
        "universe {universe} out of range (0-{})",
        UNIVERSE_COUNT - 1
    );
    Ok(())
}

/// A DMX slot address as configured, numbered from 1.
///
/// Range checking is deferred to snapshot validation rather than done at
/// parse time, so a bad address can be reported against the fixture or
/// switch that carries it.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub struct DmxAddr(usize);

impl DmxAddr {
    /// The frame buffer offset of this address (indexed from 0).
    pub fn dmx_index(&self) -> usize {
        self.0 - 1
    }

    /// True if `count` consecutive slots starting here stay inside one
    /// universe frame. A two-channel tunable white fixture needs its cool
    /// slot to fit too.
    pub fn fits(&self, count: usize) -> bool {
        self.0 >= 1 && self.0 + count <= SLOTS_PER_UNIVERSE + 1
    }

    /// Ensure this address lands on a real slot.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.fits(1),
            "DMX address {} outside 1-{SLOTS_PER_UNIVERSE}",
            self.0
        );
        Ok(())
    }
}

impl Display for DmxAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<usize> for DmxAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}
