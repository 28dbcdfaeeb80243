//! DMX sink backed by real output ports (serial, artnet, or offline).

use anyhow::Result;
use log::{debug, warn};
use rust_dmx::DmxPort;

use crate::dmx::{DmxAddr, DmxBuffer, UNIVERSE_COUNT, UniverseIdx, validate_universe};
use crate::error::CoreError;

use super::DmxSink;

/// Drives one `rust_dmx` port per universe. Universes without an assigned
/// port are silently dropped; shadow frames keep per-channel writes cheap.
pub struct PortDmx {
    ports: Vec<Box<dyn DmxPort>>,
    shadows: [DmxBuffer; UNIVERSE_COUNT],
    connected: bool,
    last_write_ok: bool,
    write_failures: u64,
}

impl PortDmx {
    /// One port per universe, in universe order.
    pub fn new(ports: Vec<Box<dyn DmxPort>>) -> Self {
        Self {
            ports,
            shadows: [[0; 512]; UNIVERSE_COUNT],
            connected: false,
            last_write_ok: true,
            write_failures: 0,
        }
    }

    fn write_universe(&mut self, universe: UniverseIdx) -> Result<()> {
        let Some(port) = self.ports.get_mut(universe) else {
            debug!("no DMX port assigned to universe {universe}, dropping frame");
            return Ok(());
        };
        match port.write(&self.shadows[universe]) {
            Ok(()) => {
                self.last_write_ok = true;
                Ok(())
            }
            Err(err) => {
                self.last_write_ok = false;
                self.write_failures += 1;
                Err(CoreError::HardwareTransient(format!(
                    "DMX write to universe {universe}: {err}"
                ))
                .into())
            }
        }
    }
}

impl DmxSink for PortDmx {
    fn connect(&mut self) -> Result<bool> {
        if self.ports.is_empty() {
            warn!("no DMX ports assigned");
        }
        self.connected = true;
        self.last_write_ok = true;
        Ok(true)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn health_check(&mut self) -> Result<bool> {
        Ok(self.connected && self.last_write_ok)
    }

    fn set_channel(&mut self, universe: UniverseIdx, addr: DmxAddr, value: u8) -> Result<()> {
        validate_universe(universe)?;
        addr.validate()?;
        self.shadows[universe][addr.dmx_index()] = value;
        self.write_universe(universe)
    }

    fn set_channels(&mut self, universe: UniverseIdx, values: &[(DmxAddr, u8)]) -> Result<()> {
        validate_universe(universe)?;
        for (addr, value) in values {
            addr.validate()?;
            self.shadows[universe][addr.dmx_index()] = *value;
        }
        self.write_universe(universe)
    }

    fn set_universe(&mut self, universe: UniverseIdx, frame: &DmxBuffer) -> Result<()> {
        validate_universe(universe)?;
        if !self.connected {
            return Err(CoreError::HardwareUnavailable("DMX sink not connected".into()).into());
        }
        self.shadows[universe] = *frame;
        self.write_universe(universe)
    }
}
