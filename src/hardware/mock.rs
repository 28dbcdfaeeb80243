//! Mock drivers with injection hooks for tests and hardware-free operation.

use std::collections::HashMap;

use anyhow::{Result, bail};

use crate::dmx::{DmxAddr, DmxBuffer, UNIVERSE_COUNT, UniverseIdx, validate_universe};

use super::{ChannelMode, DIGITAL_HIGH_VOLTS, DmxSink, IoDevice};

/// In-memory I/O device. Simulated inputs are injected with the
/// `simulate_*` hooks.
pub struct MockIo {
    connected: bool,
    channel_modes: HashMap<u8, ChannelMode>,
    analog_volts: HashMap<u8, f64>,
    digital_states: HashMap<u8, bool>,
    pwm_duties: HashMap<u8, f64>,
    pub reads: u64,
    pub writes: u64,
}

impl MockIo {
    pub fn new() -> Self {
        Self {
            connected: false,
            channel_modes: HashMap::new(),
            analog_volts: HashMap::new(),
            digital_states: HashMap::new(),
            pwm_duties: HashMap::new(),
            reads: 0,
            writes: 0,
        }
    }

    /// Inject an analog voltage reading.
    pub fn simulate_analog(&mut self, channel: u8, volts: f64) {
        self.analog_volts.insert(channel, volts);
    }

    /// Inject a digital input state.
    pub fn simulate_digital(&mut self, channel: u8, state: bool) {
        self.digital_states.insert(channel, state);
    }

    pub fn channel_mode(&self, channel: u8) -> Option<ChannelMode> {
        self.channel_modes.get(&channel).copied()
    }

    pub fn pwm_duty(&self, channel: u8) -> Option<f64> {
        self.pwm_duties.get(&channel).copied()
    }
}

impl Default for MockIo {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDevice for MockIo {
    fn connect(&mut self) -> Result<bool> {
        self.connected = true;
        Ok(true)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn health_check(&mut self) -> Result<bool> {
        Ok(self.connected)
    }

    fn read_analog(&mut self, channel: u8) -> Result<f64> {
        if !self.connected {
            bail!("mock I/O device not connected");
        }
        self.reads += 1;
        Ok(self.analog_volts.get(&channel).copied().unwrap_or(0.0))
    }

    fn read_digital(&mut self, channel: u8) -> Result<bool> {
        if !self.connected {
            bail!("mock I/O device not connected");
        }
        self.reads += 1;
        if let Some(state) = self.digital_states.get(&channel) {
            return Ok(*state);
        }
        // A digital pin surfaced via the analog path reads HIGH above the
        // TTL threshold.
        Ok(self
            .analog_volts
            .get(&channel)
            .map(|volts| *volts > DIGITAL_HIGH_VOLTS)
            .unwrap_or(false))
    }

    fn configure_channel(&mut self, channel: u8, mode: ChannelMode) -> Result<()> {
        self.channel_modes.insert(channel, mode);
        Ok(())
    }

    fn set_pwm(&mut self, channel: u8, duty: f64) -> Result<()> {
        if !self.connected {
            bail!("mock I/O device not connected");
        }
        self.writes += 1;
        self.pwm_duties.insert(channel, duty.clamp(0.0, 1.0));
        Ok(())
    }

    fn is_mock(&self) -> bool {
        true
    }
}

/// In-memory DMX sink recording every frame it is handed.
pub struct MockDmx {
    connected: bool,
    universes: [DmxBuffer; UNIVERSE_COUNT],
    /// Count of full-universe sends, per universe.
    pub universe_sends: [usize; UNIVERSE_COUNT],
}

impl MockDmx {
    pub fn new() -> Self {
        Self {
            connected: false,
            universes: [[0; 512]; UNIVERSE_COUNT],
            universe_sends: [0; UNIVERSE_COUNT],
        }
    }

    pub fn universe(&self, universe: UniverseIdx) -> &DmxBuffer {
        &self.universes[universe]
    }

    pub fn channel_value(&self, universe: UniverseIdx, addr: DmxAddr) -> u8 {
        self.universes[universe][addr.dmx_index()]
    }
}

impl Default for MockDmx {
    fn default() -> Self {
        Self::new()
    }
}

impl DmxSink for MockDmx {
    fn connect(&mut self) -> Result<bool> {
        self.connected = true;
        Ok(true)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn health_check(&mut self) -> Result<bool> {
        Ok(self.connected)
    }

    fn set_channel(&mut self, universe: UniverseIdx, addr: DmxAddr, value: u8) -> Result<()> {
        validate_universe(universe)?;
        addr.validate()?;
        self.universes[universe][addr.dmx_index()] = value;
        Ok(())
    }

    fn set_channels(&mut self, universe: UniverseIdx, values: &[(DmxAddr, u8)]) -> Result<()> {
        for (addr, value) in values {
            self.set_channel(universe, *addr, *value)?;
        }
        Ok(())
    }

    fn set_universe(&mut self, universe: UniverseIdx, frame: &DmxBuffer) -> Result<()> {
        validate_universe(universe)?;
        if !self.connected {
            bail!("mock DMX sink not connected");
        }
        self.universes[universe] = *frame;
        self.universe_sends[universe] += 1;
        Ok(())
    }
}
