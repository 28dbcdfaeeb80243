//! Hardware abstraction: switch input / PWM devices and DMX sinks.
//!
//! Two capability traits with real, mock, and GPIO-backed variants behind
//! tagged enums. A supervisor runs periodic health checks, reconnects failed
//! drivers, and performs atomic between-tick driver swaps so the control
//! loop always sees a single consistent driver per tick.

use std::time::{Duration, Instant};

use anyhow::Result;
use enum_dispatch::enum_dispatch;
use log::{info, warn};
use strum_macros::{Display, EnumIter, EnumString};

use crate::dmx::{DmxAddr, DmxBuffer, UniverseIdx};
use crate::error::CoreError;

pub mod gpio;
pub mod mock;
pub mod port;

pub use gpio::GpioIo;
pub use mock::{MockDmx, MockIo};
pub use port::PortDmx;

/// Analog inputs read volts in this range; normalized by dividing by 2.4.
pub const ANALOG_FULL_SCALE_VOLTS: f64 = 2.4;

/// Voltage above which a digital reading surfaced via the analog path is
/// HIGH.
pub const DIGITAL_HIGH_VOLTS: f64 = 1.5;

/// Budget for a single hardware read or write; anything slower counts
/// against the driver's health.
pub const IO_CALL_TIMEOUT: Duration = Duration::from_millis(50);

/// Configurable mode of an I/O channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum ChannelMode {
    Analog,
    DigitalIn,
    DigitalOut,
}

/// Switch inputs and PWM outputs.
#[enum_dispatch]
pub trait IoDevice {
    fn connect(&mut self) -> Result<bool>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn health_check(&mut self) -> Result<bool>;
    /// Volts in [0, 2.4].
    fn read_analog(&mut self, channel: u8) -> Result<f64>;
    fn read_digital(&mut self, channel: u8) -> Result<bool>;
    fn configure_channel(&mut self, channel: u8, mode: ChannelMode) -> Result<()>;
    fn set_pwm(&mut self, channel: u8, duty: f64) -> Result<()>;
    fn is_mock(&self) -> bool;
}

/// The I/O device variants the daemon can drive.
#[enum_dispatch(IoDevice)]
pub enum Io {
    Mock(MockIo),
    Gpio(GpioIo),
}

/// DMX512 output.
#[enum_dispatch]
pub trait DmxSink {
    fn connect(&mut self) -> Result<bool>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn health_check(&mut self) -> Result<bool>;
    fn set_channel(&mut self, universe: UniverseIdx, addr: DmxAddr, value: u8) -> Result<()>;
    fn set_channels(&mut self, universe: UniverseIdx, values: &[(DmxAddr, u8)]) -> Result<()>;
    fn set_universe(&mut self, universe: UniverseIdx, frame: &DmxBuffer) -> Result<()>;
}

/// The DMX sink variants the daemon can drive.
#[enum_dispatch(DmxSink)]
pub enum Dmx {
    Mock(MockDmx),
    Port(PortDmx),
}

/// Coordinates the drivers: initialization, health supervision with
/// reconnection, and atomic driver swaps between ticks.
pub struct HardwareManager {
    pub io: Io,
    pub dmx: Dmx,
    /// Channel modes to reinitialize after a driver swap or reconnect.
    channel_modes: Vec<(u8, ChannelMode)>,
    io_transient_failures: u64,
    dmx_transient_failures: u64,
    health_checks_passed: u64,
    health_checks_failed: u64,
}

impl HardwareManager {
    pub fn new(io: Io, dmx: Dmx) -> Self {
        Self {
            io,
            dmx,
            channel_modes: Vec::new(),
            io_transient_failures: 0,
            dmx_transient_failures: 0,
            health_checks_passed: 0,
            health_checks_failed: 0,
        }
    }

    /// Connect both drivers. Returns true if at least one came up; the
    /// daemon degrades to software-only operation otherwise and the health
    /// supervisor keeps retrying.
    pub fn initialize(&mut self) -> bool {
        let io_ok = match self.io.connect() {
            Ok(ok) => ok,
            Err(err) => {
                warn!("I/O device connection failed: {err:#}");
                false
            }
        };
        let dmx_ok = match self.dmx.connect() {
            Ok(ok) => ok,
            Err(err) => {
                warn!("DMX sink connection failed: {err:#}");
                false
            }
        };
        if !io_ok {
            warn!("I/O device unavailable, switch inputs disabled until reconnect");
        }
        if !dmx_ok {
            warn!("DMX sink unavailable, output disabled until reconnect");
        }
        io_ok || dmx_ok
    }

    /// Record the channel modes switches require, applying them now and
    /// after any future driver swap or reconnect.
    pub fn configure_channels(&mut self, modes: Vec<(u8, ChannelMode)>) {
        self.channel_modes = modes;
        self.apply_channel_modes();
    }

    fn apply_channel_modes(&mut self) {
        if !self.io.is_connected() {
            return;
        }
        for (channel, mode) in self.channel_modes.clone() {
            if let Err(err) = self.io.configure_channel(channel, mode) {
                warn!("configuring channel {channel} as {mode} failed: {err:#}");
            }
        }
    }

    /// One supervision pass: health-check both drivers and attempt to
    /// reconnect any that fail. Run from a periodic scheduler job.
    pub fn health_check(&mut self) {
        let io_ok = self.io.health_check().unwrap_or(false);
        if !io_ok {
            info!("I/O device unhealthy, attempting reconnect");
            if self.io.connect().unwrap_or(false) {
                info!("I/O device reconnected");
                self.apply_channel_modes();
            }
        }
        let dmx_ok = self.dmx.health_check().unwrap_or(false);
        if !dmx_ok {
            info!("DMX sink unhealthy, attempting reconnect");
            if self.dmx.connect().unwrap_or(false) {
                info!("DMX sink reconnected");
            }
        }
        if io_ok && dmx_ok {
            self.health_checks_passed += 1;
        } else {
            self.health_checks_failed += 1;
        }
    }

    /// Swap the I/O driver between ticks: stop the old driver, bring up the
    /// new one, and reinitialize channel modes. The tick loop never observes
    /// a half-swapped driver because this runs inside the tick executor.
    pub fn swap_io(&mut self, mut new_io: Io) {
        self.io.disconnect();
        if let Err(err) = new_io.connect() {
            warn!("replacement I/O device failed to connect: {err:#}");
        }
        self.io = new_io;
        self.apply_channel_modes();
        info!("I/O driver swapped");
    }

    /// Swap the DMX sink between ticks.
    pub fn swap_dmx(&mut self, mut new_dmx: Dmx) {
        self.dmx.disconnect();
        if let Err(err) = new_dmx.connect() {
            warn!("replacement DMX sink failed to connect: {err:#}");
        }
        self.dmx = new_dmx;
        info!("DMX driver swapped");
    }

    /// Read one digital input, timing the call against the hardware budget.
    /// Returns None (and counts a transient failure) on error.
    pub fn read_digital(&mut self, channel: u8) -> Option<bool> {
        if !self.io.is_connected() {
            return None;
        }
        let started = Instant::now();
        let result = self.io.read_digital(channel);
        self.observe_io_call(started);
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.io_transient_failures += 1;
                warn!(
                    "{}",
                    CoreError::HardwareTransient(format!(
                        "digital read of channel {channel}: {err:#}"
                    ))
                );
                None
            }
        }
    }

    /// Read one analog input in volts. Returns None on error.
    pub fn read_analog(&mut self, channel: u8) -> Option<f64> {
        if !self.io.is_connected() {
            return None;
        }
        let started = Instant::now();
        let result = self.io.read_analog(channel);
        self.observe_io_call(started);
        match result {
            Ok(volts) => Some(volts),
            Err(err) => {
                self.io_transient_failures += 1;
                warn!(
                    "{}",
                    CoreError::HardwareTransient(format!(
                        "analog read of channel {channel}: {err:#}"
                    ))
                );
                None
            }
        }
    }

    fn observe_io_call(&mut self, started: Instant) {
        if started.elapsed() > IO_CALL_TIMEOUT {
            self.io_transient_failures += 1;
            warn!("I/O call exceeded {IO_CALL_TIMEOUT:?} budget");
        }
    }

    /// Send a universe frame, counting failures for the supervisor.
    pub fn send_universe(&mut self, universe: UniverseIdx, frame: &DmxBuffer) -> bool {
        if !self.dmx.is_connected() {
            return false;
        }
        match self.dmx.set_universe(universe, frame) {
            Ok(()) => true,
            Err(err) => {
                self.dmx_transient_failures += 1;
                warn!("DMX send to universe {universe} failed: {err:#}");
                false
            }
        }
    }

    /// Shut down drivers in reverse initialization order.
    pub fn shutdown(&mut self) {
        self.dmx.disconnect();
        self.io.disconnect();
        info!("hardware shut down");
    }

    pub fn is_healthy(&self) -> bool {
        self.io.is_connected() && self.dmx.is_connected()
    }

    pub fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "io_connected": self.io.is_connected(),
            "dmx_connected": self.dmx.is_connected(),
            "io_transient_failures": self.io_transient_failures,
            "dmx_transient_failures": self.dmx_transient_failures,
            "health_checks_passed": self.health_checks_passed,
            "health_checks_failed": self.health_checks_failed,
        })
    }
}
