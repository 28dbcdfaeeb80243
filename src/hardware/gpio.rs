//! Raspberry Pi GPIO-backed I/O device using the sysfs interface.
//!
//! Digital inputs map abstract channels to BCM pins; PWM outputs go through
//! the sysfs PWM chip. GPIO has no ADC, so analog reads are unsupported and
//! rotary switches need a different device.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{debug, warn};

use super::{ChannelMode, IoDevice};

const GPIO_ROOT: &str = "/sys/class/gpio";
const PWM_ROOT: &str = "/sys/class/pwm/pwmchip0";

/// PWM period in nanoseconds (1 kHz carrier).
const PWM_PERIOD_NS: u64 = 1_000_000;

/// Parse a pin mapping of the form `"channel:pin,channel:pin"`, e.g.
/// `"0:17,1:27,2:22"`. Invalid pairs are skipped with a warning.
pub fn parse_pin_mapping(mapping: &str) -> HashMap<u8, u32> {
    let mut result = HashMap::new();
    for pair in mapping.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let parsed = pair
            .split_once(':')
            .and_then(|(channel, pin)| {
                Some((channel.trim().parse().ok()?, pin.trim().parse().ok()?))
            });
        match parsed {
            Some((channel, pin)) => {
                result.insert(channel, pin);
            }
            None => warn!("invalid pin mapping entry '{pair}'"),
        }
    }
    result
}

pub struct GpioIo {
    /// Abstract input channel to BCM pin.
    input_pins: HashMap<u8, u32>,
    /// Abstract PWM channel to sysfs PWM index.
    pwm_pins: HashMap<u8, u32>,
    gpio_root: PathBuf,
    pwm_root: PathBuf,
    connected: bool,
}

impl GpioIo {
    pub fn new(input_pins: HashMap<u8, u32>, pwm_pins: HashMap<u8, u32>) -> Self {
        Self {
            input_pins,
            pwm_pins,
            gpio_root: PathBuf::from(GPIO_ROOT),
            pwm_root: PathBuf::from(PWM_ROOT),
            connected: false,
        }
    }

    fn pin_for(&self, channel: u8) -> Result<u32> {
        self.input_pins
            .get(&channel)
            .copied()
            .with_context(|| format!("no GPIO pin mapped for channel {channel}"))
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.gpio_root.join(format!("gpio{pin}"))
    }

    fn export_pin(&self, pin: u32, direction: &str) -> Result<()> {
        let pin_dir = self.pin_dir(pin);
        if !pin_dir.exists() {
            // Export failures for already-exported pins are benign.
            let _ = std::fs::write(self.gpio_root.join("export"), pin.to_string());
        }
        std::fs::write(pin_dir.join("direction"), direction)
            .with_context(|| format!("setting direction of GPIO {pin}"))?;
        Ok(())
    }

    fn export_pwm(&self, index: u32) -> Result<PathBuf> {
        let pwm_dir = self.pwm_root.join(format!("pwm{index}"));
        if !pwm_dir.exists() {
            let _ = std::fs::write(self.pwm_root.join("export"), index.to_string());
        }
        if !pwm_dir.exists() {
            bail!("PWM channel {index} did not appear after export");
        }
        Ok(pwm_dir)
    }
}

impl IoDevice for GpioIo {
    fn connect(&mut self) -> Result<bool> {
        if !Path::new(&self.gpio_root).exists() {
            warn!("GPIO sysfs root {} not present", self.gpio_root.display());
            return Ok(false);
        }
        for pin in self.input_pins.values() {
            self.export_pin(*pin, "in")?;
        }
        for index in self.pwm_pins.values() {
            let pwm_dir = self.export_pwm(*index)?;
            std::fs::write(pwm_dir.join("period"), PWM_PERIOD_NS.to_string())
                .context("setting PWM period")?;
            std::fs::write(pwm_dir.join("enable"), "1").context("enabling PWM")?;
        }
        self.connected = true;
        debug!(
            "GPIO driver up: {} input(s), {} PWM output(s)",
            self.input_pins.len(),
            self.pwm_pins.len()
        );
        Ok(true)
    }

    fn disconnect(&mut self) {
        for index in self.pwm_pins.values() {
            let pwm_dir = self.pwm_root.join(format!("pwm{index}"));
            let _ = std::fs::write(pwm_dir.join("enable"), "0");
        }
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn health_check(&mut self) -> Result<bool> {
        if !self.connected {
            return Ok(false);
        }
        // The exported pin directories vanishing means the driver was torn
        // down underneath us.
        Ok(self
            .input_pins
            .values()
            .all(|pin| self.pin_dir(*pin).exists()))
    }

    fn read_analog(&mut self, _channel: u8) -> Result<f64> {
        bail!("GPIO has no analog inputs");
    }

    fn read_digital(&mut self, channel: u8) -> Result<bool> {
        let pin = self.pin_for(channel)?;
        let raw = std::fs::read_to_string(self.pin_dir(pin).join("value"))
            .with_context(|| format!("reading GPIO {pin}"))?;
        Ok(raw.trim() == "1")
    }

    fn configure_channel(&mut self, channel: u8, mode: ChannelMode) -> Result<()> {
        match mode {
            ChannelMode::DigitalIn => self.export_pin(self.pin_for(channel)?, "in"),
            ChannelMode::DigitalOut => self.export_pin(self.pin_for(channel)?, "out"),
            ChannelMode::Analog => bail!("GPIO cannot provide analog channel {channel}"),
        }
    }

    fn set_pwm(&mut self, channel: u8, duty: f64) -> Result<()> {
        let index = self
            .pwm_pins
            .get(&channel)
            .copied()
            .with_context(|| format!("no PWM output mapped for channel {channel}"))?;
        let duty_ns = (PWM_PERIOD_NS as f64 * duty.clamp(0.0, 1.0)) as u64;
        std::fs::write(
            self.pwm_root.join(format!("pwm{index}")).join("duty_cycle"),
            duty_ns.to_string(),
        )
        .with_context(|| format!("setting PWM duty on channel {channel}"))?;
        Ok(())
    }

    fn is_mock(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_pin_mapping() {
        let mapping = parse_pin_mapping("0:17,1:27,2:22");
        assert_eq!(3, mapping.len());
        assert_eq!(Some(&17), mapping.get(&0));
        assert_eq!(Some(&22), mapping.get(&2));
    }

    #[test]
    fn test_parse_pin_mapping_skips_garbage() {
        let mapping = parse_pin_mapping("0:17, bogus ,1:x,:3,2:22,");
        assert_eq!(2, mapping.len());
        assert_eq!(Some(&17), mapping.get(&0));
        assert_eq!(Some(&22), mapping.get(&2));
    }

    #[test]
    fn test_connect_without_sysfs_degrades() {
        let mut io = GpioIo::new(parse_pin_mapping("0:17"), HashMap::new());
        io.gpio_root = PathBuf::from("/nonexistent/gpio");
        assert!(!io.connect().unwrap());
        assert!(!io.is_connected());
    }

    #[test]
    fn test_analog_unsupported() {
        let mut io = GpioIo::new(HashMap::new(), HashMap::new());
        assert!(io.read_analog(0).is_err());
        assert!(io.configure_channel(0, ChannelMode::Analog).is_err());
    }
}
