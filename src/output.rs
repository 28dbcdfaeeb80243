//! DMX output stage.
//!
//! Composes per-universe 512-byte frames from resolved fixture state, picks
//! the best available color-mixing path per fixture, deduplicates unchanged
//! frames against a TTL, and hands frames to the DMX sink.

use std::time::{Duration, Instant};

use log::warn;

use crate::color::{self, MixParams};
use crate::config::{FixtureConfig, FixtureKind};
use crate::dmx::{DmxBuffer, UNIVERSE_COUNT};
use crate::hardware::HardwareManager;
use crate::resolver::Resolved;

/// 8-bit DMX duty resolution.
const PWM_RESOLUTION: u16 = 255;

pub struct OutputStage {
    frames: [DmxBuffer; UNIVERSE_COUNT],
    /// Universes that at least one fixture renders into.
    active: [bool; UNIVERSE_COUNT],
    last_sent: [Option<(DmxBuffer, Instant)>; UNIVERSE_COUNT],
    dedupe_enabled: bool,
    dedupe_ttl: Duration,
    sends: u64,
    skips: u64,
}

impl OutputStage {
    pub fn new(dedupe_enabled: bool, dedupe_ttl: Duration) -> Self {
        Self {
            frames: [[0; 512]; UNIVERSE_COUNT],
            active: [false; UNIVERSE_COUNT],
            last_sent: [None; UNIVERSE_COUNT],
            dedupe_enabled,
            dedupe_ttl,
            sends: 0,
            skips: 0,
        }
    }

    /// Hot-reload hook for the dedupe settings.
    pub fn set_dedupe(&mut self, enabled: bool, ttl: Duration) {
        self.dedupe_enabled = enabled;
        self.dedupe_ttl = ttl;
    }

    /// Forget staged frames and send history, e.g. after a config reload
    /// reassigns channels.
    pub fn reset(&mut self) {
        self.frames = [[0; 512]; UNIVERSE_COUNT];
        self.active = [false; UNIVERSE_COUNT];
        self.last_sent = [None; UNIVERSE_COUNT];
    }

    /// Render one fixture's resolved state into its universe frame.
    pub fn stage_fixture(&mut self, config: &FixtureConfig, resolved: &Resolved) {
        let universe = config.universe;
        if universe >= UNIVERSE_COUNT {
            warn!("fixture {} universe {universe} out of range", config.id);
            return;
        }
        self.active[universe] = true;
        let frame = &mut self.frames[universe];

        match (resolved.cct, config.cool_dmx_index()) {
            (Some(cct), Some(cool_index)) => {
                let (warm, cool) = mix_duties(config, cct, resolved);
                frame[config.channel.dmx_index()] = warm;
                frame[cool_index] = cool;
            }
            _ => {
                let value = match config.kind {
                    // Relay-backed circuits snap to full on any nonzero level.
                    FixtureKind::NonDimmable => {
                        if resolved.brightness.val() > 0.0 {
                            255
                        } else {
                            0
                        }
                    }
                    _ => (resolved.brightness.val() * 255.0).round() as u8,
                };
                frame[config.channel.dmx_index()] = value;
            }
        }
    }

    /// Send staged frames, skipping universes whose frame matches the last
    /// one sent inside the dedupe TTL. Any changed byte sends immediately.
    /// Returns the number of frames actually sent.
    pub fn flush(&mut self, hw: &mut HardwareManager, now: Instant) -> usize {
        let mut sent = 0;
        for universe in 0..UNIVERSE_COUNT {
            if !self.active[universe] {
                continue;
            }
            let frame = self.frames[universe];
            if self.dedupe_enabled {
                if let Some((last_frame, last_at)) = &self.last_sent[universe] {
                    if *last_frame == frame && now.duration_since(*last_at) < self.dedupe_ttl {
                        self.skips += 1;
                        continue;
                    }
                }
            }
            if hw.send_universe(universe, &frame) {
                self.last_sent[universe] = Some((frame, now));
                self.sends += 1;
                sent += 1;
            }
        }
        sent
    }

    pub fn sends(&self) -> u64 {
        self.sends
    }

    pub fn skips(&self) -> u64 {
        self.skips
    }
}

/// Pick the best mixing path the fixture's calibration data allows.
///
/// Full chromaticity plus lumens runs the Planckian locus algorithm;
/// lumens alone derives chromaticity from the rated CCTs; otherwise plain
/// linear mixing with gamma.
fn mix_duties(config: &FixtureConfig, cct: u32, resolved: &Resolved) -> (u8, u8) {
    let full_calibration = match (
        config.warm_xy,
        config.cool_xy,
        config.warm_lumens,
        config.cool_lumens,
    ) {
        (Some(warm_xy), Some(cool_xy), Some(warm_lumens), Some(cool_lumens)) => {
            Some(MixParams {
                warm_cct: config.cct_min_k,
                cool_cct: config.cct_max_k,
                warm_xy,
                cool_xy,
                warm_lumens,
                cool_lumens,
                pwm_resolution: PWM_RESOLUTION,
                min_duty: 0,
                gamma: config.gamma,
            })
        }
        _ => None,
    };

    if let Some(params) = full_calibration {
        match color::mix(cct, resolved.brightness, &params) {
            Ok(result) => return (result.warm_duty as u8, result.cool_duty as u8),
            Err(err) => warn!("color mix failed for fixture {}: {err:#}", config.id),
        }
    } else if let (Some(warm_lumens), Some(cool_lumens)) =
        (config.warm_lumens, config.cool_lumens)
    {
        match color::mix_lumens_only(
            cct,
            resolved.brightness,
            config.cct_min_k,
            config.cct_max_k,
            warm_lumens,
            cool_lumens,
            PWM_RESOLUTION,
            0,
            config.gamma,
        ) {
            Ok(result) => return (result.mix.warm_duty as u8, result.mix.cool_duty as u8),
            Err(err) => warn!("color mix failed for fixture {}: {err:#}", config.id),
        }
    }

    let (warm, cool) = color::mix_simple(
        cct,
        resolved.brightness,
        config.cct_min_k,
        config.cct_max_k,
        PWM_RESOLUTION,
        config.gamma,
    );
    (warm as u8, cool as u8)
}
