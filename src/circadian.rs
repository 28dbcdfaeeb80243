//! Circadian keyframe curves.
//!
//! A profile is an ordered ring of (time of day, brightness, CCT) keyframes;
//! evaluation interpolates linearly between the surrounding pair, wrapping
//! across midnight. Enabled groups receive the evaluated values each tick and
//! the resolver pulls them during composition.

use anyhow::{Result, ensure};
use chrono::NaiveTime;
use log::warn;
use ordermap::OrderMap;

use crate::config::{CircadianProfileConfig, GroupId, ProfileId};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Clone, Copy, Debug)]
pub struct Keyframe {
    pub time: NaiveTime,
    pub brightness: f64,
    pub cct: u32,
}

/// A validated circadian profile ready for evaluation.
#[derive(Clone, Debug)]
pub struct CircadianProfile {
    pub id: ProfileId,
    /// Sorted by time of day; at least two entries with unique times.
    keyframes: Vec<Keyframe>,
}

impl CircadianProfile {
    pub fn from_config(config: &CircadianProfileConfig) -> Result<Self> {
        ensure!(
            config.keyframes.len() >= 2,
            "circadian profile {} needs at least 2 keyframes, has {}",
            config.id,
            config.keyframes.len()
        );
        let mut keyframes: Vec<Keyframe> = config
            .keyframes
            .iter()
            .map(|kf| Keyframe {
                time: kf.time,
                brightness: kf.brightness.clamp(0.0, 1.0),
                cct: kf.cct_k,
            })
            .collect();
        keyframes.sort_by_key(|kf| kf.time);
        ensure!(
            keyframes.windows(2).all(|w| w[0].time != w[1].time),
            "circadian profile {} has duplicate keyframe times",
            config.id
        );
        Ok(Self {
            id: config.id,
            keyframes,
        })
    }

    /// Evaluate the profile at a time of day.
    ///
    /// Between the last and first keyframe the interpolation wraps across
    /// midnight.
    pub fn evaluate(&self, at: NaiveTime) -> (f64, u32) {
        let seconds = seconds_of_day(at);
        let n = self.keyframes.len();

        // Find the keyframe pair straddling `at`. The ring wraps: before the
        // first keyframe we interpolate from the last one, across midnight.
        let next_index = self
            .keyframes
            .iter()
            .position(|kf| seconds_of_day(kf.time) > seconds)
            .unwrap_or(0);
        let prev_index = (next_index + n - 1) % n;
        let prev = &self.keyframes[prev_index];
        let next = &self.keyframes[next_index];

        let prev_s = seconds_of_day(prev.time);
        let next_s = seconds_of_day(next.time);
        let span = wrap_forward(next_s - prev_s);
        let offset = wrap_forward(seconds - prev_s);
        let t = if span > 0.0 { offset / span } else { 0.0 };

        let brightness = prev.brightness + (next.brightness - prev.brightness) * t;
        let cct = prev.cct as f64 + (next.cct as f64 - prev.cct as f64) * t;
        (brightness.clamp(0.0, 1.0), cct.round() as u32)
    }
}

fn seconds_of_day(time: NaiveTime) -> f64 {
    use chrono::Timelike;
    time.num_seconds_from_midnight() as f64 + time.nanosecond() as f64 * 1e-9
}

fn wrap_forward(seconds: f64) -> f64 {
    if seconds < 0.0 {
        seconds + SECONDS_PER_DAY
    } else {
        seconds
    }
}

/// Evaluates circadian profiles for their assigned groups.
pub struct CircadianEngine {
    profiles: OrderMap<ProfileId, CircadianProfile>,
    /// Which profile each group follows.
    assignments: OrderMap<GroupId, ProfileId>,
}

impl CircadianEngine {
    pub fn new() -> Self {
        Self {
            profiles: OrderMap::new(),
            assignments: OrderMap::new(),
        }
    }

    pub fn load_profile(&mut self, config: &CircadianProfileConfig) -> Result<()> {
        let profile = CircadianProfile::from_config(config)?;
        self.profiles.insert(profile.id, profile);
        Ok(())
    }

    pub fn assign_group(&mut self, group: GroupId, profile: ProfileId) {
        if !self.profiles.contains_key(&profile) {
            warn!("group {group} assigned unknown circadian profile {profile}");
        }
        self.assignments.insert(group, profile);
    }

    pub fn clear(&mut self) {
        self.profiles.clear();
        self.assignments.clear();
    }

    /// The circadian (brightness multiplier, CCT) for a group at a time of
    /// day, if the group follows a loaded profile.
    pub fn evaluate_group(&self, group: GroupId, at: NaiveTime) -> Option<(f64, u32)> {
        let profile_id = self.assignments.get(&group)?;
        let profile = self.profiles.get(profile_id)?;
        Some(profile.evaluate(at))
    }

    /// Iterate over all groups with assigned profiles.
    pub fn assigned_groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.assignments.keys().copied()
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }
}
