//! Smooth transitions for brightness and CCT changes.
//!
//! Transition times are specified for the full range of change; the actual
//! duration of a transition is proportional to the fraction of the range it
//! traverses. Brightness and CCT transitions on the same fixture are fully
//! independent.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Easing applied to transition progress.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Easing {
    /// Constant speed from start to end.
    Linear,
    /// Starts slow, accelerates toward the end (quadratic).
    EaseIn,
    /// Starts fast, decelerates toward the end (quadratic).
    EaseOut,
    /// Slow start and end, fast middle (quadratic).
    #[default]
    EaseInOut,
    /// Cubic ease-in, more pronounced than quadratic.
    EaseInCubic,
    /// Cubic ease-out.
    EaseOutCubic,
    /// Cubic ease-in-out.
    EaseInOutCubic,
}

impl Easing {
    /// Map linear progress in [0, 1] to eased progress.
    ///
    /// Input is clamped. Every variant satisfies e(0) = 0 and e(1) = 1; the
    /// in-out variants additionally pass through (0.5, 0.5) and are
    /// point-symmetric around it.
    pub fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Linear => t,
            Self::EaseIn => t * t,
            Self::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            Self::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
            Self::EaseInCubic => t * t * t,
            Self::EaseOutCubic => 1.0 - (1.0 - t).powi(3),
            Self::EaseInOutCubic => {
                if t < 0.5 {
                    4.0 * t * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
                }
            }
        }
    }
}

/// Linear interpolation between two values.
pub fn lerp(start: f64, end: f64, t: f64) -> f64 {
    start + (end - start) * t
}

/// Global transition timing configuration.
///
/// `brightness_seconds` is the time to traverse the full 0-100% brightness
/// range; `cct_seconds` the time to traverse a fixture's full CCT range.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    pub brightness_seconds: f64,
    pub cct_seconds: f64,
    pub default_easing: Easing,
    /// Floor on computed durations.
    pub min_seconds: f64,
    /// Ceiling on computed durations.
    pub max_seconds: f64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            brightness_seconds: 0.5,
            cct_seconds: 0.5,
            default_easing: Easing::default(),
            min_seconds: 0.0,
            max_seconds: 60.0,
        }
    }
}

impl TransitionConfig {
    /// Proportional duration for a brightness change.
    pub fn brightness_duration(&self, start: f64, end: f64) -> Duration {
        let change = (end - start).abs();
        self.bounded(self.brightness_seconds * change)
    }

    /// Proportional duration for a CCT change within the fixture's range.
    pub fn cct_duration(&self, start: u32, end: u32, cct_min: u32, cct_max: u32) -> Duration {
        let range = cct_max.saturating_sub(cct_min);
        if range == 0 {
            return Duration::ZERO;
        }
        let fraction = (end.abs_diff(start)) as f64 / range as f64;
        self.bounded(self.cct_seconds * fraction)
    }

    fn bounded(&self, seconds: f64) -> Duration {
        Duration::from_secs_f64(seconds.clamp(self.min_seconds, self.max_seconds))
    }
}

/// An in-flight interpolation from one value to another.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub start_value: f64,
    pub end_value: f64,
    pub start_time: Instant,
    pub duration: Duration,
    pub easing: Easing,
}

impl Transition {
    pub fn new(
        start_value: f64,
        end_value: f64,
        start_time: Instant,
        duration: Duration,
        easing: Easing,
    ) -> Self {
        Self {
            start_value,
            end_value,
            start_time,
            duration,
            easing,
        }
    }

    /// The interpolated value at `now`, and whether the transition has
    /// completed.
    pub fn value_at(&self, now: Instant) -> (f64, bool) {
        if self.duration.is_zero() {
            return (self.end_value, true);
        }
        let elapsed = now.saturating_duration_since(self.start_time);
        let progress = (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0);
        let value = lerp(self.start_value, self.end_value, self.easing.apply(progress));
        (value, progress >= 1.0)
    }
}
