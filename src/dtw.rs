//! Dim-to-warm: automatic CCT reduction at lower brightness.
//!
//! Maps brightness onto a CCT between a configurable warm floor and cool
//! ceiling, mimicking incandescent thermal behavior. The effective range for
//! a fixture resolves fixture override, then group override, then the system
//! default. Settings are a cached snapshot refreshed by a periodic scheduler
//! job rather than read per tick.

use std::sync::Arc;

use arc_swap::ArcSwap;
use log::debug;
use ordermap::OrderMap;
use serde::Deserialize;
use strum_macros::{Display, EnumIter, EnumString};

use crate::config::FixtureId;

/// Interpolation curve for the brightness-to-CCT mapping.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DtwCurve {
    /// Even CCT change per brightness step.
    Linear,
    /// More CCT change at low brightness. The natural-feeling default.
    #[default]
    Log,
    /// Gentle warm-up, aggressive at the low end.
    Square,
    /// Models filament behavior: T scales with the fourth root of power.
    Incandescent,
}

impl DtwCurve {
    /// Normalized position on the curve for an already-clamped brightness.
    fn apply(self, brightness: f64) -> f64 {
        match self {
            Self::Linear => brightness,
            Self::Log => (1.0 + 9.0 * brightness).log10(),
            Self::Square => brightness * brightness,
            Self::Incandescent => brightness.powf(0.25),
        }
    }
}

/// System-wide dim-to-warm settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DtwSettings {
    pub enabled: bool,
    /// CCT at minimum brightness.
    pub min_cct: u32,
    /// CCT at maximum brightness.
    pub max_cct: u32,
    /// Brightness floor for the curve; below this, min_cct is emitted.
    pub min_brightness: f64,
    pub curve: DtwCurve,
    /// Lifetime of manual CCT overrides created by switch input.
    pub override_ttl_seconds: u64,
}

impl Default for DtwSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_cct: 1800,
            max_cct: 4000,
            min_brightness: 0.001,
            curve: DtwCurve::default(),
            override_ttl_seconds: 8 * 60 * 60,
        }
    }
}

/// CCT for a brightness level on a dim-to-warm curve.
///
/// Zero brightness pins to `min_cct`, full brightness to `max_cct`, and the
/// mapping is monotonic in between.
pub fn dtw_cct(
    brightness: f64,
    min_cct: u32,
    max_cct: u32,
    min_brightness: f64,
    curve: DtwCurve,
) -> u32 {
    if brightness <= 0.0 || min_cct >= max_cct {
        return min_cct;
    }
    if brightness >= 1.0 {
        return max_cct;
    }
    let effective = brightness.max(min_brightness).min(1.0);
    let t = curve.apply(effective);
    min_cct + ((max_cct - min_cct) as f64 * t).round() as u32
}

/// Per-fixture dim-to-warm configuration, resolved against the fixture's
/// direct group memberships at registration time.
#[derive(Clone, Debug, Default)]
pub struct FixtureDtwConfig {
    /// True if either the fixture or any of its groups opts out.
    pub ignore: bool,
    /// Range override, fixture-level beating group-level.
    pub min_cct_override: Option<u32>,
    pub max_cct_override: Option<u32>,
}

/// Real-time dim-to-warm calculation engine.
///
/// Holds a cached settings snapshot for fast synchronous use in the control
/// loop; `refresh` is invoked by the scheduler when settings may have
/// changed.
pub struct DtwEngine {
    settings: ArcSwap<DtwSettings>,
    fixtures: OrderMap<FixtureId, FixtureDtwConfig>,
    calculations: u64,
}

impl DtwEngine {
    pub fn new(settings: DtwSettings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings),
            fixtures: OrderMap::new(),
            calculations: 0,
        }
    }

    /// Swap in a fresh settings snapshot.
    pub fn refresh(&self, settings: DtwSettings) {
        debug!(
            "DTW settings refreshed: enabled={} range={}-{}K curve={}",
            settings.enabled, settings.min_cct, settings.max_cct, settings.curve
        );
        self.settings.store(Arc::new(settings));
    }

    pub fn settings(&self) -> Arc<DtwSettings> {
        self.settings.load_full()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.load().enabled
    }

    /// Register or update a fixture's resolved DTW configuration.
    pub fn register_fixture(&mut self, id: FixtureId, config: FixtureDtwConfig) {
        self.fixtures.insert(id, config);
    }

    pub fn unregister_fixture(&mut self, id: FixtureId) {
        self.fixtures.remove(&id);
    }

    /// True if this fixture participates in dim-to-warm at all.
    pub fn applies_to(&self, id: FixtureId) -> bool {
        self.is_enabled()
            && self
                .fixtures
                .get(&id)
                .map(|config| !config.ignore)
                .unwrap_or(true)
    }

    /// The DTW-computed CCT for a fixture at the given brightness, or None if
    /// DTW is disabled globally or ignored for this fixture.
    pub fn cct_for(&mut self, id: FixtureId, brightness: f64) -> Option<u32> {
        let settings = self.settings.load();
        if !settings.enabled {
            return None;
        }
        let config = self.fixtures.get(&id).cloned().unwrap_or_default();
        if config.ignore {
            return None;
        }
        self.calculations += 1;
        let min_cct = config.min_cct_override.unwrap_or(settings.min_cct);
        let max_cct = config.max_cct_override.unwrap_or(settings.max_cct);
        Some(dtw_cct(
            brightness,
            min_cct,
            max_cct,
            settings.min_brightness,
            settings.curve,
        ))
    }

    pub fn calculations(&self) -> u64 {
        self.calculations
    }
}
