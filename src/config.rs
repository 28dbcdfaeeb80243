//! Configuration snapshots.
//!
//! The config source hands the core immutable snapshots of fixtures, groups,
//! scenes, circadian profiles, switches, and system settings. Snapshots are
//! validated as a whole; a snapshot that fails validation at startup is
//! fatal, while a failed reload keeps the previous snapshot.

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use chrono::NaiveTime;
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString};

use crate::dmx::{DmxAddr, UniverseIdx, validate_universe};
use crate::dtw::DtwSettings;
use crate::error::CoreError;
use crate::transitions::TransitionConfig;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Copy,
            Clone,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub u32);

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}

id_type!(FixtureId);
id_type!(GroupId);
id_type!(SceneId);
id_type!(ProfileId);
id_type!(SwitchId);

/// What kind of light a fixture is.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FixtureKind {
    SimpleDimmable,
    #[default]
    TunableWhite,
    DimToWarm,
    NonDimmable,
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FixtureConfig {
    pub id: FixtureId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub universe: UniverseIdx,
    /// Primary DMX channel (warm channel for tunable white fixtures).
    pub channel: DmxAddr,
    /// Cool channel, when not adjacent to the primary.
    #[serde(default)]
    pub secondary_channel: Option<DmxAddr>,
    #[serde(default = "one")]
    pub footprint: usize,
    #[serde(default)]
    pub kind: FixtureKind,
    #[serde(default = "default_cct_min")]
    pub cct_min_k: u32,
    #[serde(default = "default_cct_max")]
    pub cct_max_k: u32,
    /// Measured CIE 1931 chromaticity of the warm emitter.
    #[serde(default)]
    pub warm_xy: Option<(f64, f64)>,
    #[serde(default)]
    pub cool_xy: Option<(f64, f64)>,
    /// Luminous flux of each channel at 100%.
    #[serde(default)]
    pub warm_lumens: Option<f64>,
    #[serde(default)]
    pub cool_lumens: Option<f64>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default)]
    pub dtw_ignore: bool,
    #[serde(default)]
    pub dtw_cct_min_override: Option<u32>,
    #[serde(default)]
    pub dtw_cct_max_override: Option<u32>,
    #[serde(default)]
    pub default_cct_k: Option<u32>,
}

impl FixtureConfig {
    /// A fixture with a two-channel footprint or an explicit secondary
    /// channel drives independent warm and cool emitters.
    pub fn supports_cct(&self) -> bool {
        self.footprint >= 2 || self.secondary_channel.is_some()
    }

    /// Buffer index of the cool channel, when CCT-capable.
    pub fn cool_dmx_index(&self) -> Option<usize> {
        if !self.supports_cct() {
            return None;
        }
        Some(
            self.secondary_channel
                .map(|addr| addr.dmx_index())
                .unwrap_or(self.channel.dmx_index() + 1),
        )
    }

    fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        if let Some(secondary) = self.secondary_channel {
            secondary.validate()?;
        }
        validate_universe(self.universe)?;
        ensure!(
            (1..=2).contains(&self.footprint),
            "footprint {} out of range",
            self.footprint
        );
        ensure!(
            self.cct_min_k < self.cct_max_k,
            "CCT range {}-{}K is inverted or empty",
            self.cct_min_k,
            self.cct_max_k
        );
        ensure!(self.gamma > 0.0, "gamma must be positive");
        if self.footprint == 2 && self.secondary_channel.is_none() {
            ensure!(
                self.channel.fits(2),
                "two-channel fixture at channel {} overruns the universe",
                self.channel
            );
        }
        Ok(())
    }
}

const fn one() -> usize {
    1
}
const fn default_cct_min() -> u32 {
    2700
}
const fn default_cct_max() -> u32 {
    6500
}
const fn default_gamma() -> f64 {
    2.2
}

/// A nightly window during which a group resists being driven bright.
///
/// Carried through from the config surface; enforcement belongs to the
/// scheduling collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SleepLock {
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: GroupId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub circadian_profile_id: Option<ProfileId>,
    #[serde(default = "full_brightness")]
    pub default_brightness: f64,
    #[serde(default)]
    pub default_cct_k: Option<u32>,
    #[serde(default)]
    pub dtw_ignore: bool,
    #[serde(default)]
    pub dtw_cct_min_override: Option<u32>,
    #[serde(default)]
    pub dtw_cct_max_override: Option<u32>,
    #[serde(default)]
    pub sleep_lock: Option<SleepLock>,
    /// Member fixtures, in priority order.
    #[serde(default)]
    pub fixtures: Vec<FixtureId>,
}

const fn full_brightness() -> f64 {
    1.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneValue {
    pub fixture_id: FixtureId,
    /// Target brightness on the 0-1000 config scale.
    #[serde(default)]
    pub brightness: Option<u16>,
    #[serde(default)]
    pub cct_k: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneConfig {
    pub id: SceneId,
    #[serde(default)]
    pub name: Option<String>,
    /// When set, recall only applies to values targeting members of this
    /// group.
    #[serde(default)]
    pub scope_group_id: Option<GroupId>,
    #[serde(default)]
    pub values: Vec<SceneValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyframeConfig {
    pub time: NaiveTime,
    pub brightness: f64,
    pub cct_k: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircadianProfileConfig {
    pub id: ProfileId,
    #[serde(default)]
    pub name: Option<String>,
    pub keyframes: Vec<KeyframeConfig>,
}

/// Physical input models the switch handler understands.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumIter, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SwitchModel {
    /// Maintained on/off contact.
    SwitchSimple,
    /// Momentary pushbutton with tap-toggle and dim-on-hold.
    Retractive,
    /// Absolute-position potentiometer read on an analog pin.
    RotaryAbs,
    /// Multi-button paddle. Configuration slot only; behavior is a stub.
    PaddleComposite,
}

impl SwitchModel {
    pub fn requires_digital_pin(&self) -> bool {
        matches!(
            self,
            Self::SwitchSimple | Self::Retractive | Self::PaddleComposite
        )
    }

    pub fn requires_analog_pin(&self) -> bool {
        matches!(self, Self::RotaryAbs)
    }
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DimmingCurve {
    #[default]
    Linear,
    Logarithmic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub id: SwitchId,
    #[serde(default)]
    pub name: Option<String>,
    pub model: SwitchModel,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub dimming_curve: DimmingCurve,
    #[serde(default)]
    pub digital_channel: Option<u8>,
    #[serde(default)]
    pub analog_channel: Option<u8>,
    #[serde(default)]
    pub target_fixture_id: Option<FixtureId>,
    #[serde(default)]
    pub target_group_id: Option<GroupId>,
    #[serde(default)]
    pub double_tap_scene_id: Option<SceneId>,
    #[serde(default)]
    pub invert_reading: bool,
}

const fn default_debounce_ms() -> u64 {
    50
}

/// What a switch drives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SwitchTarget {
    Fixture(FixtureId),
    Group(GroupId),
}

impl SwitchConfig {
    pub fn target(&self) -> Result<SwitchTarget> {
        match (self.target_fixture_id, self.target_group_id) {
            (Some(fixture), None) => Ok(SwitchTarget::Fixture(fixture)),
            (None, Some(group)) => Ok(SwitchTarget::Group(group)),
            (None, None) => bail!("switch {} has no target", self.id),
            (Some(_), Some(_)) => bail!("switch {} targets both a fixture and a group", self.id),
        }
    }

    fn validate(&self) -> Result<()> {
        self.target()?;
        if self.model.requires_digital_pin() {
            ensure!(
                self.digital_channel.is_some(),
                "switch {} model {} needs a digital channel",
                self.id,
                self.model
            );
        }
        if self.model.requires_analog_pin() {
            ensure!(
                self.analog_channel.is_some(),
                "switch {} model {} needs an analog channel",
                self.id,
                self.model
            );
        }
        Ok(())
    }
}

/// Runtime-mutable system settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    /// Time for a held retractive switch to sweep the full brightness range.
    pub dim_speed_ms: u64,
    /// Hold time before a retractive press starts dimming.
    pub hold_threshold_ms: u64,
    /// Window for a second tap to count as a double tap. Clamped to 200-900.
    pub tap_window_ms: u64,
    /// Floor between broadcasts with the same (kind, target) key.
    pub broadcast_throttle_ms: u64,
    pub dmx_dedupe_enabled: bool,
    pub dmx_dedupe_ttl_ms: u64,
    pub transitions: TransitionConfig,
    pub dtw: DtwSettings,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            dim_speed_ms: 2000,
            hold_threshold_ms: 1000,
            tap_window_ms: 500,
            broadcast_throttle_ms: 100,
            dmx_dedupe_enabled: true,
            dmx_dedupe_ttl_ms: 250,
            transitions: TransitionConfig::default(),
            dtw: DtwSettings::default(),
        }
    }
}

impl SystemSettings {
    pub fn effective_tap_window_ms(&self) -> u64 {
        self.tap_window_ms.clamp(200, 900)
    }
}

/// A complete immutable configuration snapshot.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub fixtures: Vec<Arc<FixtureConfig>>,
    pub groups: Vec<Arc<GroupConfig>>,
    pub scenes: Vec<Arc<SceneConfig>>,
    pub circadian_profiles: Vec<CircadianProfileConfig>,
    pub switches: Vec<Arc<SwitchConfig>>,
    pub settings: SystemSettings,
}

impl Snapshot {
    /// Load and validate a snapshot from a YAML file.
    pub fn from_file(path: &Path) -> Result<Arc<Self>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening config file {}", path.display()))?;
        let snapshot: Snapshot = serde_yaml::from_reader(file)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        snapshot
            .validate()
            .map_err(|err| CoreError::Config(format!("{err:#}")))?;
        info!(
            "Loaded config: {} fixture(s), {} group(s), {} scene(s), {} switch(es).",
            snapshot.fixtures.len(),
            snapshot.groups.len(),
            snapshot.scenes.len(),
            snapshot.switches.len(),
        );
        Ok(Arc::new(snapshot))
    }

    pub fn validate(&self) -> Result<()> {
        let mut fixture_ids = std::collections::HashSet::new();
        for fixture in &self.fixtures {
            fixture
                .validate()
                .with_context(|| format!("fixture {}", fixture.id))?;
            ensure!(
                fixture_ids.insert(fixture.id),
                "duplicate fixture id {}",
                fixture.id
            );
        }

        let mut group_ids = std::collections::HashSet::new();
        for group in &self.groups {
            ensure!(group_ids.insert(group.id), "duplicate group id {}", group.id);
            ensure!(
                (0.0..=1.0).contains(&group.default_brightness),
                "group {} default brightness {} out of range",
                group.id,
                group.default_brightness
            );
            for member in &group.fixtures {
                ensure!(
                    fixture_ids.contains(member),
                    "group {} references unknown fixture {member}",
                    group.id
                );
            }
        }

        let mut profile_ids = std::collections::HashSet::new();
        for profile in &self.circadian_profiles {
            ensure!(
                profile_ids.insert(profile.id),
                "duplicate circadian profile id {}",
                profile.id
            );
            // Structural checks live with the evaluation engine.
            crate::circadian::CircadianProfile::from_config(profile)?;
        }
        for group in &self.groups {
            if let Some(profile) = group.circadian_profile_id {
                ensure!(
                    profile_ids.contains(&profile),
                    "group {} references unknown circadian profile {profile}",
                    group.id
                );
            }
        }

        let mut scene_ids = std::collections::HashSet::new();
        for scene in &self.scenes {
            ensure!(scene_ids.insert(scene.id), "duplicate scene id {}", scene.id);
            if let Some(repeated) = scene
                .values
                .iter()
                .map(|value| value.fixture_id)
                .duplicates()
                .next()
            {
                bail!(
                    "scene {} lists fixture {repeated} more than once",
                    scene.id
                );
            }
            for value in &scene.values {
                ensure!(
                    fixture_ids.contains(&value.fixture_id),
                    "scene {} references unknown fixture {}",
                    scene.id,
                    value.fixture_id
                );
                if let Some(brightness) = value.brightness {
                    ensure!(
                        brightness <= 1000,
                        "scene {} brightness {brightness} exceeds the 0-1000 scale",
                        scene.id
                    );
                }
            }
        }

        let mut switch_ids = std::collections::HashSet::new();
        for switch in &self.switches {
            switch
                .validate()
                .with_context(|| format!("switch {}", switch.id))?;
            ensure!(
                switch_ids.insert(switch.id),
                "duplicate switch id {}",
                switch.id
            );
            match switch.target()? {
                SwitchTarget::Fixture(id) => ensure!(
                    fixture_ids.contains(&id),
                    "switch {} targets unknown fixture {id}",
                    switch.id
                ),
                SwitchTarget::Group(id) => ensure!(
                    group_ids.contains(&id),
                    "switch {} targets unknown group {id}",
                    switch.id
                ),
            }
            if let Some(scene) = switch.double_tap_scene_id {
                ensure!(
                    scene_ids.contains(&scene),
                    "switch {} double-tap references unknown scene {scene}",
                    switch.id
                );
            }
        }

        Ok(())
    }

    pub fn fixture(&self, id: FixtureId) -> Option<&Arc<FixtureConfig>> {
        self.fixtures.iter().find(|fixture| fixture.id == id)
    }

    pub fn group(&self, id: GroupId) -> Option<&Arc<GroupConfig>> {
        self.groups.iter().find(|group| group.id == id)
    }

    pub fn scene(&self, id: SceneId) -> Option<&Arc<SceneConfig>> {
        self.scenes.iter().find(|scene| scene.id == id)
    }
}

/// Writes the core originates back to the config source: captured scenes,
/// override lifecycle, and the runtime-mutable settings.
pub trait ConfigSink: Send {
    fn write_scene(&mut self, scene: &SceneConfig) -> Result<()>;
}

/// A sink that just logs, for running without a config collaborator.
pub struct LoggingConfigSink;

impl ConfigSink for LoggingConfigSink {
    fn write_scene(&mut self, scene: &SceneConfig) -> Result<()> {
        info!(
            "Captured scene {} with {} value(s).",
            scene.id,
            scene.values.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(yaml: &str) -> Result<Snapshot> {
        let snapshot: Snapshot = serde_yaml::from_str(yaml)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn assert_fail(yaml: &str, snippet: &str) {
        let Err(err) = parse(yaml) else {
            panic!("config didn't fail");
        };
        assert!(
            format!("{err:#}").contains(snippet),
            "error message didn't contain '{snippet}':\n{err:#}"
        );
    }

    const OK_CONFIG: &str = "
fixtures:
  - id: 1
    universe: 0
    channel: 1
    footprint: 2
    kind: tunable_white
    cct_min_k: 2700
    cct_max_k: 6500
    warm_lumens: 800
    cool_lumens: 800
  - id: 2
    channel: 10
    kind: simple_dimmable
groups:
  - id: 1
    circadian_profile_id: 1
    default_brightness: 0.8
    default_cct_k: 3000
    fixtures: [1]
scenes:
  - id: 1
    values:
      - fixture_id: 1
        brightness: 500
        cct_k: 3500
circadian_profiles:
  - id: 1
    keyframes:
      - { time: '06:00:00', brightness: 0.2, cct_k: 2700 }
      - { time: '12:00:00', brightness: 1.0, cct_k: 5000 }
switches:
  - id: 1
    model: retractive
    debounce_ms: 50
    digital_channel: 3
    target_fixture_id: 1
    double_tap_scene_id: 1
settings:
  dim_speed_ms: 2000
  dtw:
    enabled: true
    curve: log
";

    #[test]
    fn test_ok() {
        let snapshot = parse(OK_CONFIG).unwrap();
        assert_eq!(2, snapshot.fixtures.len());
        let fixture = snapshot.fixture(FixtureId(1)).unwrap();
        assert!(fixture.supports_cct());
        assert_eq!(Some(1), fixture.cool_dmx_index());
        let simple = snapshot.fixture(FixtureId(2)).unwrap();
        assert!(!simple.supports_cct());
        assert_eq!(None, simple.cool_dmx_index());
        assert_eq!(
            SwitchTarget::Fixture(FixtureId(1)),
            snapshot.switches[0].target().unwrap()
        );
    }

    #[test]
    fn test_defaults() {
        let snapshot = parse("fixtures: [{id: 1, channel: 1}]").unwrap();
        let fixture = snapshot.fixture(FixtureId(1)).unwrap();
        assert_eq!(1, fixture.footprint);
        assert_eq!(2700, fixture.cct_min_k);
        assert_eq!(6500, fixture.cct_max_k);
        assert_eq!(2.2, fixture.gamma);
        assert_eq!(2000, snapshot.settings.dim_speed_ms);
        assert!(snapshot.settings.dmx_dedupe_enabled);
    }

    #[test]
    fn test_bad_channel() {
        assert_fail(
            "fixtures: [{id: 1, channel: 0}]",
            "DMX address 0 outside 1-512",
        );
        assert_fail(
            "fixtures: [{id: 1, channel: 513}]",
            "DMX address 513 outside 1-512",
        );
    }

    #[test]
    fn test_bad_universe() {
        assert_fail(
            "fixtures: [{id: 1, channel: 1, universe: 4}]",
            "universe 4 out of range",
        );
    }

    #[test]
    fn test_duplicate_ids() {
        assert_fail(
            "fixtures: [{id: 1, channel: 1}, {id: 1, channel: 2}]",
            "duplicate fixture id 1",
        );
    }

    #[test]
    fn test_inverted_cct_range() {
        assert_fail(
            "fixtures: [{id: 1, channel: 1, cct_min_k: 5000, cct_max_k: 3000}]",
            "inverted",
        );
    }

    #[test]
    fn test_unknown_member() {
        assert_fail(
            "groups: [{id: 1, fixtures: [42]}]",
            "references unknown fixture 42",
        );
    }

    #[test]
    fn test_switch_needs_exactly_one_target() {
        assert_fail(
            "
fixtures: [{id: 1, channel: 1}]
groups: [{id: 1, fixtures: [1]}]
switches:
  - id: 1
    model: retractive
    digital_channel: 3
    target_fixture_id: 1
    target_group_id: 1
",
            "targets both",
        );
        assert_fail(
            "
switches:
  - id: 1
    model: retractive
    digital_channel: 3
",
            "has no target",
        );
    }

    #[test]
    fn test_switch_pin_requirements() {
        assert_fail(
            "
fixtures: [{id: 1, channel: 1}]
switches:
  - id: 1
    model: rotary_abs
    target_fixture_id: 1
",
            "needs an analog channel",
        );
    }

    #[test]
    fn test_duplicate_scene_fixture_rejected() {
        assert_fail(
            "
fixtures: [{id: 1, channel: 1}]
scenes:
  - id: 1
    values:
      - { fixture_id: 1, brightness: 100 }
      - { fixture_id: 1, brightness: 900 }
",
            "lists fixture 1 more than once",
        );
    }

    #[test]
    fn test_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, OK_CONFIG).unwrap();
        let snapshot = Snapshot::from_file(&path).unwrap();
        assert_eq!(2, snapshot.fixtures.len());
        assert!(Snapshot::from_file(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_tap_window_clamped() {
        let settings = SystemSettings {
            tap_window_ms: 5000,
            ..Default::default()
        };
        assert_eq!(900, settings.effective_tap_window_ms());
        let settings = SystemSettings {
            tap_window_ms: 10,
            ..Default::default()
        };
        assert_eq!(200, settings.effective_tap_window_ms());
    }

    #[test]
    fn test_short_circadian_profile_rejected() {
        assert_fail(
            "
circadian_profiles:
  - id: 1
    keyframes:
      - { time: '06:00:00', brightness: 0.2, cct_k: 2700 }
",
            "at least 2 keyframes",
        );
    }
}
