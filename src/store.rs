//! In-memory runtime state for all fixtures and groups.
//!
//! All mutations go through this store so the control loop sees a consistent
//! snapshot within one tick. The store is owned by the tick executor; no
//! interior locking. External callers enqueue mutations through the command
//! channel (see `command`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use number::UnipolarFloat;
use ordermap::{OrderMap, OrderSet};

use crate::config::{FixtureConfig, FixtureId, GroupConfig, GroupId};
use crate::transitions::{Easing, Transition, TransitionConfig};

pub mod command;

/// How a setpoint change should move toward its goal.
#[derive(Copy, Clone, Debug, Default)]
pub struct TransitionSpec {
    /// Explicit duration; zero means jump immediately.
    pub duration: Option<Duration>,
    pub easing: Option<Easing>,
    /// With no explicit duration, scale the configured full-range time by
    /// the fraction of the range traversed.
    pub use_proportional_time: bool,
}

impl TransitionSpec {
    pub const INSTANT: Self = Self {
        duration: Some(Duration::ZERO),
        easing: None,
        use_proportional_time: false,
    };

    pub fn proportional() -> Self {
        Self {
            duration: None,
            easing: None,
            use_proportional_time: true,
        }
    }

    pub fn over(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            easing: None,
            use_proportional_time: false,
        }
    }

    pub fn with_easing(mut self, easing: Easing) -> Self {
        self.easing = Some(easing);
        self
    }
}

/// Hot-path runtime state for one fixture.
pub struct FixtureRuntime {
    pub config: Arc<FixtureConfig>,
    pub goal_brightness: f64,
    pub current_brightness: f64,
    pub goal_cct: u32,
    pub current_cct: u32,
    brightness_transition: Option<Transition>,
    cct_transition: Option<Transition>,
    /// Set when a user pinned this fixture's CCT by hand; beats DTW in the
    /// resolution ladder.
    pub manual_cct_active: bool,
    /// Mirrors whether an unexpired override targets this fixture.
    pub override_active: bool,
}

impl FixtureRuntime {
    fn new(config: Arc<FixtureConfig>) -> Self {
        let initial_cct = config.default_cct_k.unwrap_or(config.cct_max_k);
        Self {
            config,
            goal_brightness: 0.0,
            current_brightness: 0.0,
            goal_cct: initial_cct,
            current_cct: initial_cct,
            brightness_transition: None,
            cct_transition: None,
            manual_cct_active: false,
            override_active: false,
        }
    }

    pub fn is_brightness_transitioning(&self) -> bool {
        self.brightness_transition.is_some()
    }

    pub fn is_cct_transitioning(&self) -> bool {
        self.cct_transition.is_some()
    }

    fn advance(&mut self, now: Instant) -> bool {
        if let Some(transition) = &self.brightness_transition {
            let (value, complete) = transition.value_at(now);
            self.current_brightness = value;
            if complete {
                self.current_brightness = transition.end_value;
                self.brightness_transition = None;
            }
        }
        if let Some(transition) = &self.cct_transition {
            let (value, complete) = transition.value_at(now);
            self.current_cct = value.round() as u32;
            if complete {
                self.current_cct = transition.end_value.round() as u32;
                self.cct_transition = None;
            }
        }
        self.brightness_transition.is_some() || self.cct_transition.is_some()
    }
}

/// Runtime state for one group.
pub struct GroupRuntime {
    pub config: Arc<GroupConfig>,
    /// Scales every member's brightness during composition. 1.0 passes
    /// member state through unchanged.
    pub brightness_multiplier: f64,
    pub circadian_enabled: bool,
    pub circadian_brightness: f64,
    pub circadian_cct: Option<u32>,
}

impl GroupRuntime {
    fn new(config: Arc<GroupConfig>) -> Self {
        Self {
            config,
            brightness_multiplier: 1.0,
            circadian_enabled: false,
            circadian_brightness: 1.0,
            circadian_cct: None,
        }
    }
}

/// The central state store.
pub struct Store {
    fixtures: OrderMap<FixtureId, FixtureRuntime>,
    groups: OrderMap<GroupId, GroupRuntime>,
    /// Fixture to group relation, insertion-ordered. The order decides which
    /// group's circadian CCT wins when several apply.
    memberships: OrderMap<FixtureId, OrderSet<GroupId>>,
    transition_config: TransitionConfig,
    dirty: bool,
}

impl Store {
    pub fn new(transition_config: TransitionConfig) -> Self {
        Self {
            fixtures: OrderMap::new(),
            groups: OrderMap::new(),
            memberships: OrderMap::new(),
            transition_config,
            dirty: false,
        }
    }

    pub fn set_transition_config(&mut self, config: TransitionConfig) {
        self.transition_config = config;
    }

    // Registration.

    pub fn register_fixture(&mut self, config: Arc<FixtureConfig>) {
        let id = config.id;
        if self.fixtures.contains_key(&id) {
            return;
        }
        self.fixtures.insert(id, FixtureRuntime::new(config));
        self.memberships.entry(id).or_default();
        debug!("fixture {id} registered");
    }

    pub fn unregister_fixture(&mut self, id: FixtureId) {
        self.fixtures.remove(&id);
        self.memberships.remove(&id);
    }

    /// Point an already-registered fixture at a fresh config snapshot,
    /// re-clamping runtime CCT into the new range.
    pub fn refresh_fixture_config(&mut self, config: Arc<FixtureConfig>) -> bool {
        let Some(fixture) = self.fixtures.get_mut(&config.id) else {
            return false;
        };
        fixture.goal_cct = fixture.goal_cct.clamp(config.cct_min_k, config.cct_max_k);
        fixture.current_cct = fixture
            .current_cct
            .clamp(config.cct_min_k, config.cct_max_k);
        fixture.config = config;
        true
    }

    pub fn register_group(&mut self, config: Arc<GroupConfig>) {
        let id = config.id;
        if self.groups.contains_key(&id) {
            return;
        }
        self.groups.insert(id, GroupRuntime::new(config));
        debug!("group {id} registered");
    }

    /// Point an already-registered group at a fresh config snapshot.
    pub fn refresh_group_config(&mut self, config: Arc<GroupConfig>) -> bool {
        let Some(group) = self.groups.get_mut(&config.id) else {
            return false;
        };
        group.config = config;
        true
    }

    /// Remove a group and scrub it from every fixture's membership set.
    pub fn unregister_group(&mut self, id: GroupId) {
        self.groups.remove(&id);
        for members in self.memberships.values_mut() {
            members.remove(&id);
        }
    }

    pub fn add_fixture_to_group(&mut self, fixture: FixtureId, group: GroupId) -> bool {
        if !self.fixtures.contains_key(&fixture) || !self.groups.contains_key(&group) {
            warn!("cannot relate fixture {fixture} to group {group}: not registered");
            return false;
        }
        self.memberships.entry(fixture).or_default().insert(group)
    }

    pub fn remove_fixture_from_group(&mut self, fixture: FixtureId, group: GroupId) -> bool {
        self.memberships
            .get_mut(&fixture)
            .map(|members| members.remove(&group))
            .unwrap_or(false)
    }

    // Access.

    pub fn fixture(&self, id: FixtureId) -> Option<&FixtureRuntime> {
        self.fixtures.get(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupRuntime> {
        self.groups.get(&id)
    }

    pub fn fixtures(&self) -> impl Iterator<Item = (&FixtureId, &FixtureRuntime)> {
        self.fixtures.iter()
    }

    pub fn fixture_ids(&self) -> Vec<FixtureId> {
        self.fixtures.keys().copied().collect()
    }

    pub fn fixture_count(&self) -> usize {
        self.fixtures.len()
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// The groups a fixture belongs to, in insertion order.
    pub fn groups_of(&self, fixture: FixtureId) -> impl Iterator<Item = GroupId> + '_ {
        self.memberships
            .get(&fixture)
            .into_iter()
            .flat_map(|members| members.iter().copied())
    }

    /// The fixtures belonging to a group.
    pub fn members_of(&self, group: GroupId) -> Vec<FixtureId> {
        self.memberships
            .iter()
            .filter(|(_, members)| members.contains(&group))
            .map(|(fixture, _)| *fixture)
            .collect()
    }

    // Setpoints.

    /// Set a fixture's brightness goal. Returns false if the fixture is
    /// unknown.
    pub fn set_fixture_brightness(
        &mut self,
        id: FixtureId,
        value: f64,
        spec: TransitionSpec,
        now: Instant,
    ) -> bool {
        let config = self.transition_config;
        let Some(fixture) = self.fixtures.get_mut(&id) else {
            warn!("brightness write to unknown fixture {id}");
            return false;
        };
        let value = UnipolarFloat::new(value).val();
        let start = fixture.current_brightness;
        let duration = match spec.duration {
            Some(duration) => duration,
            None if spec.use_proportional_time => config.brightness_duration(start, value),
            None => Duration::ZERO,
        };

        fixture.goal_brightness = value;
        if duration.is_zero() {
            fixture.current_brightness = value;
            fixture.brightness_transition = None;
        } else {
            fixture.brightness_transition = Some(Transition::new(
                start,
                value,
                now,
                duration,
                spec.easing.unwrap_or(config.default_easing),
            ));
        }
        self.dirty = true;
        true
    }

    /// Set a fixture's CCT goal, clamped to its capability range. Marks the
    /// fixture's CCT as manually pinned. Returns false for unknown or
    /// non-CCT fixtures.
    pub fn set_fixture_cct(
        &mut self,
        id: FixtureId,
        kelvin: u32,
        spec: TransitionSpec,
        now: Instant,
    ) -> bool {
        let config = self.transition_config;
        let Some(fixture) = self.fixtures.get_mut(&id) else {
            warn!("CCT write to unknown fixture {id}");
            return false;
        };
        if !fixture.config.supports_cct() {
            debug!("CCT write ignored for single-channel fixture {id}");
            return false;
        }
        let (cct_min, cct_max) = (fixture.config.cct_min_k, fixture.config.cct_max_k);
        let kelvin = kelvin.clamp(cct_min, cct_max);
        let start = fixture.current_cct;
        let duration = match spec.duration {
            Some(duration) => duration,
            None if spec.use_proportional_time => {
                config.cct_duration(start, kelvin, cct_min, cct_max)
            }
            None => Duration::ZERO,
        };

        fixture.goal_cct = kelvin;
        fixture.manual_cct_active = true;
        if duration.is_zero() {
            fixture.current_cct = kelvin;
            fixture.cct_transition = None;
        } else {
            fixture.cct_transition = Some(Transition::new(
                start as f64,
                kelvin as f64,
                now,
                duration,
                spec.easing.unwrap_or(config.default_easing),
            ));
        }
        self.dirty = true;
        true
    }

    pub fn clear_manual_cct(&mut self, id: FixtureId) {
        if let Some(fixture) = self.fixtures.get_mut(&id) {
            fixture.manual_cct_active = false;
        }
    }

    pub fn set_override_active(&mut self, id: FixtureId, active: bool) {
        if let Some(fixture) = self.fixtures.get_mut(&id) {
            fixture.override_active = active;
        }
    }

    /// Set brightness for every member of a group and record the group
    /// multiplier. Returns the number of fixtures updated; 0 for an unknown
    /// or empty group.
    pub fn set_group_brightness(
        &mut self,
        id: GroupId,
        value: f64,
        spec: TransitionSpec,
        now: Instant,
    ) -> usize {
        let value = UnipolarFloat::new(value).val();
        let Some(group) = self.groups.get_mut(&id) else {
            warn!("brightness write to unknown group {id}");
            return 0;
        };
        group.brightness_multiplier = value;
        self.dirty = true;

        let mut updated = 0;
        for fixture in self.members_of(id) {
            if self.set_fixture_brightness(fixture, value, spec, now) {
                updated += 1;
            }
        }
        updated
    }

    /// Set CCT for every member of a group, marking each as manually pinned.
    /// Returns the number of fixtures updated.
    pub fn set_group_cct(
        &mut self,
        id: GroupId,
        kelvin: u32,
        spec: TransitionSpec,
        now: Instant,
    ) -> usize {
        if !self.groups.contains_key(&id) {
            warn!("CCT write to unknown group {id}");
            return 0;
        }
        let mut updated = 0;
        for fixture in self.members_of(id) {
            if self.set_fixture_cct(fixture, kelvin, spec, now) {
                updated += 1;
            }
        }
        if updated > 0 {
            self.dirty = true;
        }
        updated
    }

    /// Record circadian values on a group without fanning out; the resolver
    /// pulls them during composition.
    pub fn set_group_circadian(
        &mut self,
        id: GroupId,
        brightness_multiplier: f64,
        cct: Option<u32>,
    ) -> bool {
        let Some(group) = self.groups.get_mut(&id) else {
            warn!("circadian write to unknown group {id}");
            return false;
        };
        group.circadian_brightness = UnipolarFloat::new(brightness_multiplier).val();
        group.circadian_cct = cct;
        self.dirty = true;
        true
    }

    pub fn set_group_circadian_enabled(&mut self, id: GroupId, enabled: bool) -> bool {
        let Some(group) = self.groups.get_mut(&id) else {
            return false;
        };
        group.circadian_enabled = enabled;
        true
    }

    // Composition inputs.

    /// Interpolate every active transition. Returns the number of fixtures
    /// still in flight.
    pub fn update_transitions(&mut self, now: Instant) -> usize {
        self.fixtures
            .values_mut()
            .map(|fixture| fixture.advance(now))
            .filter(|advancing| *advancing)
            .count()
    }

    /// Layered brightness for one fixture: its own interpolated value scaled
    /// by every containing group's multiplier, and by the circadian
    /// multiplier of groups with circadian enabled.
    pub fn effective_brightness(&self, id: FixtureId) -> Option<f64> {
        let fixture = self.fixtures.get(&id)?;
        let mut brightness = fixture.current_brightness;
        for group_id in self.groups_of(id) {
            let Some(group) = self.groups.get(&group_id) else {
                continue;
            };
            brightness *= group.brightness_multiplier;
            if group.circadian_enabled {
                brightness *= group.circadian_brightness;
            }
        }
        Some(UnipolarFloat::new(brightness).val())
    }

    /// The circadian CCT this fixture should follow, if any: the first
    /// containing group (insertion-ordered) with circadian enabled and a CCT
    /// on record.
    pub fn circadian_cct_for(&self, id: FixtureId) -> Option<u32> {
        self.groups_of(id).find_map(|group_id| {
            let group = self.groups.get(&group_id)?;
            if group.circadian_enabled {
                group.circadian_cct
            } else {
                None
            }
        })
    }

    // Persistence handshake.

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}
