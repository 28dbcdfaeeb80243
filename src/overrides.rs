//! Time-limited pinned values that beat layered composition.
//!
//! At most one override is active per (target, property); newer writes evict
//! older ones. Overrides expire by elapsed time; a periodic sweep removes
//! dead entries, and reads double-check expiry so a stale entry between
//! sweeps never wins.

use std::time::{Duration, Instant};

use log::debug;
use ordermap::OrderMap;

use crate::config::{FixtureId, GroupId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OverrideTarget {
    Fixture(FixtureId),
    Group(GroupId),
}

impl std::fmt::Display for OverrideTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixture(id) => write!(f, "fixture {id}"),
            Self::Group(id) => write!(f, "group {id}"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OverrideProperty {
    Brightness,
    ColorTemp,
}

/// Where an override came from, for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverrideSource {
    Switch,
    Api,
    Scene,
}

#[derive(Clone, Copy, Debug)]
pub struct OverrideEntry {
    pub value: f64,
    pub expires_at: Instant,
    pub source: OverrideSource,
}

/// Table of active overrides.
#[derive(Default)]
pub struct OverrideTable {
    entries: OrderMap<(OverrideTarget, OverrideProperty), OverrideEntry>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an override, evicting any previous one on the same key.
    pub fn set(
        &mut self,
        target: OverrideTarget,
        property: OverrideProperty,
        value: f64,
        ttl: Duration,
        source: OverrideSource,
        now: Instant,
    ) {
        self.entries.insert(
            (target, property),
            OverrideEntry {
                value,
                expires_at: now + ttl,
                source,
            },
        );
        debug!("override set on {target} from {source:?}: {value} for {ttl:?}");
    }

    pub fn clear(&mut self, target: OverrideTarget, property: OverrideProperty) -> bool {
        self.entries.remove(&(target, property)).is_some()
    }

    /// The active override value, if present and unexpired.
    pub fn get(
        &self,
        target: OverrideTarget,
        property: OverrideProperty,
        now: Instant,
    ) -> Option<f64> {
        self.entries
            .get(&(target, property))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value)
    }

    /// The active CCT override for a fixture, rounded back to Kelvin.
    pub fn fixture_cct(&self, fixture: FixtureId, now: Instant) -> Option<u32> {
        self.get(
            OverrideTarget::Fixture(fixture),
            OverrideProperty::ColorTemp,
            now,
        )
        .map(|value| value.round() as u32)
    }

    /// True if the fixture has any unexpired override.
    pub fn fixture_has_active(&self, fixture: FixtureId, now: Instant) -> bool {
        self.entries
            .iter()
            .any(|((target, _), entry)| {
                *target == OverrideTarget::Fixture(fixture) && entry.expires_at > now
            })
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_newer_write_evicts_older() {
        let mut table = OverrideTable::new();
        let now = Instant::now();
        let key = OverrideTarget::Fixture(FixtureId(1));
        table.set(
            key,
            OverrideProperty::ColorTemp,
            3000.0,
            TTL,
            OverrideSource::Switch,
            now,
        );
        table.set(
            key,
            OverrideProperty::ColorTemp,
            4000.0,
            TTL,
            OverrideSource::Api,
            now,
        );
        assert_eq!(1, table.len());
        assert_eq!(Some(4000), table.fixture_cct(FixtureId(1), now));
    }

    #[test]
    fn test_expiry() {
        let mut table = OverrideTable::new();
        let now = Instant::now();
        table.set(
            OverrideTarget::Fixture(FixtureId(1)),
            OverrideProperty::ColorTemp,
            3000.0,
            TTL,
            OverrideSource::Switch,
            now,
        );
        let later = now + TTL + Duration::from_secs(1);
        // Reads respect expiry even before the sweep runs.
        assert_eq!(None, table.fixture_cct(FixtureId(1), later));
        assert!(!table.fixture_has_active(FixtureId(1), later));
        assert_eq!(1, table.sweep(later));
        assert!(table.is_empty());
    }

    #[test]
    fn test_properties_are_independent() {
        let mut table = OverrideTable::new();
        let now = Instant::now();
        let key = OverrideTarget::Fixture(FixtureId(1));
        table.set(
            key,
            OverrideProperty::Brightness,
            0.5,
            TTL,
            OverrideSource::Api,
            now,
        );
        table.set(
            key,
            OverrideProperty::ColorTemp,
            3000.0,
            TTL,
            OverrideSource::Api,
            now,
        );
        assert_eq!(2, table.len());
        assert_eq!(
            Some(0.5),
            table.get(key, OverrideProperty::Brightness, now)
        );
    }

    #[test]
    fn test_clear() {
        let mut table = OverrideTable::new();
        let now = Instant::now();
        let key = OverrideTarget::Group(GroupId(2));
        table.set(
            key,
            OverrideProperty::Brightness,
            0.5,
            TTL,
            OverrideSource::Api,
            now,
        );
        assert!(table.clear(key, OverrideProperty::Brightness));
        assert!(!table.clear(key, OverrideProperty::Brightness));
        assert!(table.is_empty());
    }
}
