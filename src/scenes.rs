//! Scene recall and capture.
//!
//! A scene is an ordered set of per-fixture target values owned by the
//! config source. Recall applies each value to the target fixture's goals
//! with the standard transition rules; capture snapshots current goals into
//! a new scene config handed back to the config collaborator.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::broadcast::{Broadcaster, Event};
use crate::config::{GroupId, SceneConfig, SceneId, SceneValue};
use crate::store::{Store, TransitionSpec};

/// Converts between the store's unit-interval brightness and the 0-1000
/// scale scenes are stored in.
const SCENE_BRIGHTNESS_SCALE: f64 = 1000.0;

#[derive(Default)]
pub struct SceneEngine {
    recalls: u64,
    captures: u64,
}

impl SceneEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a scene to the store. Values for fixtures outside the scene's
    /// scope group are skipped. Returns the number of fixtures touched.
    pub fn recall(
        &mut self,
        scene: &SceneConfig,
        store: &mut Store,
        broadcaster: &Broadcaster,
        now: Instant,
    ) -> usize {
        let mut touched = 0;
        for value in &scene.values {
            if let Some(scope) = scene.scope_group_id {
                if !store.groups_of(value.fixture_id).any(|group| group == scope) {
                    debug!(
                        "scene {} skips fixture {} outside scope group {scope}",
                        scene.id, value.fixture_id
                    );
                    continue;
                }
            }
            let mut applied = false;
            if let Some(brightness) = value.brightness {
                applied |= store.set_fixture_brightness(
                    value.fixture_id,
                    brightness as f64 / SCENE_BRIGHTNESS_SCALE,
                    TransitionSpec::proportional(),
                    now,
                );
            }
            if let Some(cct) = value.cct_k {
                applied |= store.set_fixture_cct(
                    value.fixture_id,
                    cct,
                    TransitionSpec::proportional(),
                    now,
                );
            }
            if applied {
                touched += 1;
            }
        }
        self.recalls += 1;
        info!("scene {} recalled, {touched} fixture(s) updated", scene.id);
        broadcaster.publish(Event::SceneRecalled {
            scene_id: scene.id,
            name: scene.name.clone().unwrap_or_default(),
        });
        touched
    }

    /// Snapshot current fixture goals into a new scene. With a scope group,
    /// only members are captured; otherwise every registered fixture is.
    pub fn capture(
        &mut self,
        id: SceneId,
        name: Option<String>,
        scope: Option<GroupId>,
        store: &Store,
    ) -> SceneConfig {
        let fixture_ids = match scope {
            Some(group) => store.members_of(group),
            None => store.fixture_ids(),
        };
        let values = fixture_ids
            .into_iter()
            .filter_map(|fixture_id| {
                let fixture = store.fixture(fixture_id)?;
                Some(SceneValue {
                    fixture_id,
                    brightness: Some(
                        (fixture.goal_brightness * SCENE_BRIGHTNESS_SCALE).round() as u16
                    ),
                    cct_k: fixture
                        .config
                        .supports_cct()
                        .then_some(fixture.goal_cct),
                })
            })
            .collect();
        self.captures += 1;
        SceneConfig {
            id,
            name,
            scope_group_id: scope,
            values,
        }
    }

    pub fn recalls(&self) -> u64 {
        self.recalls
    }

    pub fn captures(&self) -> u64 {
        self.captures
    }
}

/// Convenience for recalling by id out of a snapshot.
pub fn scene_by_id(
    scenes: &[Arc<SceneConfig>],
    id: SceneId,
) -> Option<&Arc<SceneConfig>> {
    scenes.iter().find(|scene| scene.id == id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::broadcast::EventKind;
    use crate::config::{FixtureConfig, FixtureId, FixtureKind, GroupConfig};
    use crate::transitions::TransitionConfig;
    use std::time::Duration;

    fn fixture_config(id: u32) -> Arc<FixtureConfig> {
        Arc::new(FixtureConfig {
            id: FixtureId(id),
            name: None,
            universe: 0,
            channel: ((id as usize) * 2 + 1).into(),
            secondary_channel: None,
            footprint: 2,
            kind: FixtureKind::TunableWhite,
            cct_min_k: 2700,
            cct_max_k: 6500,
            warm_xy: None,
            cool_xy: None,
            warm_lumens: None,
            cool_lumens: None,
            gamma: 2.2,
            dtw_ignore: false,
            dtw_cct_min_override: None,
            dtw_cct_max_override: None,
            default_cct_k: None,
        })
    }

    fn group_config(id: u32) -> Arc<GroupConfig> {
        Arc::new(GroupConfig {
            id: GroupId(id),
            name: None,
            circadian_profile_id: None,
            default_brightness: 1.0,
            default_cct_k: None,
            dtw_ignore: false,
            dtw_cct_min_override: None,
            dtw_cct_max_override: None,
            sleep_lock: None,
            fixtures: vec![],
        })
    }

    fn rig() -> (SceneEngine, Store, Broadcaster, Instant) {
        let mut store = Store::new(TransitionConfig::default());
        store.register_fixture(fixture_config(1));
        store.register_fixture(fixture_config(2));
        (
            SceneEngine::new(),
            store,
            Broadcaster::new(Duration::from_millis(100)),
            Instant::now(),
        )
    }

    #[test]
    fn test_recall_applies_values() {
        let (mut engine, mut store, broadcaster, now) = rig();
        let scene = SceneConfig {
            id: SceneId(1),
            name: Some("reading".into()),
            scope_group_id: None,
            values: vec![
                SceneValue {
                    fixture_id: FixtureId(1),
                    brightness: Some(800),
                    cct_k: Some(3500),
                },
                SceneValue {
                    fixture_id: FixtureId(2),
                    brightness: Some(250),
                    cct_k: None,
                },
            ],
        };
        let subscription = broadcaster.subscribe(None);
        let touched = engine.recall(&scene, &mut store, &broadcaster, now);
        assert_eq!(2, touched);
        assert_eq!(0.8, store.fixture(FixtureId(1)).unwrap().goal_brightness);
        assert_eq!(3500, store.fixture(FixtureId(1)).unwrap().goal_cct);
        assert_eq!(0.25, store.fixture(FixtureId(2)).unwrap().goal_brightness);

        let events: Vec<EventKind> = subscription
            .receiver
            .try_iter()
            .map(|envelope| envelope.event.kind())
            .collect();
        assert!(events.contains(&EventKind::SceneRecalled));
    }

    #[test]
    fn test_scope_group_limits_recall() {
        let (mut engine, mut store, broadcaster, now) = rig();
        store.register_group(group_config(1));
        store.add_fixture_to_group(FixtureId(1), GroupId(1));
        let scene = SceneConfig {
            id: SceneId(1),
            name: None,
            scope_group_id: Some(GroupId(1)),
            values: vec![
                SceneValue {
                    fixture_id: FixtureId(1),
                    brightness: Some(1000),
                    cct_k: None,
                },
                // Not a member; must be skipped.
                SceneValue {
                    fixture_id: FixtureId(2),
                    brightness: Some(1000),
                    cct_k: None,
                },
            ],
        };
        let touched = engine.recall(&scene, &mut store, &broadcaster, now);
        assert_eq!(1, touched);
        assert_eq!(1.0, store.fixture(FixtureId(1)).unwrap().goal_brightness);
        assert_eq!(0.0, store.fixture(FixtureId(2)).unwrap().goal_brightness);
    }

    #[test]
    fn test_capture_round_trips_goals() {
        let (mut engine, mut store, _broadcaster, now) = rig();
        store.set_fixture_brightness(FixtureId(1), 0.8, TransitionSpec::INSTANT, now);
        store.set_fixture_cct(FixtureId(1), 3000, TransitionSpec::INSTANT, now);
        let captured = engine.capture(SceneId(9), Some("evening".into()), None, &store);
        assert_eq!(SceneId(9), captured.id);
        let value = captured
            .values
            .iter()
            .find(|value| value.fixture_id == FixtureId(1))
            .unwrap();
        assert_eq!(Some(800), value.brightness);
        assert_eq!(Some(3000), value.cct_k);
    }

    #[test]
    fn test_capture_scoped_to_group() {
        let (mut engine, mut store, _broadcaster, _now) = rig();
        store.register_group(group_config(1));
        store.add_fixture_to_group(FixtureId(1), GroupId(1));
        let captured = engine.capture(SceneId(9), None, Some(GroupId(1)), &store);
        assert_eq!(1, captured.values.len());
        assert_eq!(FixtureId(1), captured.values[0].fixture_id);
    }
}
