//! The daemon: owns every engine and drives the composition pipeline.
//!
//! Within a tick the order is fixed: external mutations, input sampling and
//! switch state machines, circadian update, transition interpolation,
//! per-fixture resolution, color mixing, DMX send, then acknowledgements.
//! Periodic work (persistence, DTW refresh, settings watch, override expiry,
//! health checks, discovery) runs from named scheduler jobs inside the same
//! tick context.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{Receiver, SyncSender};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::NaiveTime;
use log::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, Event};
use crate::circadian::CircadianEngine;
use crate::config::{ConfigSink, FixtureConfig, GroupConfig, GroupId, Snapshot};
use crate::discovery::SwitchDiscovery;
use crate::dtw::{DtwEngine, FixtureDtwConfig};
use crate::hardware::HardwareManager;
use crate::output::OutputStage;
use crate::overrides::{OverrideTable, OverrideTarget};
use crate::resolver::resolve;
use crate::scenes::SceneEngine;
use crate::store::command::{CommandEnvelope, StoreCommand, StoreHandle};
use crate::store::{Store, TransitionSpec};
use crate::switches::{SwitchContext, SwitchHandler};
use crate::tick::{Scheduler, TickLoop};

const PERSISTENCE_INTERVAL: Duration = Duration::from_secs(5);
const DISCOVERY_INTERVAL: Duration = Duration::from_millis(500);
const DTW_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const SETTINGS_WATCH_INTERVAL: Duration = Duration::from_secs(5);
const OVERRIDE_EXPIRY_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

const DISCOVERY_CHANGE_THRESHOLD: usize = 3;
const DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

/// Persists runtime goals between restarts. Current values are not saved;
/// they are reconstructed from goals at startup.
pub trait StatePersistence: Send {
    fn flush(&mut self, store: &Store) -> Result<()>;
}

/// Persistence stand-in for running without a persistence collaborator.
pub struct LoggingPersistence;

impl StatePersistence for LoggingPersistence {
    fn flush(&mut self, store: &Store) -> Result<()> {
        debug!("state flush: {} fixture(s)", store.fixture_count());
        Ok(())
    }
}

fn local_time_of_day() -> NaiveTime {
    chrono::Local::now().time()
}

pub struct Daemon {
    snapshot: Arc<Snapshot>,
    config_path: PathBuf,
    store: Store,
    overrides: OverrideTable,
    dtw: DtwEngine,
    circadian: CircadianEngine,
    switches: SwitchHandler,
    scenes: SceneEngine,
    output: OutputStage,
    hw: HardwareManager,
    broadcaster: Arc<Broadcaster>,
    scheduler: Scheduler,
    commands: Receiver<CommandEnvelope>,
    handle: StoreHandle,
    persistence: Box<dyn StatePersistence>,
    config_sink: Box<dyn ConfigSink>,
    discovery: SwitchDiscovery,
    /// Acks answered after the tick that applied their commands.
    pending_acks: Vec<(SyncSender<usize>, usize)>,
    /// Injectable clock for the circadian engine.
    time_source: fn() -> NaiveTime,
}

impl Daemon {
    pub fn new(
        snapshot: Arc<Snapshot>,
        config_path: PathBuf,
        mut hw: HardwareManager,
        persistence: Box<dyn StatePersistence>,
        config_sink: Box<dyn ConfigSink>,
    ) -> Result<Self> {
        let settings = &snapshot.settings;
        let broadcaster = Arc::new(Broadcaster::new(Duration::from_millis(
            settings.broadcast_throttle_ms,
        )));

        hw.initialize();

        let (handle, commands) = StoreHandle::new();
        let mut scheduler = Scheduler::new();
        scheduler.schedule("persistence", PERSISTENCE_INTERVAL);
        scheduler.schedule("switch_discovery", DISCOVERY_INTERVAL);
        scheduler.schedule("dtw_refresh", DTW_REFRESH_INTERVAL);
        scheduler.schedule("settings_watch", SETTINGS_WATCH_INTERVAL);
        scheduler.schedule("override_expiry", OVERRIDE_EXPIRY_INTERVAL);
        scheduler.schedule("health_check", HEALTH_CHECK_INTERVAL);
        scheduler.schedule("system_status", STATUS_INTERVAL);

        let mut daemon = Self {
            snapshot: Arc::new(Snapshot::default()),
            config_path,
            store: Store::new(settings.transitions),
            overrides: OverrideTable::new(),
            dtw: DtwEngine::new(settings.dtw.clone()),
            circadian: CircadianEngine::new(),
            switches: SwitchHandler::new(
                settings.hold_threshold_ms,
                settings.dim_speed_ms,
                settings.effective_tap_window_ms(),
            ),
            scenes: SceneEngine::new(),
            output: OutputStage::new(
                settings.dmx_dedupe_enabled,
                Duration::from_millis(settings.dmx_dedupe_ttl_ms),
            ),
            hw,
            broadcaster,
            scheduler,
            commands,
            handle,
            persistence,
            config_sink,
            discovery: SwitchDiscovery::new(&[], DISCOVERY_CHANGE_THRESHOLD, DISCOVERY_WINDOW),
            pending_acks: Vec::new(),
            time_source: local_time_of_day,
        };
        daemon.apply_snapshot(snapshot);
        info!(
            "daemon ready: {} fixture(s), {} group(s), {} switch(es)",
            daemon.store.fixture_count(),
            daemon.store.group_count(),
            daemon.switches.switch_count(),
        );
        Ok(daemon)
    }

    /// Handle for enqueueing mutations from other threads.
    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    #[cfg(test)]
    fn set_time_source(&mut self, time_source: fn() -> NaiveTime) {
        self.time_source = time_source;
    }

    /// Run the control loop until shutdown is signalled, then wind down.
    pub fn run(mut self, frequency_hz: f64, shutdown: &Arc<AtomicBool>) {
        let mut tick_loop: TickLoop<Daemon> = TickLoop::new(frequency_hz);
        tick_loop.register("scheduler", |daemon, now| {
            daemon.scheduler_tick(now);
            Ok(())
        });
        tick_loop.register("control", |daemon, now| {
            daemon.control_tick(now);
            Ok(())
        });
        info!("control loop running at {frequency_hz} Hz");
        tick_loop.run(&mut self, shutdown);
        self.shutdown();
    }

    fn shutdown(&mut self) {
        info!("shutting down");
        if self.store.is_dirty() {
            if let Err(err) = self.persistence.flush(&self.store) {
                error!("final state flush failed: {err:#}");
            } else {
                self.store.mark_clean();
            }
        }
        self.hw.shutdown();
    }

    /// Dispatch periodic jobs that are due this tick.
    fn scheduler_tick(&mut self, now: Instant) {
        for job in self.scheduler.due(now) {
            match job.as_str() {
                "persistence" => self.flush_state(),
                "switch_discovery" => {
                    let Daemon {
                        discovery,
                        hw,
                        broadcaster,
                        ..
                    } = self;
                    discovery.scan(hw, broadcaster, now);
                }
                "dtw_refresh" => self.dtw.refresh(self.snapshot.settings.dtw.clone()),
                "settings_watch" => self.apply_runtime_settings(),
                "override_expiry" => self.expire_overrides(now),
                "health_check" => self.hw.health_check(),
                "system_status" => {
                    let status = self.statistics();
                    self.broadcaster.publish(Event::SystemStatus { status });
                }
                other => warn!("unknown scheduler job '{other}'"),
            }
        }
    }

    /// One pass of the composition pipeline.
    fn control_tick(&mut self, now: Instant) {
        self.drain_commands(now);
        self.process_switches(now);
        self.apply_circadian(now);
        self.store.update_transitions(now);
        self.render(now);
        for (ack, touched) in self.pending_acks.drain(..) {
            let _ = ack.try_send(touched);
        }
    }

    fn drain_commands(&mut self, now: Instant) {
        let mut envelopes = Vec::new();
        while let Ok(envelope) = self.commands.try_recv() {
            envelopes.push(envelope);
        }
        for envelope in envelopes {
            let touched = self.apply_command(envelope.command, now);
            if let Some(ack) = envelope.ack {
                self.pending_acks.push((ack, touched));
            }
        }
    }

    fn process_switches(&mut self, now: Instant) {
        let Daemon {
            store,
            hw,
            scenes,
            snapshot,
            overrides,
            broadcaster,
            switches,
            ..
        } = self;
        let mut ctx = SwitchContext {
            store,
            hw,
            scenes,
            snapshot,
            overrides,
            broadcaster,
        };
        switches.process_inputs(&mut ctx, now);
    }

    fn apply_circadian(&mut self, now: Instant) {
        let time = (self.time_source)();
        let groups: Vec<GroupId> = self.circadian.assigned_groups().collect();
        for group in groups {
            let Some((brightness, cct)) = self.circadian.evaluate_group(group, time) else {
                continue;
            };
            let changed = self
                .store
                .group(group)
                .map(|runtime| {
                    runtime.circadian_cct != Some(cct)
                        || (runtime.circadian_brightness - brightness).abs() > 1e-3
                })
                .unwrap_or(false);
            self.store.set_group_circadian(group, brightness, Some(cct));
            if changed {
                self.broadcaster.publish_throttled(
                    Event::CircadianChanged {
                        group_id: group,
                        brightness_multiplier: brightness,
                        color_temp: Some(cct),
                    },
                    now,
                );
            }
        }
    }

    /// Resolve every fixture and hand frames to the output stage.
    fn render(&mut self, now: Instant) {
        for id in self.store.fixture_ids() {
            let Some(resolved) = resolve(&self.store, &self.overrides, &mut self.dtw, id, now)
            else {
                continue;
            };
            let Some(config) = self.store.fixture(id).map(|f| f.config.clone()) else {
                continue;
            };
            self.output.stage_fixture(&config, &resolved);
        }
        self.output.flush(&mut self.hw, now);
    }

    fn flush_state(&mut self) {
        if !self.store.is_dirty() {
            return;
        }
        match self.persistence.flush(&self.store) {
            Ok(()) => self.store.mark_clean(),
            // The dirty bit stays set; retried next interval.
            Err(err) => warn!(
                "{}",
                crate::error::CoreError::Persistence(format!("{err:#}"))
            ),
        }
    }

    fn expire_overrides(&mut self, now: Instant) {
        let expired = self.overrides.sweep(now);
        if expired > 0 {
            debug!("{expired} override(s) expired");
        }
        for id in self.store.fixture_ids() {
            let active = self.overrides.fixture_has_active(id, now);
            self.store.set_override_active(id, active);
        }
    }

    fn apply_command(&mut self, command: StoreCommand, now: Instant) -> usize {
        match command {
            StoreCommand::SetFixtureBrightness { id, value, spec } => self
                .store
                .set_fixture_brightness(id, value, spec, now)
                .into(),
            StoreCommand::SetFixtureCct { id, kelvin, spec } => {
                self.store.set_fixture_cct(id, kelvin, spec, now).into()
            }
            StoreCommand::SetGroupBrightness { id, value, spec } => {
                self.store.set_group_brightness(id, value, spec, now)
            }
            StoreCommand::SetGroupCct { id, kelvin, spec } => {
                self.store.set_group_cct(id, kelvin, spec, now)
            }
            StoreCommand::SetGroupCircadianEnabled { id, enabled } => {
                self.store.set_group_circadian_enabled(id, enabled).into()
            }
            StoreCommand::AddFixtureToGroup { fixture, group } => {
                self.store.add_fixture_to_group(fixture, group).into()
            }
            StoreCommand::RemoveFixtureFromGroup { fixture, group } => {
                self.store.remove_fixture_from_group(fixture, group).into()
            }
            StoreCommand::UnregisterGroup { id } => {
                self.store.unregister_group(id);
                1
            }
            StoreCommand::RecallScene { id } => {
                let Some(scene) = self.snapshot.scene(id).cloned() else {
                    warn!("recall of unknown scene {id}");
                    return 0;
                };
                self.scenes
                    .recall(&scene, &mut self.store, &self.broadcaster, now)
            }
            StoreCommand::CaptureScene { id, name, scope } => {
                let scene = self.scenes.capture(id, name, scope, &self.store);
                let captured = scene.values.len();
                if let Err(err) = self.config_sink.write_scene(&scene) {
                    warn!("scene capture write failed: {err:#}");
                    return 0;
                }
                captured
            }
            StoreCommand::SetOverride {
                target,
                property,
                value,
                ttl,
            } => {
                let ttl = ttl.unwrap_or(Duration::from_secs(
                    self.snapshot.settings.dtw.override_ttl_seconds,
                ));
                self.overrides.set(
                    target,
                    property,
                    value,
                    ttl,
                    crate::overrides::OverrideSource::Api,
                    now,
                );
                if let OverrideTarget::Fixture(fixture) = target {
                    self.store.set_override_active(fixture, true);
                }
                1
            }
            StoreCommand::ClearOverride { target, property } => {
                let cleared = self.overrides.clear(target, property);
                if let OverrideTarget::Fixture(fixture) = target {
                    let active = self.overrides.fixture_has_active(fixture, now);
                    self.store.set_override_active(fixture, active);
                }
                cleared.into()
            }
            StoreCommand::ReloadConfig { path } => {
                let path = path.unwrap_or_else(|| self.config_path.clone());
                match Snapshot::from_file(&path) {
                    Ok(snapshot) => {
                        self.config_path = path;
                        self.apply_snapshot(snapshot);
                        1
                    }
                    Err(err) => {
                        // Keep the previous snapshot.
                        error!("config reload from {} failed: {err:#}", path.display());
                        0
                    }
                }
            }
        }
    }

    /// Swap in a new configuration snapshot between ticks, reconciling every
    /// engine with it.
    fn apply_snapshot(&mut self, snapshot: Arc<Snapshot>) {
        // Fixtures: drop removed, add new, refresh configs on survivors.
        for id in self.store.fixture_ids() {
            if snapshot.fixture(id).is_none() {
                self.store.unregister_fixture(id);
                self.dtw.unregister_fixture(id);
            }
        }
        for fixture in &snapshot.fixtures {
            self.store.register_fixture(fixture.clone());
            self.store.refresh_fixture_config(fixture.clone());
        }

        // Groups, preserving runtime circadian enablement across reloads.
        let preexisting: Vec<GroupId> = self.store.group_ids();
        let previously_enabled: Vec<GroupId> = preexisting
            .iter()
            .copied()
            .filter(|id| {
                self.store
                    .group(*id)
                    .map(|runtime| runtime.circadian_enabled)
                    .unwrap_or(false)
            })
            .collect();
        let known_groups: Vec<GroupId> = snapshot.groups.iter().map(|group| group.id).collect();
        for group in &preexisting {
            if !known_groups.contains(group) {
                self.store.unregister_group(*group);
            }
        }
        for group in &snapshot.groups {
            self.store.register_group(group.clone());
            self.store.refresh_group_config(group.clone());
        }

        // Memberships are owned by the config source: rebuild them.
        for fixture in self.store.fixture_ids() {
            let current: Vec<GroupId> = self.store.groups_of(fixture).collect();
            for group in current {
                self.store.remove_fixture_from_group(fixture, group);
            }
        }
        for group in &snapshot.groups {
            for member in &group.fixtures {
                self.store.add_fixture_to_group(*member, group.id);
            }
        }

        // Circadian assignments.
        self.circadian.clear();
        for profile in &snapshot.circadian_profiles {
            if let Err(err) = self.circadian.load_profile(profile) {
                warn!("circadian profile rejected: {err:#}");
            }
        }
        for group in &snapshot.groups {
            if let Some(profile) = group.circadian_profile_id {
                self.circadian.assign_group(group.id, profile);
                // Fresh groups start enabled; surviving groups keep their
                // runtime state.
                let enabled = if preexisting.contains(&group.id) {
                    previously_enabled.contains(&group.id)
                } else {
                    true
                };
                self.store.set_group_circadian_enabled(group.id, enabled);
            }
        }

        // Dim-to-warm registrations resolve group flags at load time.
        self.dtw.refresh(snapshot.settings.dtw.clone());
        for fixture in &snapshot.fixtures {
            self.dtw
                .register_fixture(fixture.id, dtw_config_for(fixture, &snapshot.groups));
        }

        // Switch handler and channel modes.
        let modes = self.switches.load(&snapshot.switches);
        let claimed: Vec<u8> = modes.iter().map(|(channel, _)| *channel).collect();
        self.hw.configure_channels(modes);
        self.discovery =
            SwitchDiscovery::new(&claimed, DISCOVERY_CHANGE_THRESHOLD, DISCOVERY_WINDOW);

        self.output.reset();
        self.snapshot = snapshot;
        self.apply_runtime_settings();
    }

    /// Push the current snapshot's runtime-mutable settings into every
    /// engine. Runs after a snapshot swap and again from the settings-watch
    /// scheduler job, so a settings change always lands within one watch
    /// interval of the tick that swapped it in.
    fn apply_runtime_settings(&mut self) {
        let settings = &self.snapshot.settings;
        self.store.set_transition_config(settings.transitions);
        self.switches.set_dim_speed_ms(settings.dim_speed_ms);
        self.switches.set_hold_threshold_ms(settings.hold_threshold_ms);
        self.switches
            .set_tap_window_ms(settings.effective_tap_window_ms());
        self.output.set_dedupe(
            settings.dmx_dedupe_enabled,
            Duration::from_millis(settings.dmx_dedupe_ttl_ms),
        );
        self.broadcaster
            .set_throttle_floor(Duration::from_millis(settings.broadcast_throttle_ms));
    }

    pub fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "fixtures": self.store.fixture_count(),
            "groups": self.store.group_count(),
            "switches": self.switches.switch_count(),
            "switch_events": self.switches.events_processed(),
            "scene_recalls": self.scenes.recalls(),
            "scene_captures": self.scenes.captures(),
            "circadian_profiles": self.circadian.profile_count(),
            "dtw_enabled": self.dtw.is_enabled(),
            "dtw_calculations": self.dtw.calculations(),
            "dmx_sends": self.output.sends(),
            "dmx_skips": self.output.skips(),
            "overrides_active": self.overrides.len(),
            "broadcast_events": self.broadcaster.events_published(),
            "store_dirty": self.store.is_dirty(),
            "hardware": self.hw.statistics(),
        })
    }
}

/// Resolve a fixture's dim-to-warm flags against its groups: any opt-out
/// wins, and range overrides prefer the fixture's own before the first
/// group's.
fn dtw_config_for(fixture: &FixtureConfig, groups: &[Arc<GroupConfig>]) -> FixtureDtwConfig {
    let member_groups: Vec<&Arc<GroupConfig>> = groups
        .iter()
        .filter(|group| group.fixtures.contains(&fixture.id))
        .collect();
    FixtureDtwConfig {
        ignore: fixture.dtw_ignore || member_groups.iter().any(|group| group.dtw_ignore),
        min_cct_override: fixture.dtw_cct_min_override.or_else(|| {
            member_groups
                .iter()
                .find_map(|group| group.dtw_cct_min_override)
        }),
        max_cct_override: fixture.dtw_cct_max_override.or_else(|| {
            member_groups
                .iter()
                .find_map(|group| group.dtw_cct_max_override)
        }),
    }
}
