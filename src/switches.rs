//! Physical switch input state machines.
//!
//! Each tick reads the inputs for every registered switch and drives its
//! state machine: debounce, tap-versus-hold with dim-on-hold for retractive
//! switches, hysteresis and dimming curves for rotary potentiometers, and
//! double-tap scene recall.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use ordermap::OrderMap;

use crate::broadcast::{Broadcaster, Event};
use crate::config::{
    DimmingCurve, FixtureId, GroupId, Snapshot, SwitchConfig, SwitchId, SwitchModel, SwitchTarget,
};
use crate::hardware::{ANALOG_FULL_SCALE_VOLTS, ChannelMode, HardwareManager};
use crate::overrides::{OverrideProperty, OverrideSource, OverrideTable, OverrideTarget};
use crate::scenes::{SceneEngine, scene_by_id};
use crate::store::{Store, TransitionSpec};

/// Analog movement below this fraction of full scale is jitter, not input.
const ROTARY_HYSTERESIS: f64 = 0.01;

/// Short transition that smooths rotary encoder steps.
const ROTARY_SMOOTHING: Duration = Duration::from_millis(100);

/// A member above this brightness counts as "on" when judging group state.
const GROUP_ON_THRESHOLD: f64 = 0.01;

/// Everything a switch action may touch during one tick.
pub struct SwitchContext<'a> {
    pub store: &'a mut Store,
    pub hw: &'a mut HardwareManager,
    pub scenes: &'a mut SceneEngine,
    pub snapshot: &'a Snapshot,
    pub overrides: &'a mut OverrideTable,
    pub broadcaster: &'a Broadcaster,
}

/// Runtime state for one switch.
#[derive(Default)]
struct SwitchState {
    last_digital: Option<bool>,
    last_analog: Option<f64>,
    /// Time of the last accepted digital edge; edges inside the debounce
    /// window of this are discarded.
    last_change: Option<Instant>,
    press_start: Option<Instant>,
    is_pressed: bool,
    is_dimming: bool,
    /// +1 brightens, -1 dims.
    dim_direction: i8,
    dim_start_brightness: f64,
    was_on_at_press: bool,
    /// Time of a completed quick tap awaiting a possible second tap.
    pending_tap: Option<Instant>,
}

struct SwitchRuntime {
    config: Arc<SwitchConfig>,
    state: SwitchState,
}

#[derive(Copy, Clone)]
struct Timing {
    hold_threshold: Duration,
    dim_speed: Duration,
    tap_window: Duration,
}

/// Switch input processing engine.
pub struct SwitchHandler {
    switches: OrderMap<SwitchId, SwitchRuntime>,
    timing: Timing,
    events_processed: u64,
}

impl SwitchHandler {
    pub fn new(hold_threshold_ms: u64, dim_speed_ms: u64, tap_window_ms: u64) -> Self {
        Self {
            switches: OrderMap::new(),
            timing: Timing {
                hold_threshold: Duration::from_millis(hold_threshold_ms),
                dim_speed: Duration::from_millis(dim_speed_ms),
                tap_window: Duration::from_millis(tap_window_ms),
            },
            events_processed: 0,
        }
    }

    /// Load switch configurations, preserving runtime state for switches
    /// that survive a reload. Returns the channel modes the I/O device needs.
    pub fn load(&mut self, configs: &[Arc<SwitchConfig>]) -> Vec<(u8, ChannelMode)> {
        let mut previous = std::mem::take(&mut self.switches);
        let mut modes = Vec::new();
        for config in configs {
            let state = previous
                .remove(&config.id)
                .map(|runtime| runtime.state)
                .unwrap_or_default();
            if config.model.requires_digital_pin() {
                if let Some(channel) = config.digital_channel {
                    modes.push((channel, ChannelMode::DigitalIn));
                }
            }
            if config.model.requires_analog_pin() {
                if let Some(channel) = config.analog_channel {
                    modes.push((channel, ChannelMode::Analog));
                }
            }
            self.switches.insert(
                config.id,
                SwitchRuntime {
                    config: config.clone(),
                    state,
                },
            );
        }
        modes
    }

    pub fn switch_count(&self) -> usize {
        self.switches.len()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Hot-reload hook for the dim speed setting.
    pub fn set_dim_speed_ms(&mut self, dim_speed_ms: u64) {
        self.timing.dim_speed = Duration::from_millis(dim_speed_ms);
    }

    pub fn set_tap_window_ms(&mut self, tap_window_ms: u64) {
        self.timing.tap_window = Duration::from_millis(tap_window_ms);
    }

    pub fn set_hold_threshold_ms(&mut self, hold_threshold_ms: u64) {
        self.timing.hold_threshold = Duration::from_millis(hold_threshold_ms);
    }

    /// Read inputs for every switch and drive its state machine.
    pub fn process_inputs(&mut self, ctx: &mut SwitchContext, now: Instant) {
        let timing = self.timing;
        let mut events = 0;
        for runtime in self.switches.values_mut() {
            let config = runtime.config.clone();
            let state = &mut runtime.state;

            let digital = read_digital_input(&config, ctx, now);
            let analog = read_analog_input(&config, ctx);

            let handled = match config.model {
                SwitchModel::SwitchSimple => {
                    process_simple(&config, state, digital, ctx, now)
                }
                SwitchModel::Retractive => {
                    process_retractive(timing, &config, state, digital, ctx, now)
                }
                SwitchModel::RotaryAbs => process_rotary(&config, state, analog, ctx, now),
                SwitchModel::PaddleComposite => process_paddle(&config, state, digital),
            };
            if handled {
                events += 1;
            }
        }
        self.events_processed += events;
    }
}

fn read_digital_input(
    config: &SwitchConfig,
    ctx: &mut SwitchContext,
    _now: Instant,
) -> Option<bool> {
    if !config.model.requires_digital_pin() {
        return None;
    }
    let channel = config.digital_channel?;
    let value = ctx.hw.read_digital(channel)?;
    Some(value != config.invert_reading)
}

fn read_analog_input(config: &SwitchConfig, ctx: &mut SwitchContext) -> Option<f64> {
    if !config.model.requires_analog_pin() {
        return None;
    }
    let channel = config.analog_channel?;
    let volts = ctx.hw.read_analog(channel)?;
    let normalized = (volts / ANALOG_FULL_SCALE_VOLTS).clamp(0.0, 1.0);
    Some(if config.invert_reading {
        1.0 - normalized
    } else {
        normalized
    })
}

/// True if this edge arrived inside the debounce window of the previous
/// accepted change.
fn debounced(state: &SwitchState, config: &SwitchConfig, now: Instant) -> bool {
    state
        .last_change
        .map(|last| now.duration_since(last) < Duration::from_millis(config.debounce_ms))
        .unwrap_or(false)
}

fn process_simple(
    config: &SwitchConfig,
    state: &mut SwitchState,
    digital: Option<bool>,
    ctx: &mut SwitchContext,
    now: Instant,
) -> bool {
    let Some(value) = digital else {
        return false;
    };
    if state.last_digital == Some(value) {
        return false;
    }
    if debounced(state, config, now) {
        return false;
    }
    state.last_digital = Some(value);
    state.last_change = Some(now);

    let Ok(target) = config.target() else {
        return false;
    };
    match target {
        SwitchTarget::Fixture(fixture) => {
            let brightness = if value { 1.0 } else { 0.0 };
            ctx.store.set_fixture_brightness(
                fixture,
                brightness,
                TransitionSpec::proportional(),
                now,
            );
            debug!(
                "switch {} set fixture {fixture} {}",
                config.id,
                if value { "on" } else { "off" }
            );
            broadcast_fixture(ctx, fixture);
        }
        SwitchTarget::Group(group) => {
            if value {
                apply_group_defaults(config, group, ctx, now);
            } else {
                ctx.store
                    .set_group_brightness(group, 0.0, TransitionSpec::proportional(), now);
            }
            broadcast_group(ctx, group);
        }
    }
    true
}

fn process_retractive(
    timing: Timing,
    config: &SwitchConfig,
    state: &mut SwitchState,
    digital: Option<bool>,
    ctx: &mut SwitchContext,
    now: Instant,
) -> bool {
    let Some(value) = digital else {
        return false;
    };

    // First read captures the resting state silently.
    if state.last_digital.is_none() {
        state.last_digital = Some(value);
        debug!("switch {} initialized at {value}", config.id);
        return false;
    }

    if state.last_digital == Some(value) {
        // No edge. While pressed past the hold threshold, dim continuously.
        if state.is_pressed {
            if let Some(press_start) = state.press_start {
                if now.duration_since(press_start) >= timing.hold_threshold {
                    handle_hold(timing, config, state, ctx, now);
                    return true;
                }
            }
        }
        return false;
    }

    if debounced(state, config, now) {
        return false;
    }
    state.last_digital = Some(value);
    state.last_change = Some(now);

    if value {
        state.is_pressed = true;
        state.press_start = Some(now);
        state.is_dimming = false;
        handle_press(config, state, ctx);
    } else {
        state.is_pressed = false;
        handle_release(timing, config, state, ctx, now);
        state.is_dimming = false;
        state.press_start = None;
    }
    true
}

/// Record the target's state at press time; toggling waits for release.
fn handle_press(config: &SwitchConfig, state: &mut SwitchState, ctx: &mut SwitchContext) {
    let current = target_brightness(config, ctx);
    state.was_on_at_press = current > 0.0;
    state.dim_start_brightness = current;
    state.dim_direction = if state.was_on_at_press { -1 } else { 1 };
    debug!(
        "switch {} pressed (was {}, dim {})",
        config.id,
        if state.was_on_at_press { "on" } else { "off" },
        if state.dim_direction > 0 { "up" } else { "down" },
    );
}

fn handle_hold(
    timing: Timing,
    config: &SwitchConfig,
    state: &mut SwitchState,
    ctx: &mut SwitchContext,
    now: Instant,
) {
    if !state.is_dimming {
        state.is_dimming = true;
        // A dim session cancels any pending double tap.
        state.pending_tap = None;
        // Re-anchor on the brightness at the moment dimming starts.
        state.dim_start_brightness = target_brightness(config, ctx);
        debug!(
            "switch {} dimming {} from {:.3}",
            config.id,
            if state.dim_direction > 0 { "up" } else { "down" },
            state.dim_start_brightness,
        );
    }

    let Some(press_start) = state.press_start else {
        return;
    };
    let held = now
        .duration_since(press_start)
        .saturating_sub(timing.hold_threshold);
    let change = if timing.dim_speed.is_zero() {
        1.0
    } else {
        held.as_secs_f64() / timing.dim_speed.as_secs_f64()
    };

    // Dimming up from off sweeps from zero; dimming down walks back from
    // where the press found us.
    let new_brightness = if state.dim_direction > 0 {
        change.min(1.0)
    } else {
        (state.dim_start_brightness - change).max(0.0)
    };

    let Ok(target) = config.target() else {
        return;
    };
    match target {
        SwitchTarget::Fixture(fixture) => {
            ctx.store
                .set_fixture_brightness(fixture, new_brightness, TransitionSpec::INSTANT, now);
            broadcast_fixture_throttled(ctx, fixture, now);
        }
        SwitchTarget::Group(group) => {
            ctx.store
                .set_group_brightness(group, new_brightness, TransitionSpec::INSTANT, now);
            broadcast_group_throttled(ctx, group, now);
        }
    }
}

fn handle_release(
    timing: Timing,
    config: &SwitchConfig,
    state: &mut SwitchState,
    ctx: &mut SwitchContext,
    now: Instant,
) {
    if state.is_dimming {
        // Brightness already landed during the hold; report where it ended.
        debug!("switch {} dim stopped", config.id);
        match config.target() {
            Ok(SwitchTarget::Fixture(fixture)) => broadcast_fixture(ctx, fixture),
            Ok(SwitchTarget::Group(group)) => broadcast_group(ctx, group),
            Err(_) => {}
        }
        return;
    }

    // Quick tap. A second tap inside the window recalls the bound scene
    // instead of toggling again.
    if let Some(scene_id) = config.double_tap_scene_id {
        if let Some(previous_tap) = state.pending_tap {
            if now.duration_since(previous_tap) <= timing.tap_window {
                state.pending_tap = None;
                if let Some(scene) = scene_by_id(&ctx.snapshot.scenes, scene_id) {
                    let scene = scene.clone();
                    debug!("switch {} double tap recalls scene {scene_id}", config.id);
                    ctx.scenes.recall(&scene, ctx.store, ctx.broadcaster, now);
                }
                return;
            }
        }
        state.pending_tap = Some(now);
    }

    let Ok(target) = config.target() else {
        return;
    };
    match target {
        SwitchTarget::Fixture(fixture) => {
            let is_on = ctx
                .store
                .fixture(fixture)
                .map(|runtime| runtime.current_brightness > 0.0)
                .unwrap_or(false);
            let new_brightness = if is_on { 0.0 } else { 1.0 };
            ctx.store
                .set_fixture_brightness(fixture, new_brightness, TransitionSpec::INSTANT, now);
            debug!(
                "switch {} toggled fixture {fixture} to {new_brightness}",
                config.id
            );
            broadcast_fixture(ctx, fixture);
        }
        SwitchTarget::Group(group) => {
            if group_is_on(ctx.store, group) {
                ctx.store
                    .set_group_brightness(group, 0.0, TransitionSpec::INSTANT, now);
                debug!("switch {} toggled group {group} off", config.id);
            } else {
                apply_group_defaults(config, group, ctx, now);
                debug!("switch {} toggled group {group} on", config.id);
            }
            broadcast_group(ctx, group);
        }
    }
}

fn process_rotary(
    config: &SwitchConfig,
    state: &mut SwitchState,
    analog: Option<f64>,
    ctx: &mut SwitchContext,
    now: Instant,
) -> bool {
    let Some(position) = analog else {
        return false;
    };
    if let Some(last) = state.last_analog {
        if (position - last).abs() < ROTARY_HYSTERESIS {
            return false;
        }
    }
    state.last_analog = Some(position);
    state.last_change = Some(now);

    let brightness = match config.dimming_curve {
        DimmingCurve::Linear => position,
        DimmingCurve::Logarithmic => position * position,
    };

    let spec = TransitionSpec::over(ROTARY_SMOOTHING);
    let Ok(target) = config.target() else {
        return false;
    };
    match target {
        SwitchTarget::Fixture(fixture) => {
            ctx.store
                .set_fixture_brightness(fixture, brightness, spec, now);
            broadcast_fixture_throttled(ctx, fixture, now);
        }
        SwitchTarget::Group(group) => {
            ctx.store.set_group_brightness(group, brightness, spec, now);
            broadcast_group_throttled(ctx, group, now);
        }
    }
    true
}

/// Multi-button paddles have a configuration slot but no behavior yet.
fn process_paddle(
    _config: &SwitchConfig,
    state: &mut SwitchState,
    digital: Option<bool>,
) -> bool {
    // Track the raw reading so a future implementation starts from a sane
    // edge, but take no action.
    if let Some(value) = digital {
        state.last_digital = Some(value);
    }
    false
}

/// The brightness the switch's target currently shows. For groups, the first
/// member that is meaningfully on speaks for the group.
fn target_brightness(config: &SwitchConfig, ctx: &SwitchContext) -> f64 {
    match config.target() {
        Ok(SwitchTarget::Fixture(fixture)) => ctx
            .store
            .fixture(fixture)
            .map(|runtime| runtime.current_brightness)
            .unwrap_or(0.0),
        Ok(SwitchTarget::Group(group)) => ctx
            .store
            .members_of(group)
            .into_iter()
            .filter_map(|member| ctx.store.fixture(member))
            .map(|runtime| runtime.current_brightness)
            .find(|brightness| *brightness > GROUP_ON_THRESHOLD)
            .unwrap_or(0.0),
        Err(_) => 0.0,
    }
}

fn group_is_on(store: &Store, group: GroupId) -> bool {
    store
        .members_of(group)
        .into_iter()
        .filter_map(|member| store.fixture(member))
        .any(|runtime| runtime.current_brightness > GROUP_ON_THRESHOLD)
}

/// Drive a group to its configured default brightness and, if set, default
/// CCT. The CCT lands as a manual pin with a TTL'd override so circadian and
/// dim-to-warm stand aside for a while.
fn apply_group_defaults(
    config: &SwitchConfig,
    group: GroupId,
    ctx: &mut SwitchContext,
    now: Instant,
) {
    let (brightness, cct) = ctx
        .snapshot
        .group(group)
        .map(|group_config| (group_config.default_brightness, group_config.default_cct_k))
        .unwrap_or((1.0, None));

    ctx.store
        .set_group_brightness(group, brightness, TransitionSpec::proportional(), now);

    if let Some(cct) = cct {
        ctx.store
            .set_group_cct(group, cct, TransitionSpec::proportional(), now);
        let ttl = Duration::from_secs(ctx.snapshot.settings.dtw.override_ttl_seconds);
        for member in ctx.store.members_of(group) {
            ctx.overrides.set(
                OverrideTarget::Fixture(member),
                OverrideProperty::ColorTemp,
                cct as f64,
                ttl,
                OverrideSource::Switch,
                now,
            );
            ctx.store.set_override_active(member, true);
        }
    }
    debug!("switch {} applied group {group} defaults", config.id);
}

fn broadcast_fixture(ctx: &mut SwitchContext, fixture: FixtureId) {
    if let Some(runtime) = ctx.store.fixture(fixture) {
        ctx.broadcaster.publish(Event::FixtureStateChanged {
            fixture_id: fixture,
            brightness: runtime.goal_brightness,
            color_temp: runtime.config.supports_cct().then_some(runtime.goal_cct),
        });
    }
}

fn broadcast_fixture_throttled(ctx: &mut SwitchContext, fixture: FixtureId, now: Instant) {
    if let Some(runtime) = ctx.store.fixture(fixture) {
        ctx.broadcaster.publish_throttled(
            Event::FixtureStateChanged {
                fixture_id: fixture,
                brightness: runtime.goal_brightness,
                color_temp: runtime.config.supports_cct().then_some(runtime.goal_cct),
            },
            now,
        );
    }
}

fn broadcast_group(ctx: &mut SwitchContext, group: GroupId) {
    if let Some(runtime) = ctx.store.group(group) {
        ctx.broadcaster.publish(Event::GroupStateChanged {
            group_id: group,
            brightness: runtime.brightness_multiplier,
            color_temp: runtime.circadian_enabled.then_some(runtime.circadian_cct).flatten(),
        });
    }
    for member in ctx.store.members_of(group) {
        broadcast_fixture(ctx, member);
    }
}

fn broadcast_group_throttled(ctx: &mut SwitchContext, group: GroupId, now: Instant) {
    if let Some(runtime) = ctx.store.group(group) {
        ctx.broadcaster.publish_throttled(
            Event::GroupStateChanged {
                group_id: group,
                brightness: runtime.brightness_multiplier,
                color_temp: runtime.circadian_enabled.then_some(runtime.circadian_cct).flatten(),
            },
            now,
        );
    }
    for member in ctx.store.members_of(group) {
        broadcast_fixture_throttled(ctx, member, now);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::broadcast::EventKind;
    use crate::config::{FixtureConfig, FixtureKind, GroupConfig, SceneConfig, SceneId, SceneValue};
    use crate::dmx::DmxAddr;
    use crate::hardware::{Dmx, Io, IoDevice, MockDmx, MockIo};
    use crate::transitions::TransitionConfig;

    const DIGITAL_CHANNEL: u8 = 3;
    const ANALOG_CHANNEL: u8 = 0;

    fn fixture_config(id: u32) -> Arc<FixtureConfig> {
        Arc::new(FixtureConfig {
            id: FixtureId(id),
            name: None,
            universe: 0,
            channel: DmxAddr::from(id as usize * 2 + 1),
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

    fn switch_config(model: SwitchModel) -> Arc<SwitchConfig> {
        Arc::new(SwitchConfig {
            id: SwitchId(1),
            name: None,
            model,
            debounce_ms: 50,
            dimming_curve: DimmingCurve::Linear,
            digital_channel: Some(DIGITAL_CHANNEL),
            analog_channel: Some(ANALOG_CHANNEL),
            target_fixture_id: Some(FixtureId(1)),
            target_group_id: None,
            double_tap_scene_id: None,
            invert_reading: false,
        })
    }

    struct Rig {
        handler: SwitchHandler,
        store: Store,
        hw: HardwareManager,
        scenes: SceneEngine,
        snapshot: Snapshot,
        overrides: OverrideTable,
        broadcaster: Broadcaster,
    }

    impl Rig {
        fn new(config: Arc<SwitchConfig>) -> Self {
            let mut store = Store::new(TransitionConfig::default());
            store.register_fixture(fixture_config(1));
            let mut hw =
                HardwareManager::new(Io::Mock(MockIo::new()), Dmx::Mock(MockDmx::new()));
            hw.initialize();
            let mut handler = SwitchHandler::new(1000, 2000, 500);
            let modes = handler.load(&[config]);
            hw.configure_channels(modes);
            Rig {
                handler,
                store,
                hw,
                scenes: SceneEngine::new(),
                snapshot: Snapshot::default(),
                overrides: OverrideTable::new(),
                broadcaster: Broadcaster::new(Duration::from_millis(100)),
            }
        }

        fn set_digital(&mut self, state: bool) {
            let Io::Mock(mock) = &mut self.hw.io else {
                panic!("expected mock IO");
            };
            mock.simulate_digital(DIGITAL_CHANNEL, state);
        }

        fn set_analog_volts(&mut self, volts: f64) {
            let Io::Mock(mock) = &mut self.hw.io else {
                panic!("expected mock IO");
            };
            mock.simulate_analog(ANALOG_CHANNEL, volts);
        }

        fn process(&mut self, now: Instant) {
            let mut ctx = SwitchContext {
                store: &mut self.store,
                hw: &mut self.hw,
                scenes: &mut self.scenes,
                snapshot: &self.snapshot,
                overrides: &mut self.overrides,
                broadcaster: &self.broadcaster,
            };
            self.handler.process_inputs(&mut ctx, now);
        }

        fn brightness(&self) -> f64 {
            self.store.fixture(FixtureId(1)).unwrap().goal_brightness
        }
    }

    #[test]
    fn test_tap_toggles_fixture() {
        // A retractive switch on digital channel 3, debounce 50 ms. Inject
        // LOW at t=0, HIGH at t=10ms, LOW at t=80ms: one quick tap.
        let mut rig = Rig::new(switch_config(SwitchModel::Retractive));
        let subscription = rig.broadcaster.subscribe(None);
        let _welcome = subscription.receiver.try_recv().unwrap();
        let t0 = Instant::now();

        rig.set_digital(false);
        rig.process(t0);
        rig.set_digital(true);
        rig.process(t0 + Duration::from_millis(10));
        assert_eq!(0.0, rig.brightness());

        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(80));
        assert_eq!(1.0, rig.brightness());
        assert!(!rig.handler.switches[&SwitchId(1)].state.is_dimming);

        let events: Vec<EventKind> = subscription
            .receiver
            .try_iter()
            .map(|envelope| envelope.event.kind())
            .collect();
        assert_eq!(vec![EventKind::FixtureStateChanged], events);
    }

    #[test]
    fn test_tap_toggles_off_when_on() {
        let mut rig = Rig::new(switch_config(SwitchModel::Retractive));
        let t0 = Instant::now();
        rig.store
            .set_fixture_brightness(FixtureId(1), 0.7, TransitionSpec::INSTANT, t0);

        rig.set_digital(false);
        rig.process(t0);
        rig.set_digital(true);
        rig.process(t0 + Duration::from_millis(100));
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(200));
        assert_eq!(0.0, rig.brightness());
    }

    #[test]
    fn test_hold_dims_up_from_off() {
        // Held from t=0 with dim_speed 2000 ms and hold threshold 1 s:
        // brightness reaches 0.25 at t=1.5s and 1.0 at t=3s.
        let mut rig = Rig::new(switch_config(SwitchModel::Retractive));
        let t0 = Instant::now();

        rig.set_digital(false);
        rig.process(t0 - Duration::from_millis(100));
        rig.set_digital(true);
        rig.process(t0);

        rig.process(t0 + Duration::from_millis(1500));
        assert!((rig.brightness() - 0.25).abs() < 1e-9);

        rig.process(t0 + Duration::from_secs(3));
        assert!((rig.brightness() - 1.0).abs() < 1e-9);

        // Release: no toggle, brightness stays where the dim left it.
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(3010));
        assert_eq!(1.0, rig.brightness());
    }

    #[test]
    fn test_hold_dims_down_from_on() {
        let mut rig = Rig::new(switch_config(SwitchModel::Retractive));
        let t0 = Instant::now();
        rig.store
            .set_fixture_brightness(FixtureId(1), 0.8, TransitionSpec::INSTANT, t0);

        rig.set_digital(false);
        rig.process(t0 - Duration::from_millis(100));
        rig.set_digital(true);
        rig.process(t0);

        // 1 s past the threshold at dim_speed 2000 ms takes off 0.5.
        rig.process(t0 + Duration::from_secs(2));
        assert!((rig.brightness() - 0.3).abs() < 1e-9);

        // Clamps at zero rather than wrapping.
        rig.process(t0 + Duration::from_secs(5));
        assert_eq!(0.0, rig.brightness());
    }

    #[test]
    fn test_debounce_discards_fast_edges() {
        let mut rig = Rig::new(switch_config(SwitchModel::Retractive));
        let t0 = Instant::now();

        rig.set_digital(false);
        rig.process(t0);
        rig.set_digital(true);
        rig.process(t0 + Duration::from_millis(10));
        // Contact bounce 20 ms later is discarded; the press stands.
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(30));
        assert!(rig.handler.switches[&SwitchId(1)].state.is_pressed);
    }

    #[test]
    fn test_double_tap_recalls_scene() {
        let mut config = (*switch_config(SwitchModel::Retractive)).clone();
        config.double_tap_scene_id = Some(SceneId(5));
        let mut rig = Rig::new(Arc::new(config));
        rig.snapshot.scenes = vec![Arc::new(SceneConfig {
            id: SceneId(5),
            name: Some("movie".into()),
            scope_group_id: None,
            values: vec![SceneValue {
                fixture_id: FixtureId(1),
                brightness: Some(300),
                cct_k: None,
            }],
        })];
        let t0 = Instant::now();

        rig.set_digital(false);
        rig.process(t0);
        // First tap toggles on.
        rig.set_digital(true);
        rig.process(t0 + Duration::from_millis(10));
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(80));
        assert_eq!(1.0, rig.brightness());
        // Second tap inside the window recalls the scene instead of
        // toggling off.
        rig.set_digital(true);
        rig.process(t0 + Duration::from_millis(200));
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(280));
        assert_eq!(0.3, rig.brightness());
        assert_eq!(1, rig.scenes.recalls());
    }

    #[test]
    fn test_slow_second_tap_just_toggles() {
        let mut config = (*switch_config(SwitchModel::Retractive)).clone();
        config.double_tap_scene_id = Some(SceneId(5));
        let mut rig = Rig::new(Arc::new(config));
        let t0 = Instant::now();

        rig.set_digital(false);
        rig.process(t0);
        rig.set_digital(true);
        rig.process(t0 + Duration::from_millis(10));
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(80));
        // Outside the 500 ms window: a plain toggle, no recall.
        rig.set_digital(true);
        rig.process(t0 + Duration::from_millis(700));
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(780));
        assert_eq!(0.0, rig.brightness());
        assert_eq!(0, rig.scenes.recalls());
    }

    #[test]
    fn test_rotary_applies_curve_and_hysteresis() {
        let mut config = (*switch_config(SwitchModel::RotaryAbs)).clone();
        config.dimming_curve = DimmingCurve::Logarithmic;
        let mut rig = Rig::new(Arc::new(config));
        let t0 = Instant::now();

        // 1.2 V of 2.4 V full scale is position 0.5; squared for the curve.
        rig.set_analog_volts(1.2);
        rig.process(t0);
        assert!((rig.brightness() - 0.25).abs() < 1e-9);

        // Sub-1% jitter is ignored.
        rig.set_analog_volts(1.2 + 0.004 * 2.4);
        rig.process(t0 + Duration::from_millis(50));
        assert!((rig.brightness() - 0.25).abs() < 1e-9);

        // A real turn moves the setpoint.
        rig.set_analog_volts(2.4);
        rig.process(t0 + Duration::from_millis(100));
        assert_eq!(1.0, rig.brightness());
    }

    #[test]
    fn test_simple_switch_follows_level() {
        let mut rig = Rig::new(switch_config(SwitchModel::SwitchSimple));
        let t0 = Instant::now();

        rig.set_digital(true);
        rig.process(t0);
        assert_eq!(1.0, rig.brightness());

        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(100));
        assert_eq!(0.0, rig.brightness());
    }

    #[test]
    fn test_inverted_reading() {
        let mut config = (*switch_config(SwitchModel::SwitchSimple)).clone();
        config.invert_reading = true;
        let mut rig = Rig::new(Arc::new(config));
        let t0 = Instant::now();

        // Inverted: LOW reads as pressed.
        rig.set_digital(false);
        rig.process(t0);
        assert_eq!(1.0, rig.brightness());
    }

    #[test]
    fn test_group_tap_applies_defaults() {
        let mut config = (*switch_config(SwitchModel::Retractive)).clone();
        config.target_fixture_id = None;
        config.target_group_id = Some(GroupId(1));
        let mut rig = Rig::new(Arc::new(config));
        let group = Arc::new(GroupConfig {
            id: GroupId(1),
            name: None,
            circadian_profile_id: None,
            default_brightness: 0.8,
            default_cct_k: Some(3000),
            dtw_ignore: false,
            dtw_cct_min_override: None,
            dtw_cct_max_override: None,
            sleep_lock: None,
            fixtures: vec![FixtureId(1)],
        });
        rig.snapshot.groups = vec![group.clone()];
        rig.store.register_group(group);
        rig.store.add_fixture_to_group(FixtureId(1), GroupId(1));
        let t0 = Instant::now();

        rig.set_digital(false);
        rig.process(t0);
        rig.set_digital(true);
        rig.process(t0 + Duration::from_millis(10));
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(80));

        let fixture = rig.store.fixture(FixtureId(1)).unwrap();
        assert_eq!(0.8, fixture.goal_brightness);
        assert_eq!(3000, fixture.goal_cct);
        assert!(fixture.manual_cct_active);
        // The manual CCT landed as a TTL'd override.
        assert_eq!(
            Some(3000),
            rig.overrides
                .fixture_cct(FixtureId(1), t0 + Duration::from_millis(80))
        );
    }

    #[test]
    fn test_hold_broadcasts_are_throttled() {
        let mut rig = Rig::new(switch_config(SwitchModel::Retractive));
        let subscription = rig.broadcaster.subscribe(None);
        let _welcome = subscription.receiver.try_recv().unwrap();
        let t0 = Instant::now();

        rig.set_digital(false);
        rig.process(t0 - Duration::from_millis(100));
        rig.set_digital(true);
        rig.process(t0);

        // Simulate 30 Hz ticks across half a second of dimming; the 100 ms
        // throttle floor caps the event rate well below the tick rate.
        let mut tick = Duration::from_millis(1500);
        while tick < Duration::from_millis(2000) {
            rig.process(t0 + tick);
            tick += Duration::from_millis(33);
        }
        let events: Vec<EventKind> = subscription
            .receiver
            .try_iter()
            .map(|envelope| envelope.event.kind())
            .collect();
        assert!(
            events.len() <= 6,
            "expected throttled stream, got {} events",
            events.len()
        );
        assert!(!events.is_empty());
        assert!(events.iter().all(|kind| *kind == EventKind::FixtureStateChanged));
    }

    #[test]
    fn test_release_after_dim_broadcasts_final_state() {
        let mut rig = Rig::new(switch_config(SwitchModel::Retractive));
        let t0 = Instant::now();

        rig.set_digital(false);
        rig.process(t0 - Duration::from_millis(100));
        rig.set_digital(true);
        rig.process(t0);
        rig.process(t0 + Duration::from_millis(1500));

        let subscription = rig.broadcaster.subscribe(None);
        let _welcome = subscription.receiver.try_recv().unwrap();
        rig.set_digital(false);
        rig.process(t0 + Duration::from_millis(1510));

        // The release after a dim session reports where brightness landed,
        // unthrottled, and does not toggle.
        let envelope = subscription.receiver.try_recv().unwrap();
        match envelope.event {
            Event::FixtureStateChanged { brightness, .. } => {
                assert!((brightness - 0.255).abs() < 0.01);
            }
            _ => panic!("unexpected event"),
        }
        assert!((rig.brightness() - 0.255).abs() < 0.01);
    }

    #[test]
    fn test_no_input_when_hardware_down() {
        let mut rig = Rig::new(switch_config(SwitchModel::Retractive));
        rig.hw.io.disconnect();
        let t0 = Instant::now();
        rig.set_digital(true);
        rig.process(t0);
        // Unreadable inputs leave state untouched.
        assert_eq!(0.0, rig.brightness());
        assert_eq!(0, rig.handler.events_processed());
    }
}
