//! Layered per-fixture resolution.
//!
//! Combines the interpolated fixture state with group multipliers, circadian
//! values, active overrides, and dim-to-warm into the final (brightness,
//! CCT) pair handed to the color mixer.

use std::time::Instant;

use number::UnipolarFloat;

use crate::config::FixtureId;
use crate::dtw::DtwEngine;
use crate::overrides::OverrideTable;
use crate::store::Store;

/// The composed output state for one fixture.
#[derive(Clone, Copy, Debug)]
pub struct Resolved {
    pub brightness: UnipolarFloat,
    /// None for fixtures without CCT support.
    pub cct: Option<u32>,
}

/// Resolve one fixture's final output.
///
/// Brightness is the fixture's interpolated value scaled by every containing
/// group's multiplier (and circadian multiplier where enabled). CCT follows
/// the priority ladder: active override, then group circadian, then a manual
/// pin, then dim-to-warm, then the default fallback chain.
pub fn resolve(
    store: &Store,
    overrides: &OverrideTable,
    dtw: &mut DtwEngine,
    id: FixtureId,
    now: Instant,
) -> Option<Resolved> {
    let fixture = store.fixture(id)?;
    let brightness = store.effective_brightness(id)?;

    if !fixture.config.supports_cct() {
        return Some(Resolved {
            brightness: UnipolarFloat::new(brightness),
            cct: None,
        });
    }

    let cct = if let Some(pinned) = overrides.fixture_cct(id, now) {
        pinned
    } else if let Some(circadian) = (!fixture.manual_cct_active && !fixture.override_active)
        .then(|| store.circadian_cct_for(id))
        .flatten()
    {
        circadian
    } else if fixture.manual_cct_active {
        fixture.current_cct
    } else if let Some(automatic) = dtw.cct_for(id, brightness) {
        automatic
    } else {
        fixture
            .config
            .default_cct_k
            .unwrap_or(dtw.settings().max_cct)
    };

    Some(Resolved {
        brightness: UnipolarFloat::new(brightness),
        cct: Some(cct.clamp(fixture.config.cct_min_k, fixture.config.cct_max_k)),
    })
}
