//! Two-channel white-point mixing along the Planckian locus.
//!
//! Converts a (CCT, brightness) target into integer PWM duties for the warm
//! and cool emitters of a tunable white fixture, compensating for luminous
//! flux so brightness stays perceptually constant across the CCT range.

use anyhow::{Result, bail};
use number::UnipolarFloat;

/// CIE 1931 xy chromaticity on the Planckian locus for a color temperature.
///
/// Piecewise polynomial approximation with the 4000 K breakpoint for x and
/// breakpoints at 2222 K and 4000 K for y. Accurate for 1667 K to 25000 K;
/// values outside that range extrapolate.
pub fn planckian_xy(temp_kelvin: f64) -> Result<(f64, f64)> {
    if temp_kelvin <= 0.0 {
        bail!("temperature must be positive, got {temp_kelvin}K");
    }
    let t = temp_kelvin;

    let x = if t < 4000.0 {
        -0.2661239e9 / (t * t * t) - 0.2343589e6 / (t * t) + 0.8776956e3 / t + 0.179910
    } else {
        -3.0258469e9 / (t * t * t) + 2.1070379e6 / (t * t) + 0.2226347e3 / t + 0.240390
    };

    let y = if t < 2222.0 {
        -1.1063814 * x * x * x - 1.34811020 * x * x + 2.18555832 * x - 0.20219683
    } else if t < 4000.0 {
        -0.9549476 * x * x * x - 1.37418593 * x * x + 2.09137015 * x - 0.16748867
    } else {
        3.0817580 * x * x * x - 5.87338670 * x * x + 3.75112997 * x - 0.37001483
    };

    Ok((x, y))
}

/// Convert CIE 1931 xy to CIE 1960 uv.
///
/// Duv must be computed in the CIE 1960 uniform chromaticity scale.
pub fn xy_to_uv(x: f64, y: f64) -> (f64, f64) {
    let denom = -2.0 * x + 12.0 * y + 3.0;
    if denom.abs() < 1e-9 {
        return (0.0, 0.0);
    }
    (4.0 * x / denom, 6.0 * y / denom)
}

/// CCT from CIE 1931 xy via McCamy's approximation, clamped to
/// [1000, 25000] K.
pub fn xy_to_cct(x: f64, y: f64) -> u32 {
    let n = if (0.1858 - y).abs() > 1e-9 {
        (x - 0.3320) / (0.1858 - y)
    } else {
        0.0
    };
    let cct = 449.0 * n * n * n + 3525.0 * n * n + 6823.3 * n + 5520.33;
    (cct.round() as i64).clamp(1000, 25000) as u32
}

/// Signed distance of a chromaticity from the Planckian locus at its CCT.
/// Positive is above the locus (greenish), negative below (pinkish).
pub fn duv(achieved_xy: (f64, f64), achieved_cct: u32) -> Result<f64> {
    let planck = planckian_xy(achieved_cct as f64)?;
    let achieved_uv = xy_to_uv(achieved_xy.0, achieved_xy.1);
    let planck_uv = xy_to_uv(planck.0, planck.1);
    let du = achieved_uv.0 - planck_uv.0;
    let dv = achieved_uv.1 - planck_uv.1;
    let distance = (du * du + dv * dv).sqrt();
    Ok(if achieved_uv.1 > planck_uv.1 {
        distance
    } else {
        -distance
    })
}

/// Parameters for the full mixing algorithm.
#[derive(Clone, Copy, Debug)]
pub struct MixParams {
    /// CCT of the warm emitter.
    pub warm_cct: u32,
    /// CCT of the cool emitter.
    pub cool_cct: u32,
    /// Measured CIE 1931 chromaticity of the warm emitter.
    pub warm_xy: (f64, f64),
    /// Measured CIE 1931 chromaticity of the cool emitter.
    pub cool_xy: (f64, f64),
    /// Luminous flux of the warm channel at 100%.
    pub warm_lumens: f64,
    /// Luminous flux of the cool channel at 100%.
    pub cool_lumens: f64,
    /// Maximum PWM value (255 for 8-bit DMX).
    pub pwm_resolution: u16,
    /// Minimum nonzero duty for drivers with a turn-on threshold.
    pub min_duty: u16,
    /// PWM-to-light gamma.
    pub gamma: f64,
}

impl MixParams {
    /// Params with derived chromaticity: both emitters assumed to sit
    /// exactly on the blackbody curve at their rated CCT.
    pub fn from_lumens(
        warm_cct: u32,
        cool_cct: u32,
        warm_lumens: f64,
        cool_lumens: f64,
        pwm_resolution: u16,
        min_duty: u16,
        gamma: f64,
    ) -> Result<Self> {
        Ok(Self {
            warm_cct,
            cool_cct,
            warm_xy: planckian_xy(warm_cct as f64)?,
            cool_xy: planckian_xy(cool_cct as f64)?,
            warm_lumens,
            cool_lumens,
            pwm_resolution,
            min_duty,
            gamma,
        })
    }
}

/// Result of a mixing calculation, including the color actually realized by
/// the quantized duties.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MixResult {
    pub warm_duty: u16,
    pub cool_duty: u16,
    /// CCT realized by the quantized duties; differs at range limits.
    pub achieved_cct: u32,
    pub achieved_duv: f64,
    pub achieved_brightness: f64,
}

/// Mix result from the derived-chromaticity fallback, carrying the Duv
/// uncertainty introduced by assuming on-locus emitters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DerivedMixResult {
    pub mix: MixResult,
    /// Estimated +/- error on achieved_duv from LED binning tolerance.
    pub duv_uncertainty: f64,
}

/// Mixing ratio alpha such that target = alpha * cool + (1 - alpha) * warm.
fn mix_ratio(target_xy: (f64, f64), warm_xy: (f64, f64), cool_xy: (f64, f64)) -> f64 {
    let dx = cool_xy.0 - warm_xy.0;
    let alpha = if dx.abs() < 1e-9 {
        let dy = cool_xy.1 - warm_xy.1;
        if dy.abs() < 1e-9 {
            // Emitters too similar to distinguish.
            return 0.5;
        }
        (target_xy.1 - warm_xy.1) / dy
    } else {
        (target_xy.0 - warm_xy.0) / dx
    };
    alpha.clamp(0.0, 1.0)
}

/// Full Planckian locus mixing with measured chromaticity.
///
/// Flux compensation keeps total luminous output constant across the CCT
/// range: each channel's linear drive is scaled by the ratio of total to
/// per-channel lumens before inverse gamma and quantization.
pub fn mix(target_cct: u32, target_brightness: UnipolarFloat, params: &MixParams) -> Result<MixResult> {
    let brightness = target_brightness.val();
    if brightness <= 0.0 {
        return Ok(MixResult {
            warm_duty: 0,
            cool_duty: 0,
            achieved_cct: target_cct,
            achieved_duv: 0.0,
            achieved_brightness: 0.0,
        });
    }

    let effective_cct = target_cct.clamp(params.warm_cct, params.cool_cct);
    let target_xy = planckian_xy(effective_cct as f64)?;
    let alpha = mix_ratio(target_xy, params.warm_xy, params.cool_xy);

    // For constant brightness we need warm_flux + cool_flux to equal
    // brightness * total_lumens, with the split determined by alpha. Each
    // channel clamps independently; flux compensation can demand more than
    // 100% of one channel near the range limits, and a saturated channel
    // simply caps there.
    let total_lumens = params.warm_lumens + params.cool_lumens;
    let warm_linear = if params.warm_lumens > 0.0 {
        ((1.0 - alpha) * brightness * total_lumens / params.warm_lumens).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let cool_linear = if params.cool_lumens > 0.0 {
        (alpha * brightness * total_lumens / params.cool_lumens).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let resolution = params.pwm_resolution as f64;
    let gamma_inv = 1.0 / params.gamma;
    let mut warm_duty = (apply_inverse_gamma(warm_linear, gamma_inv) * resolution).round() as u16;
    let mut cool_duty = (apply_inverse_gamma(cool_linear, gamma_inv) * resolution).round() as u16;

    if warm_duty > 0 && warm_duty < params.min_duty {
        warm_duty = params.min_duty;
    }
    if cool_duty > 0 && cool_duty < params.min_duty {
        cool_duty = params.min_duty;
    }
    warm_duty = warm_duty.min(params.pwm_resolution);
    cool_duty = cool_duty.min(params.pwm_resolution);

    // Re-mix the realized fluxes to verify what the quantized duties produce.
    let warm_flux = if warm_duty > 0 {
        params.warm_lumens * (warm_duty as f64 / resolution).powf(params.gamma)
    } else {
        0.0
    };
    let cool_flux = if cool_duty > 0 {
        params.cool_lumens * (cool_duty as f64 / resolution).powf(params.gamma)
    } else {
        0.0
    };
    let total_flux = warm_flux + cool_flux;

    let (achieved_cct, achieved_duv, achieved_brightness) = if total_flux > 0.0 {
        let x = (params.warm_xy.0 * warm_flux + params.cool_xy.0 * cool_flux) / total_flux;
        let y = (params.warm_xy.1 * warm_flux + params.cool_xy.1 * cool_flux) / total_flux;
        let cct = xy_to_cct(x, y);
        (cct, duv((x, y), cct)?, total_flux / total_lumens)
    } else {
        (effective_cct, 0.0, 0.0)
    };

    Ok(MixResult {
        warm_duty,
        cool_duty,
        achieved_cct,
        achieved_duv,
        achieved_brightness,
    })
}

/// LED binning tolerance assumed when chromaticity is derived rather than
/// measured, in MacAdam steps. One step is roughly 0.0011 Duv.
const DEFAULT_MACADAM_STEP: f64 = 7.0;

/// Mixing when only per-channel lumens are known.
///
/// Chromaticity is derived from the rated CCTs via the Planckian locus, which
/// assumes both emitters sit exactly on the blackbody curve. Less accurate
/// than measured coordinates but still flux-compensated.
pub fn mix_lumens_only(
    target_cct: u32,
    target_brightness: UnipolarFloat,
    warm_cct: u32,
    cool_cct: u32,
    warm_lumens: f64,
    cool_lumens: f64,
    pwm_resolution: u16,
    min_duty: u16,
    gamma: f64,
) -> Result<DerivedMixResult> {
    let params = MixParams::from_lumens(
        warm_cct,
        cool_cct,
        warm_lumens,
        cool_lumens,
        pwm_resolution,
        min_duty,
        gamma,
    )?;
    Ok(DerivedMixResult {
        mix: mix(target_cct, target_brightness, &params)?,
        duv_uncertainty: DEFAULT_MACADAM_STEP * 0.0011,
    })
}

/// Basic linear mixing with gamma correction, for fixtures with neither
/// chromaticity nor lumen data.
pub fn mix_simple(
    target_cct: u32,
    target_brightness: UnipolarFloat,
    cct_min: u32,
    cct_max: u32,
    pwm_resolution: u16,
    gamma: f64,
) -> (u16, u16) {
    let brightness = target_brightness.val();
    if brightness <= 0.0 {
        return (0, 0);
    }

    let effective_cct = target_cct.clamp(cct_min, cct_max);
    let range = cct_max.saturating_sub(cct_min);
    let cct_norm = if range == 0 {
        0.5
    } else {
        (effective_cct - cct_min) as f64 / range as f64
    };

    let warm_linear = (1.0 - cct_norm) * brightness;
    let cool_linear = cct_norm * brightness;

    let resolution = pwm_resolution as f64;
    let gamma_inv = 1.0 / gamma;
    let warm_duty = (apply_inverse_gamma(warm_linear, gamma_inv) * resolution).round() as u16;
    let cool_duty = (apply_inverse_gamma(cool_linear, gamma_inv) * resolution).round() as u16;

    (
        warm_duty.min(pwm_resolution),
        cool_duty.min(pwm_resolution),
    )
}

fn apply_inverse_gamma(linear: f64, gamma_inv: f64) -> f64 {
    if linear > 0.0 { linear.powf(gamma_inv) } else { 0.0 }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_params() -> MixParams {
        MixParams::from_lumens(2700, 6500, 800.0, 800.0, 255, 0, 2.2).unwrap()
    }

    #[test]
    fn test_planckian_xy_rejects_nonpositive() {
        assert!(planckian_xy(0.0).is_err());
        assert!(planckian_xy(-100.0).is_err());
    }

    #[test]
    fn test_planckian_xy_known_points() {
        // Reference values on the locus; the approximation is good to a few
        // parts in 1e4 across the practical range.
        let (x, y) = planckian_xy(2700.0).unwrap();
        assert!((x - 0.4599).abs() < 0.005, "x(2700K) = {x}");
        assert!((y - 0.4106).abs() < 0.005, "y(2700K) = {y}");
        let (x, y) = planckian_xy(6500.0).unwrap();
        assert!((x - 0.3135).abs() < 0.005, "x(6500K) = {x}");
        assert!((y - 0.3237).abs() < 0.005, "y(6500K) = {y}");
    }

    #[test]
    fn test_planckian_x_decreases_with_temperature() {
        let mut last_x = f64::MAX;
        for cct in (1700..=10000).step_by(100) {
            let (x, _) = planckian_xy(cct as f64).unwrap();
            assert!(x < last_x, "x not decreasing at {cct}K");
            last_x = x;
        }
    }

    #[test]
    fn test_xy_to_cct_round_trips_locus() {
        for cct in [2200u32, 2700, 4000, 5000, 6500] {
            let (x, y) = planckian_xy(cct as f64).unwrap();
            let recovered = xy_to_cct(x, y);
            let error = recovered.abs_diff(cct);
            assert!(error < 100, "round trip {cct}K -> {recovered}K");
        }
    }

    #[test]
    fn test_xy_to_uv_guards_denominator() {
        // Denominator -2x + 12y + 3 = 0 at this point.
        assert_eq!((0.0, 0.0), xy_to_uv(1.5, 0.0));
    }

    #[test]
    fn test_duv_zero_on_locus() {
        let (x, y) = planckian_xy(4000.0).unwrap();
        let d = duv((x, y), 4000).unwrap();
        assert!(d.abs() < 1e-3, "duv on locus = {d}");
    }

    #[test]
    fn test_mix_warm_boundary() {
        let result = mix(2700, UnipolarFloat::ONE, &test_params()).unwrap();
        assert_eq!(255, result.warm_duty);
        assert_eq!(0, result.cool_duty);
    }

    #[test]
    fn test_mix_cool_boundary() {
        let result = mix(6500, UnipolarFloat::ONE, &test_params()).unwrap();
        assert_eq!(0, result.warm_duty);
        assert_eq!(255, result.cool_duty);
    }

    #[test]
    fn test_mix_midrange_hits_target() {
        // At moderate drive neither channel clips, so the achieved color
        // lands close to the target.
        let result = mix(4600, UnipolarFloat::new(0.5), &test_params()).unwrap();
        assert!(result.warm_duty > 0);
        assert!(result.cool_duty > 0);
        assert!(
            result.achieved_cct.abs_diff(4600) < 150,
            "achieved {}K for 4600K target",
            result.achieved_cct
        );
    }

    #[test]
    fn test_mix_clipped_channel_shifts_warm() {
        // At 80% drive the cool channel saturates for this target; the
        // saturated channel caps independently while the warm channel keeps
        // its computed drive, pulling the achieved point warm of target
        // along the mixing line.
        let result = mix(4600, UnipolarFloat::new(0.8), &test_params()).unwrap();
        assert!(result.warm_duty > 0);
        assert_eq!(255, result.cool_duty);
        assert!(result.achieved_cct < 4600);
        assert!(
            result.achieved_cct.abs_diff(4600) < 250,
            "achieved {}K for 4600K target",
            result.achieved_cct
        );
    }

    #[test]
    fn test_mix_zero_brightness() {
        let result = mix(4000, UnipolarFloat::ZERO, &test_params()).unwrap();
        assert_eq!(0, result.warm_duty);
        assert_eq!(0, result.cool_duty);
        assert_eq!(0.0, result.achieved_brightness);
    }

    #[test]
    fn test_mix_clamps_out_of_range_targets() {
        let params = test_params();
        let below = mix(1800, UnipolarFloat::ONE, &params).unwrap();
        let at_warm = mix(2700, UnipolarFloat::ONE, &params).unwrap();
        assert_eq!(at_warm, below);
        let above = mix(9000, UnipolarFloat::ONE, &params).unwrap();
        let at_cool = mix(6500, UnipolarFloat::ONE, &params).unwrap();
        assert_eq!(at_cool, above);
    }

    #[test]
    fn test_mix_duty_monotonicity() {
        let params = test_params();
        let mut last_warm = u16::MAX;
        let mut last_cool = 0u16;
        for cct in (2700..=6500).step_by(100) {
            let result = mix(cct, UnipolarFloat::ONE, &params).unwrap();
            assert!(
                result.warm_duty <= last_warm,
                "warm duty increased at {cct}K"
            );
            assert!(
                result.cool_duty >= last_cool,
                "cool duty decreased at {cct}K"
            );
            last_warm = result.warm_duty;
            last_cool = result.cool_duty;
        }
    }

    #[test]
    fn test_mix_brightness_fidelity_midrange() {
        // Flux compensation can demand more than 100% of one channel outside
        // the mid-range sweet spot; duties clamp and brightness drops. The
        // fidelity contract holds where neither channel clips.
        let params = test_params();
        for cct in (3800..=4300).step_by(100) {
            let result = mix(cct, UnipolarFloat::new(0.8), &params).unwrap();
            let error = (result.achieved_brightness - 0.8).abs() / 0.8;
            assert!(
                error < 0.05,
                "brightness error {:.1}% at {cct}K",
                error * 100.0
            );
        }
        // At low drive no channel can clip, so the contract holds range-wide.
        for cct in (3300..=5900).step_by(200) {
            let result = mix(cct, UnipolarFloat::new(0.3), &params).unwrap();
            let error = (result.achieved_brightness - 0.3).abs() / 0.3;
            assert!(
                error < 0.05,
                "brightness error {:.1}% at {cct}K b=0.3",
                error * 100.0
            );
        }
    }

    #[test]
    fn test_mix_duv_bound_midrange() {
        let params = test_params();
        for cct in (3300..=5900).step_by(200) {
            let result = mix(cct, UnipolarFloat::new(0.8), &params).unwrap();
            assert!(
                result.achieved_duv.abs() < 0.007,
                "duv {} at {cct}K",
                result.achieved_duv
            );
        }
    }

    #[test]
    fn test_mix_respects_min_duty_floor() {
        let mut params = test_params();
        params.min_duty = 13;
        let result = mix(2750, UnipolarFloat::new(0.5), &params).unwrap();
        for duty in [result.warm_duty, result.cool_duty] {
            assert!(duty == 0 || duty >= 13, "duty {duty} below floor");
        }
    }

    #[test]
    fn test_mix_lumens_only_reports_uncertainty() {
        let result =
            mix_lumens_only(4000, UnipolarFloat::ONE, 2700, 6500, 800.0, 800.0, 255, 0, 2.2)
                .unwrap();
        assert!((result.duv_uncertainty - 0.0077).abs() < 1e-9);
        assert!(result.mix.warm_duty > 0);
        assert!(result.mix.cool_duty > 0);
    }

    #[test]
    fn test_mix_flux_compensation_uneven_lumens() {
        // A dimmer warm channel has to be driven harder than an even split.
        let uneven = MixParams::from_lumens(2700, 6500, 400.0, 1200.0, 255, 0, 2.2).unwrap();
        let result = mix(4000, UnipolarFloat::new(0.5), &uneven).unwrap();
        let even = mix(4000, UnipolarFloat::new(0.5), &test_params()).unwrap();
        assert!(result.warm_duty > even.warm_duty);
    }

    #[test]
    fn test_mix_simple_boundaries() {
        let (warm, cool) = mix_simple(2700, UnipolarFloat::ONE, 2700, 6500, 255, 2.2);
        assert_eq!((255, 0), (warm, cool));
        let (warm, cool) = mix_simple(6500, UnipolarFloat::ONE, 2700, 6500, 255, 2.2);
        assert_eq!((0, 255), (warm, cool));
    }

    #[test]
    fn test_mix_simple_degenerate_range() {
        let (warm, cool) = mix_simple(4000, UnipolarFloat::ONE, 4000, 4000, 255, 2.2);
        assert_eq!(warm, cool);
        assert!(warm > 0);
    }

    #[test]
    fn test_mix_simple_zero_brightness() {
        assert_eq!(
            (0, 0),
            mix_simple(4000, UnipolarFloat::ZERO, 2700, 6500, 255, 2.2)
        );
    }
}
