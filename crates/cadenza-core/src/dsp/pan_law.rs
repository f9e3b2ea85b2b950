use core::f32::consts::FRAC_PI_4;

/// Compute constant-power `(left, right)` gains for a pan position and a
/// volume.
///
/// * `pan` - `0.0` is center, `-1.0` is fully left, `1.0` is fully right.
/// * `volume` - `0.0` is mute, `1.0` is unity gain.
///
/// This is a circular pan law: `gain_l² + gain_r² == volume²` across the
/// whole panning range, so the perceived loudness stays constant while
/// sweeping. Out-of-range inputs are clamped.
pub fn constant_power_gains(pan: f32, volume: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    let volume = volume.clamp(0.0, 1.0);

    let angle = (pan + 1.0) * FRAC_PI_4;

    (angle.cos() * volume, angle.sin() * volume)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn endpoints_and_center() {
        let (l, r) = constant_power_gains(-1.0, 1.0);
        assert!((l - 1.0).abs() < EPSILON);
        assert!(r.abs() < EPSILON);

        let (l, r) = constant_power_gains(1.0, 1.0);
        assert!(l.abs() < EPSILON);
        assert!((r - 1.0).abs() < EPSILON);

        let (l, r) = constant_power_gains(0.0, 1.0);
        assert!((l - core::f32::consts::FRAC_1_SQRT_2).abs() < EPSILON);
        assert!((r - core::f32::consts::FRAC_1_SQRT_2).abs() < EPSILON);
    }

    #[test]
    fn power_is_constant_across_sweep() {
        for i in 0..=20 {
            let pan = -1.0 + i as f32 * 0.1;
            let (l, r) = constant_power_gains(pan, 0.8);
            assert!((l * l + r * r - 0.64).abs() < 1e-5, "pan = {pan}");
        }
    }

    #[test]
    fn inputs_are_clamped() {
        assert_eq!(
            constant_power_gains(-3.0, 2.0),
            constant_power_gains(-1.0, 1.0)
        );
    }
}
