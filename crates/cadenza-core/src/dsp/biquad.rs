//! Second-order IIR (biquad) filter sections.
//!
//! Coefficient design follows the Audio EQ Cookbook (Robert
//! Bristow-Johnson). The shelf gain uses `A = 10^(gain_db / 40)`.

/// The response shape of a biquad section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BiquadKind {
    Lowpass = 0,
    Highpass,
    Bandpass,
    Bandstop,
    LowShelf,
    HighShelf,
}

impl BiquadKind {
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => Self::Highpass,
            2 => Self::Bandpass,
            3 => Self::Bandstop,
            4 => Self::LowShelf,
            5 => Self::HighShelf,
            _ => Self::Lowpass,
        }
    }
}

/// The six coefficients of a biquad section.
///
/// The difference equation is normalized by `a0`:
///
/// `y[n] = (b0·x[n] + b1·x[n-1] + b2·x[n-2] - a1·y[n-1] - a2·y[n-2]) / a0`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub a0: f32,
    pub a1: f32,
    pub a2: f32,
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
}

impl BiquadCoeffs {
    /// An identity section (`y[n] = x[n]`).
    pub const IDENTITY: Self = Self {
        a0: 1.0,
        a1: 0.0,
        a2: 0.0,
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
    };

    /// Design a section of the given kind.
    ///
    /// * `sample_rate` - The sample rate in Hz.
    /// * `freq` - The corner/center frequency in Hz. Must lie below the
    ///   Nyquist frequency.
    /// * `q` - The quality factor, greater than zero.
    /// * `gain_db` - The shelf gain in decibels. Ignored by the pass and
    ///   stop kinds.
    pub fn design(kind: BiquadKind, sample_rate: f32, freq: f32, q: f32, gain_db: f32) -> Self {
        let a = 10.0f32.powf(gain_db / 40.0);
        let omega = core::f32::consts::TAU * freq / sample_rate;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);

        match kind {
            BiquadKind::Lowpass => Self {
                b0: (1.0 - cos_w) / 2.0,
                b1: 1.0 - cos_w,
                b2: (1.0 - cos_w) / 2.0,
                a0: 1.0 + alpha,
                a1: -2.0 * cos_w,
                a2: 1.0 - alpha,
            },
            BiquadKind::Highpass => Self {
                b0: (1.0 + cos_w) / 2.0,
                b1: -(1.0 + cos_w),
                b2: (1.0 + cos_w) / 2.0,
                a0: 1.0 + alpha,
                a1: -2.0 * cos_w,
                a2: 1.0 - alpha,
            },
            BiquadKind::Bandpass => Self {
                b0: alpha,
                b1: 0.0,
                b2: -alpha,
                a0: 1.0 + alpha,
                a1: -2.0 * cos_w,
                a2: 1.0 - alpha,
            },
            BiquadKind::Bandstop => Self {
                b0: 1.0,
                b1: -2.0 * cos_w,
                b2: 1.0,
                a0: 1.0 + alpha,
                a1: -2.0 * cos_w,
                a2: 1.0 - alpha,
            },
            BiquadKind::LowShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                Self {
                    b0: a * ((a + 1.0) - (a - 1.0) * cos_w + two_sqrt_a_alpha),
                    b1: 2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w),
                    b2: a * ((a + 1.0) - (a - 1.0) * cos_w - two_sqrt_a_alpha),
                    a0: (a + 1.0) + (a - 1.0) * cos_w + two_sqrt_a_alpha,
                    a1: -2.0 * ((a - 1.0) + (a + 1.0) * cos_w),
                    a2: (a + 1.0) + (a - 1.0) * cos_w - two_sqrt_a_alpha,
                }
            }
            BiquadKind::HighShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                Self {
                    b0: a * ((a + 1.0) + (a - 1.0) * cos_w + two_sqrt_a_alpha),
                    b1: -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w),
                    b2: a * ((a + 1.0) + (a - 1.0) * cos_w - two_sqrt_a_alpha),
                    a0: (a + 1.0) - (a - 1.0) * cos_w + two_sqrt_a_alpha,
                    a1: 2.0 * ((a - 1.0) - (a + 1.0) * cos_w),
                    a2: (a + 1.0) - (a - 1.0) * cos_w - two_sqrt_a_alpha,
                }
            }
        }
    }
}

/// The two-in, two-out history of one channel of a biquad section.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one sample through the section, shifting the history.
    #[inline]
    pub fn process(&mut self, coeffs: &BiquadCoeffs, x: f32) -> f32 {
        let y = (coeffs.b0 * x + coeffs.b1 * self.x1 + coeffs.b2 * self.x2
            - coeffs.a1 * self.y1
            - coeffs.a2 * self.y2)
            / coeffs.a0;

        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;

        y
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse_response(coeffs: &BiquadCoeffs, len: usize) -> Vec<f32> {
        let mut state = BiquadState::new();
        (0..len)
            .map(|n| state.process(coeffs, if n == 0 { 1.0 } else { 0.0 }))
            .collect()
    }

    #[test]
    fn impulse_head_is_b0_over_a0() {
        let coeffs = BiquadCoeffs::design(BiquadKind::Lowpass, 48_000.0, 100.0, 1.0, 0.0);
        let h = impulse_response(&coeffs, 8);

        assert!((h[0] - coeffs.b0 / coeffs.a0).abs() < 1e-9);

        // A lowpass far below Nyquist rings up before it decays.
        assert!(h[1] > h[0]);
        assert!(h[2] > h[1]);
    }

    #[test]
    fn lowpass_passes_dc() {
        let coeffs = BiquadCoeffs::design(BiquadKind::Lowpass, 48_000.0, 1_000.0, 0.707, 0.0);

        // DC gain = sum(b) / sum(a).
        let dc = (coeffs.b0 + coeffs.b1 + coeffs.b2) / (coeffs.a0 + coeffs.a1 + coeffs.a2);
        assert!((dc - 1.0).abs() < 1e-4);
    }

    #[test]
    fn highpass_blocks_dc() {
        let coeffs = BiquadCoeffs::design(BiquadKind::Highpass, 48_000.0, 1_000.0, 0.707, 0.0);
        let dc = (coeffs.b0 + coeffs.b1 + coeffs.b2) / (coeffs.a0 + coeffs.a1 + coeffs.a2);
        assert!(dc.abs() < 1e-4);
    }

    #[test]
    fn shelf_gain_at_dc() {
        let gain_db = 6.0;
        let coeffs = BiquadCoeffs::design(BiquadKind::LowShelf, 48_000.0, 1_000.0, 0.707, gain_db);

        let dc = (coeffs.b0 + coeffs.b1 + coeffs.b2) / (coeffs.a0 + coeffs.a1 + coeffs.a2);
        let expected = 10.0f32.powf(gain_db / 20.0);
        assert!((dc - expected).abs() < 1e-2, "dc = {dc}, expected {expected}");
    }

    #[test]
    fn notch_rejects_center_frequency() {
        let sample_rate = 48_000.0;
        let freq = 1_000.0;
        let coeffs = BiquadCoeffs::design(BiquadKind::Bandstop, sample_rate, freq, 4.0, 0.0);

        let mut state = BiquadState::new();
        let mut peak: f32 = 0.0;
        // Let the filter settle, then measure the tail of a centered sine.
        for n in 0..9600 {
            let x = (core::f32::consts::TAU * freq * n as f32 / sample_rate).sin();
            let y = state.process(&coeffs, x);
            if n > 4800 {
                peak = peak.max(y.abs());
            }
        }
        assert!(peak < 0.05, "peak = {peak}");
    }

    #[test]
    fn kind_round_trips_through_u32() {
        for kind in [
            BiquadKind::Lowpass,
            BiquadKind::Highpass,
            BiquadKind::Bandpass,
            BiquadKind::Bandstop,
            BiquadKind::LowShelf,
            BiquadKind::HighShelf,
        ] {
            assert_eq!(BiquadKind::from_u32(kind as u32), kind);
        }
    }
}
