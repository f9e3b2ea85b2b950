use core::f64::consts::TAU;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use portable_atomic::AtomicF64;

use cadenza_core::node::{AudioProcessor, ProcessorInfo};
use cadenza_core::NUM_CHANNELS;

/// The waveform produced by an [`OscillatorNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Waveform {
    Sine = 0,
    Square,
    Saw,
}

impl Waveform {
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => Self::Square,
            2 => Self::Saw,
            _ => Self::Sine,
        }
    }
}

/// The shared parameters of an oscillator.
///
/// Every field is independently writable from any thread while the RT
/// thread is reading; writers use release stores and the reader uses
/// acquire loads.
pub struct OscillatorParams {
    waveform: AtomicU32,
    /// Hz.
    frequency: AtomicF64,
    /// Radians, wrapped into `[0, 2π)`.
    phase: AtomicF64,
    amplitude: AtomicF64,
}

impl OscillatorParams {
    pub fn new(waveform: Waveform, frequency: f64, phase: f64, amplitude: f64) -> Arc<Self> {
        Arc::new(Self {
            waveform: AtomicU32::new(waveform as u32),
            frequency: AtomicF64::new(frequency),
            phase: AtomicF64::new(phase.rem_euclid(TAU)),
            amplitude: AtomicF64::new(amplitude),
        })
    }

    pub fn waveform(&self) -> Waveform {
        Waveform::from_u32(self.waveform.load(Ordering::Acquire))
    }

    pub fn set_waveform(&self, waveform: Waveform) {
        self.waveform.store(waveform as u32, Ordering::Release);
    }

    pub fn frequency(&self) -> f64 {
        self.frequency.load(Ordering::Acquire)
    }

    pub fn set_frequency(&self, frequency: f64) {
        self.frequency.store(frequency, Ordering::Release);
    }

    pub fn phase(&self) -> f64 {
        self.phase.load(Ordering::Acquire)
    }

    pub fn set_phase(&self, phase: f64) {
        self.phase.store(phase.rem_euclid(TAU), Ordering::Release);
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude.load(Ordering::Acquire)
    }

    pub fn set_amplitude(&self, amplitude: f64) {
        self.amplitude.store(amplitude, Ordering::Release);
    }
}

/// A sine/square/saw source.
///
/// Mixes `amplitude * waveform(phase)` into both channels of its buffer
/// and advances the phase by `2π·frequency/sample_rate` per frame.
pub struct OscillatorNode {
    params: Arc<OscillatorParams>,
}

impl OscillatorNode {
    pub fn new(params: Arc<OscillatorParams>) -> Self {
        log::info!("creating {:?} oscillator", params.waveform());
        Self { params }
    }

    pub fn params(&self) -> &Arc<OscillatorParams> {
        &self.params
    }
}

impl AudioProcessor for OscillatorNode {
    fn info(&self) -> ProcessorInfo {
        ProcessorInfo {
            debug_name: "oscillator",
            ..Default::default()
        }
    }

    fn process(&mut self, sample_rate: f64, frames: usize, buffer: &mut [f32]) {
        let waveform = self.params.waveform();
        let frequency = self.params.frequency.load(Ordering::Acquire);
        let amplitude = self.params.amplitude.load(Ordering::Acquire);
        let mut phase = self.params.phase.load(Ordering::Acquire);

        let phase_increment = TAU * frequency / sample_rate;

        for frame in buffer[..frames * NUM_CHANNELS].chunks_exact_mut(NUM_CHANNELS) {
            let sample = match waveform {
                Waveform::Sine => phase.sin(),
                Waveform::Square => {
                    if phase < core::f64::consts::PI {
                        1.0
                    } else {
                        -1.0
                    }
                }
                Waveform::Saw => (phase / TAU) * 2.0 - 1.0,
            };
            let sample = (sample * amplitude) as f32;

            frame[0] += sample;
            frame[1] += sample;

            phase += phase_increment;
            while phase >= TAU {
                phase -= TAU;
            }
        }

        self.params.phase.store(phase, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: f64 = 48_000.0;

    fn run_block(params: &Arc<OscillatorParams>, frames: usize) -> Vec<f32> {
        let mut node = OscillatorNode::new(Arc::clone(params));
        let mut buffer = vec![0.0f32; frames * NUM_CHANNELS];
        node.process(SAMPLE_RATE, frames, &mut buffer);
        buffer
    }

    #[test]
    fn sine_first_samples_at_440() {
        let params = OscillatorParams::new(Waveform::Sine, 440.0, 0.0, 0.5);
        let buffer = run_block(&params, 8);

        for i in 0..8 {
            let expected = (0.5 * (TAU * 440.0 * i as f64 / SAMPLE_RATE).sin()) as f32;
            assert!(
                (buffer[i * 2] - expected).abs() < 1e-6,
                "frame {i}: {} vs {expected}",
                buffer[i * 2]
            );
            assert_eq!(buffer[i * 2], buffer[i * 2 + 1]);
        }
    }

    #[test]
    fn zero_frequency_is_dc_and_phase_holds() {
        let phase0 = 0.25;
        let params = OscillatorParams::new(Waveform::Sine, 0.0, phase0, 0.8);
        let buffer = run_block(&params, 64);

        let dc = (0.8 * phase0.sin()) as f32;
        assert!(buffer.iter().all(|&s| (s - dc).abs() < 1e-6));
        assert!((params.phase() - phase0).abs() < 1e-12);
    }

    #[test]
    fn phase_continues_across_blocks() {
        let params = OscillatorParams::new(Waveform::Sine, 1_000.0, 0.0, 1.0);
        let mut node = OscillatorNode::new(Arc::clone(&params));

        let mut a = vec![0.0f32; 32 * NUM_CHANNELS];
        let mut b = vec![0.0f32; 32 * NUM_CHANNELS];
        node.process(SAMPLE_RATE, 32, &mut a);
        node.process(SAMPLE_RATE, 32, &mut b);

        // Block b must continue where block a left off.
        let expected = ((TAU * 1_000.0 * 32.0 / SAMPLE_RATE).rem_euclid(TAU)).sin() as f32;
        assert!((b[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn square_flips_at_pi() {
        let params = OscillatorParams::new(Waveform::Square, 12_000.0, 0.0, 1.0);
        // 12 kHz at 48 kHz: period of 4 frames, phase 0, π/2, π, 3π/2.
        let buffer = run_block(&params, 4);

        assert_eq!(buffer[0], 1.0);
        assert_eq!(buffer[2], 1.0);
        assert_eq!(buffer[4], -1.0);
        assert_eq!(buffer[6], -1.0);
    }

    #[test]
    fn saw_ramps_from_minus_one() {
        let params = OscillatorParams::new(Waveform::Saw, 12_000.0, 0.0, 1.0);
        let buffer = run_block(&params, 4);

        assert_eq!(buffer[0], -1.0);
        assert_eq!(buffer[2], -0.5);
        assert_eq!(buffer[4], 0.0);
        assert_eq!(buffer[6], 0.5);
    }

    #[test]
    fn mixes_instead_of_overwriting() {
        let params = OscillatorParams::new(Waveform::Sine, 0.0, core::f64::consts::FRAC_PI_2, 0.5);
        let mut node = OscillatorNode::new(params);

        let mut buffer = vec![0.25f32; 4 * NUM_CHANNELS];
        node.process(SAMPLE_RATE, 4, &mut buffer);

        // DC of 0.5 summed onto the existing 0.25.
        assert!(buffer.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }
}
