use std::sync::Arc;

use portable_atomic::AtomicF32;
use std::sync::atomic::Ordering;

use cadenza_core::dsp::pan_law::constant_power_gains;
use cadenza_core::node::{AudioProcessor, ProcessorInfo};
use cadenza_core::NUM_CHANNELS;

/// The shared parameters of a fader.
pub struct FaderParams {
    /// `0.0` is center, `-1.0` is fully left, `1.0` is fully right.
    pan: AtomicF32,
    /// `0.0` is mute, `1.0` is unity gain.
    volume: AtomicF32,
}

impl FaderParams {
    pub fn new(pan: f32, volume: f32) -> Arc<Self> {
        Arc::new(Self {
            pan: AtomicF32::new(pan),
            volume: AtomicF32::new(volume),
        })
    }

    pub fn pan(&self) -> f32 {
        self.pan.load(Ordering::Acquire)
    }

    pub fn set_pan(&self, pan: f32) {
        self.pan.store(pan, Ordering::Release);
    }

    pub fn volume(&self) -> f32 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume, Ordering::Release);
    }
}

/// A constant-power volume/pan stage.
///
/// Gains are recomputed once per block from the shared parameters:
/// `angle = (pan + 1)·π/4`, `gain_l = cos(angle)·vol`,
/// `gain_r = sin(angle)·vol`. Out-of-range parameter values are clamped at
/// read time.
pub struct FaderNode {
    params: Arc<FaderParams>,
}

impl FaderNode {
    pub fn new(params: Arc<FaderParams>) -> Self {
        log::info!(
            "creating fader: pan = {}, volume = {}",
            params.pan(),
            params.volume()
        );
        Self { params }
    }

    pub fn params(&self) -> &Arc<FaderParams> {
        &self.params
    }
}

impl AudioProcessor for FaderNode {
    fn info(&self) -> ProcessorInfo {
        ProcessorInfo {
            debug_name: "fader",
            ..Default::default()
        }
    }

    fn process(&mut self, _sample_rate: f64, frames: usize, buffer: &mut [f32]) {
        let (gain_l, gain_r) = constant_power_gains(self.params.pan(), self.params.volume());

        for frame in buffer[..frames * NUM_CHANNELS].chunks_exact_mut(NUM_CHANNELS) {
            frame[0] *= gain_l;
            frame[1] *= gain_r;
        }
    }
}
