use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use portable_atomic::AtomicF32;

use cadenza_core::dsp::biquad::{BiquadCoeffs, BiquadKind, BiquadState};
use cadenza_core::node::{AudioProcessor, ProcessorInfo};
use cadenza_core::worker::{WorkerHandle, WorkerTask};
use cadenza_core::NUM_CHANNELS;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct IirFlags: u32 {
        const RECALCULATE = 1 << 0;
    }
}

/// The six shared coefficients of the running section.
///
/// The worker stores them one word at a time; the RT thread snapshots them
/// once per block. A block that lands mid-update may briefly mix old and
/// new coefficients, a transient the filter absorbs.
struct AtomicCoeffs {
    a0: AtomicF32,
    a1: AtomicF32,
    a2: AtomicF32,
    b0: AtomicF32,
    b1: AtomicF32,
    b2: AtomicF32,
}

impl AtomicCoeffs {
    fn store(&self, coeffs: BiquadCoeffs) {
        self.a0.store(coeffs.a0, Ordering::Release);
        self.a1.store(coeffs.a1, Ordering::Release);
        self.a2.store(coeffs.a2, Ordering::Release);
        self.b0.store(coeffs.b0, Ordering::Release);
        self.b1.store(coeffs.b1, Ordering::Release);
        self.b2.store(coeffs.b2, Ordering::Release);
    }

    fn load(&self) -> BiquadCoeffs {
        BiquadCoeffs {
            a0: self.a0.load(Ordering::Acquire),
            a1: self.a1.load(Ordering::Acquire),
            a2: self.a2.load(Ordering::Acquire),
            b0: self.b0.load(Ordering::Acquire),
            b1: self.b1.load(Ordering::Acquire),
            b2: self.b2.load(Ordering::Acquire),
        }
    }
}

/// The shared parameters of an IIR biquad filter.
///
/// Parameter setters only store the new value; call
/// [`IirFilterParams::request_recalculate`] afterwards to have the
/// coefficients recomputed. The recomputation itself runs on the worker
/// pool, never on the RT thread.
pub struct IirFilterParams {
    kind: AtomicU32,
    frequency: AtomicF32,
    q: AtomicF32,
    gain_db: AtomicF32,
    sample_rate: AtomicF32,
    flags: AtomicU32,
    coeffs: AtomicCoeffs,
}

impl IirFilterParams {
    pub fn new(kind: BiquadKind, frequency: f32, q: f32, gain_db: f32) -> Arc<Self> {
        Arc::new(Self {
            kind: AtomicU32::new(kind as u32),
            frequency: AtomicF32::new(frequency),
            q: AtomicF32::new(q),
            gain_db: AtomicF32::new(gain_db),
            sample_rate: AtomicF32::new(0.0),
            flags: AtomicU32::new(0),
            coeffs: AtomicCoeffs {
                a0: AtomicF32::new(BiquadCoeffs::IDENTITY.a0),
                a1: AtomicF32::new(BiquadCoeffs::IDENTITY.a1),
                a2: AtomicF32::new(BiquadCoeffs::IDENTITY.a2),
                b0: AtomicF32::new(BiquadCoeffs::IDENTITY.b0),
                b1: AtomicF32::new(BiquadCoeffs::IDENTITY.b1),
                b2: AtomicF32::new(BiquadCoeffs::IDENTITY.b2),
            },
        })
    }

    pub fn kind(&self) -> BiquadKind {
        BiquadKind::from_u32(self.kind.load(Ordering::Acquire))
    }

    pub fn set_kind(&self, kind: BiquadKind) {
        self.kind.store(kind as u32, Ordering::Release);
    }

    pub fn frequency(&self) -> f32 {
        self.frequency.load(Ordering::Acquire)
    }

    pub fn set_frequency(&self, frequency: f32) {
        self.frequency.store(frequency, Ordering::Release);
    }

    pub fn q(&self) -> f32 {
        self.q.load(Ordering::Acquire)
    }

    pub fn set_q(&self, q: f32) {
        self.q.store(q, Ordering::Release);
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db.load(Ordering::Acquire)
    }

    pub fn set_gain_db(&self, gain_db: f32) {
        self.gain_db.store(gain_db, Ordering::Release);
    }

    /// Ask the node to recompute its coefficients. The next `process`
    /// call schedules the work on the worker pool.
    pub fn request_recalculate(&self) {
        self.flags
            .fetch_or(IirFlags::RECALCULATE.bits(), Ordering::AcqRel);
    }

    /// Recompute the coefficients from the current parameters.
    ///
    /// Runs on the worker pool when requested through
    /// [`IirFilterParams::request_recalculate`]; also invoked once
    /// directly at node creation.
    fn recalculate(&self) {
        let coeffs = BiquadCoeffs::design(
            self.kind(),
            self.sample_rate.load(Ordering::Acquire),
            self.frequency(),
            self.q(),
            self.gain_db(),
        );

        log::info!(
            "calculated biquad coefficients: a0={}, a1={}, a2={}, b0={}, b1={}, b2={}",
            coeffs.a0,
            coeffs.a1,
            coeffs.a2,
            coeffs.b0,
            coeffs.b1,
            coeffs.b2
        );

        self.coeffs.store(coeffs);
    }
}

struct RecalculateTask {
    params: Arc<IirFilterParams>,
}

impl WorkerTask for RecalculateTask {
    fn run(&self) {
        self.params.recalculate();
    }
}

/// A second-order IIR filter section (direct form I), stereo.
pub struct IirFilterNode {
    params: Arc<IirFilterParams>,
    task: Arc<RecalculateTask>,
    worker: WorkerHandle,
    history: [BiquadState; NUM_CHANNELS],
}

impl IirFilterNode {
    /// Create a filter node.
    ///
    /// `sample_rate` seeds the initial coefficient design; once the stream
    /// runs, recalculations use the rate the RT callback reports.
    pub fn new(params: Arc<IirFilterParams>, sample_rate: f32, worker: WorkerHandle) -> Self {
        params.sample_rate.store(sample_rate, Ordering::Release);
        params.recalculate();

        Self {
            task: Arc::new(RecalculateTask {
                params: Arc::clone(&params),
            }),
            params,
            worker,
            history: [BiquadState::new(); NUM_CHANNELS],
        }
    }

    pub fn params(&self) -> &Arc<IirFilterParams> {
        &self.params
    }
}

impl AudioProcessor for IirFilterNode {
    fn info(&self) -> ProcessorInfo {
        ProcessorInfo {
            debug_name: "iir_filter",
            ..Default::default()
        }
    }

    fn process(&mut self, sample_rate: f64, frames: usize, buffer: &mut [f32]) {
        let coeffs = self.params.coeffs.load();

        for frame in buffer[..frames * NUM_CHANNELS].chunks_exact_mut(NUM_CHANNELS) {
            frame[0] = self.history[0].process(&coeffs, frame[0]);
            frame[1] = self.history[1].process(&coeffs, frame[1]);
        }

        let flags = IirFlags::from_bits_truncate(self.params.flags.load(Ordering::Acquire));
        if flags.contains(IirFlags::RECALCULATE) {
            self.params
                .sample_rate
                .store(sample_rate as f32, Ordering::Release);
            self.params
                .flags
                .fetch_and(!IirFlags::RECALCULATE.bits(), Ordering::AcqRel);

            self.worker.defer(self.task.clone());
        }
    }
}
