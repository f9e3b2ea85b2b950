//! The realtime counterpart of [`EngineCtx`](crate::EngineCtx).
//!
//! An [`EngineProcessor`] is created at stream start and moved into the
//! backend's audio callback. Everything it does per callback is bounded:
//! no general-heap allocation, no contended locks, one condvar signal on
//! the stop path.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cadenza_core::arena::ScratchArena;
use cadenza_core::dsp::buffer;
use cadenza_core::{ProcessorId, StreamInfo, NUM_CHANNELS};

use crate::context::{EngineFlags, EngineShared};

/// The traversal recursion cap; a safety net against cycles that slipped
/// past route-time validation.
pub const MAX_TRAVERSAL_DEPTH: usize = 128;

pub struct EngineProcessor {
    shared: Arc<EngineShared>,
    arena: ScratchArena,
    sample_rate: f64,
    max_block_frames: usize,
}

impl EngineProcessor {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        stream_info: &StreamInfo,
        scratch_arena_kb: usize,
    ) -> Self {
        Self {
            shared,
            arena: ScratchArena::with_capacity_kb(scratch_arena_kb),
            sample_rate: stream_info.sample_rate.get() as f64,
            max_block_frames: stream_info.max_block_frames,
        }
    }

    /// Produce one callback's worth of interleaved stereo output.
    ///
    /// `output.len()` must be an even number of samples not exceeding the
    /// stream's maximum block size. The buffer is zeroed first on every
    /// path: silence must be produced, never stale memory.
    pub fn process_interleaved(&mut self, output: &mut [f32]) {
        output.fill(0.0);

        assert!(
            output.len() % NUM_CHANNELS == 0,
            "expected a single interleaved stereo output buffer"
        );
        let frames = output.len() / NUM_CHANNELS;
        assert!(
            frames <= self.max_block_frames,
            "callback delivered {} frames, more than the negotiated maximum of {}",
            frames,
            self.max_block_frames
        );

        // Note: the early exits below must come after the zeroing above to
        // prevent horrible glitching.
        let flags = self.shared.flags();
        if !flags.contains(EngineFlags::STARTED) {
            return;
        }

        if flags.contains(EngineFlags::STOP_REQUESTED) {
            self.shared.master_gain.store(0.0, Ordering::Release);
            self.shared.set_flags(EngineFlags::AUDIO_THREAD_SILENCED);
            // Signalled every callback while the stop is pending, so the
            // control thread cannot miss it.
            self.shared.stop_cond.notify_all();
            return;
        }

        for source in self.shared.sources.iter_ones() {
            if !self.shared.table.is_live(source) {
                continue;
            }

            // SAFETY: the branch buffer is dropped before `release`, and
            // this thread is the arena's only user.
            let branch = unsafe { self.arena.calloc(frames * NUM_CHANNELS) };
            self.traverse(source as ProcessorId, branch, output, 0, frames);
        }

        buffer::scale(output, self.shared.master_gain.load(Ordering::Acquire));

        for id in self.shared.table.live_ids() {
            if self.shared.table.uses_on_cycle(id as ProcessorId) {
                // SAFETY: this is the RT thread, and `id` was observed
                // live this callback.
                if let Some(node) = unsafe { self.shared.table.node_mut(id as ProcessorId) } {
                    node.on_cycle();
                }
            }
        }

        // Wake the workers for anything the nodes deferred this cycle.
        self.shared.worker.flush();

        self.arena.release();
        self.shared.table.end_cycle();
    }

    /// Depth-first dispatch. Each fan-out branch gets its own copy of the
    /// input buffer, so a node's in-place edits cannot poison sibling
    /// branches; leaves sum into the master buffer.
    fn traverse(
        &self,
        id: ProcessorId,
        in_buffer: &mut [f32],
        master: &mut [f32],
        depth: usize,
        frames: usize,
    ) {
        assert!(
            depth < MAX_TRAVERSAL_DEPTH,
            "traversal depth cap exceeded; the graph contains a cycle"
        );

        // SAFETY: RT thread, id observed live this callback (or skipped).
        let Some(node) = (unsafe { self.shared.table.node_mut(id) }) else {
            return;
        };
        node.process(self.sample_rate, frames, in_buffer);

        let output_mask = self.shared.table.output_mask(id);
        if output_mask.is_empty() {
            // End of branch: mix into the master buffer.
            buffer::sum_into(master, in_buffer);
            return;
        }

        for child in output_mask.iter_ones() {
            if !self.shared.table.is_live(child) {
                continue;
            }

            // SAFETY: as above; dropped before `release`.
            let branch = unsafe { self.arena.alloc(frames * NUM_CHANNELS) };
            branch.copy_from_slice(in_buffer);
            self.traverse(child as ProcessorId, branch, master, depth + 1, frames);
        }
    }

    /// The scratch cursor; zero between callbacks.
    pub fn scratch_in_use(&self) -> usize {
        self.arena.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EngineConfig, EngineCtx};
    use crate::null::NullBackend;
    use cadenza_core::node::{AudioProcessor, ProcessorInfo};
    use core::sync::atomic::AtomicU32;

    /// Adds a constant to every sample.
    struct OffsetNode(f32);

    impl AudioProcessor for OffsetNode {
        fn info(&self) -> ProcessorInfo {
            ProcessorInfo {
                debug_name: "offset",
                ..Default::default()
            }
        }

        fn process(&mut self, _sample_rate: f64, frames: usize, buffer: &mut [f32]) {
            for s in buffer[..frames * NUM_CHANNELS].iter_mut() {
                *s += self.0;
            }
        }
    }

    /// Multiplies every sample by a constant.
    struct GainNode(f32);

    impl AudioProcessor for GainNode {
        fn info(&self) -> ProcessorInfo {
            ProcessorInfo {
                debug_name: "gain",
                ..Default::default()
            }
        }

        fn process(&mut self, _sample_rate: f64, frames: usize, buffer: &mut [f32]) {
            for s in buffer[..frames * NUM_CHANNELS].iter_mut() {
                *s *= self.0;
            }
        }
    }

    struct CycleCounter {
        processed: Arc<AtomicU32>,
        cycled: Arc<AtomicU32>,
    }

    impl AudioProcessor for CycleCounter {
        fn info(&self) -> ProcessorInfo {
            ProcessorInfo {
                debug_name: "cycle_counter",
                uses_on_cycle: true,
            }
        }

        fn process(&mut self, _sample_rate: f64, _frames: usize, _buffer: &mut [f32]) {
            self.processed.fetch_add(1, Ordering::AcqRel);
        }

        fn on_cycle(&mut self) {
            self.cycled.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Build a context whose processor we pump by hand, without a backend
    /// thread.
    fn manual_engine() -> (EngineCtx<NullBackend>, EngineProcessor) {
        let ctx = EngineCtx::<NullBackend>::new(EngineConfig::default());
        let processor = EngineProcessor::new(
            Arc::clone(ctx.test_shared()),
            &StreamInfo::default(),
            EngineConfig::default().scratch_arena_kb,
        );
        (ctx, processor)
    }

    #[test]
    fn sourceless_graph_is_silent() {
        let (ctx, mut processor) = manual_engine();
        ctx.test_shared().set_flags(EngineFlags::STARTED);

        let mut output = vec![1.0f32; 256 * NUM_CHANNELS];
        processor.process_interleaved(&mut output);

        assert!(output.iter().all(|&s| s == 0.0));
        assert_eq!(processor.scratch_in_use(), 0);
    }

    #[test]
    fn chain_and_fanout_mix_into_master() {
        let (mut ctx, mut processor) = manual_engine();

        //              ┌─────┐
        //         ┌────► ×2  │ (leaf)
        //  ┌──────┼┐   └─────┘
        //  │ +0.5  │   ┌─────┐
        //  └──────┼┘   │ ×3  │ (leaf)
        //         └────►     │
        //              └─────┘
        let src = ctx.add_processor(Box::new(OffsetNode(0.5))).unwrap();
        let g2 = ctx.add_processor(Box::new(GainNode(2.0))).unwrap();
        let g3 = ctx.add_processor(Box::new(GainNode(3.0))).unwrap();
        ctx.route(src, g2, true).unwrap();
        ctx.route(src, g3, true).unwrap();
        ctx.add_source(src).unwrap();

        ctx.test_shared().set_flags(EngineFlags::STARTED);

        let mut output = vec![0.0f32; 128 * NUM_CHANNELS];
        processor.process_interleaved(&mut output);

        // Each branch copies the source's 0.5 and scales independently:
        // master = 0.5*2 + 0.5*3 = 2.5.
        assert!(output.iter().all(|&s| (s - 2.5).abs() < 1e-6));
        assert_eq!(processor.scratch_in_use(), 0);
    }

    #[test]
    fn master_gain_scales_output() {
        let (mut ctx, mut processor) = manual_engine();

        let src = ctx.add_processor(Box::new(OffsetNode(1.0))).unwrap();
        ctx.add_source(src).unwrap();
        ctx.set_master_gain(0.25);
        ctx.test_shared().set_flags(EngineFlags::STARTED);

        let mut output = vec![0.0f32; 64 * NUM_CHANNELS];
        processor.process_interleaved(&mut output);

        assert!(output.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn on_cycle_runs_once_per_callback() {
        let (mut ctx, mut processor) = manual_engine();

        let processed = Arc::new(AtomicU32::new(0));
        let cycled = Arc::new(AtomicU32::new(0));

        let src = ctx.add_processor(Box::new(OffsetNode(0.0))).unwrap();
        let counter = ctx
            .add_processor(Box::new(CycleCounter {
                processed: processed.clone(),
                cycled: cycled.clone(),
            }))
            .unwrap();
        // Two paths reach the counter, so it processes twice per cycle
        // but must still see exactly one on_cycle.
        let fan = ctx.add_processor(Box::new(OffsetNode(0.0))).unwrap();
        ctx.route(src, counter, true).unwrap();
        ctx.route(src, fan, true).unwrap();
        ctx.route(fan, counter, true).unwrap();
        ctx.add_source(src).unwrap();

        ctx.test_shared().set_flags(EngineFlags::STARTED);

        let mut output = vec![0.0f32; 32 * NUM_CHANNELS];
        processor.process_interleaved(&mut output);

        assert_eq!(processed.load(Ordering::Acquire), 2);
        assert_eq!(cycled.load(Ordering::Acquire), 1);

        processor.process_interleaved(&mut output);
        assert_eq!(cycled.load(Ordering::Acquire), 2);
    }

    #[test]
    fn not_started_produces_silence_over_stale_memory() {
        let (mut ctx, mut processor) = manual_engine();
        let src = ctx.add_processor(Box::new(OffsetNode(1.0))).unwrap();
        ctx.add_source(src).unwrap();
        // STARTED deliberately not set.

        let mut output = vec![0.7f32; 16 * NUM_CHANNELS];
        processor.process_interleaved(&mut output);
        assert!(output.iter().all(|&s| s == 0.0));
    }

    #[test]
    #[should_panic(expected = "more than the negotiated maximum")]
    fn oversized_callback_is_fatal() {
        let (_ctx, mut processor) = manual_engine();
        let mut output = vec![0.0f32; (StreamInfo::default().max_block_frames + 1) * NUM_CHANNELS];
        processor.process_interleaved(&mut output);
    }

    #[test]
    #[should_panic(expected = "depth cap exceeded")]
    fn forced_cycle_hits_the_depth_cap() {
        let (mut ctx, mut processor) = manual_engine();

        let a = ctx.add_processor(Box::new(OffsetNode(0.0))).unwrap();
        let b = ctx.add_processor(Box::new(OffsetNode(0.0))).unwrap();
        ctx.route(a, b, true).unwrap();
        // Sidestep route-time validation to prove the RT safety net holds.
        ctx.test_shared().table.output_mask(b).set(a as usize);
        ctx.test_shared().table.input_mask(a).set(b as usize);
        ctx.add_source(a).unwrap();

        ctx.test_shared().set_flags(EngineFlags::STARTED);

        let mut output = vec![0.0f32; 4 * NUM_CHANNELS];
        processor.process_interleaved(&mut output);
    }

    #[test]
    fn removed_source_is_skipped() {
        let (mut ctx, mut processor) = manual_engine();

        let src = ctx.add_processor(Box::new(OffsetNode(1.0))).unwrap();
        ctx.add_source(src).unwrap();
        ctx.test_shared().set_flags(EngineFlags::STARTED);

        let mut output = vec![0.0f32; 8 * NUM_CHANNELS];
        processor.process_interleaved(&mut output);
        assert!(output.iter().all(|&s| s == 1.0));

        ctx.remove_processor(src).unwrap();
        processor.process_interleaved(&mut output);
        assert!(output.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn arena_reclaimed_after_deep_chain() {
        let (mut ctx, mut processor) = manual_engine();

        struct ArenaProbe;
        impl AudioProcessor for ArenaProbe {
            fn info(&self) -> ProcessorInfo {
                ProcessorInfo {
                    debug_name: "arena_probe",
                    ..Default::default()
                }
            }
            fn process(&mut self, _sample_rate: f64, _frames: usize, _buffer: &mut [f32]) {}
        }

        let a = ctx.add_processor(Box::new(ArenaProbe)).unwrap();
        let b = ctx.add_processor(Box::new(ArenaProbe)).unwrap();
        let c = ctx.add_processor(Box::new(ArenaProbe)).unwrap();
        ctx.route(a, b, true).unwrap();
        ctx.route(b, c, true).unwrap();
        ctx.add_source(a).unwrap();
        ctx.test_shared().set_flags(EngineFlags::STARTED);

        let mut output = vec![0.0f32; 512 * NUM_CHANNELS];
        processor.process_interleaved(&mut output);

        // Fully reclaimed at the end of the callback regardless of depth.
        assert_eq!(processor.scratch_in_use(), 0);
    }
}
