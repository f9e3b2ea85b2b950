use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use cadenza_core::node::{AudioProcessor, ProcessorInfo};
use cadenza_core::wav::{WavError, WavFileWriter, WavWriteStream};
use cadenza_core::worker::{WorkerHandle, WorkerTask};
use cadenza_core::{FILE_CHUNK_FRAMES, NUM_CHANNELS};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct RenderFlags: u32 {
        const RECORDING = 1 << 0;
        /// Zero the *input* buffer after capturing it, so everything
        /// downstream of the renderer hears silence.
        const MUTE = 1 << 1;
    }
}

struct RenderBuffer {
    samples: UnsafeCell<Box<[f32]>>,
}

// SAFETY: the RT thread only writes the buffer at `current_buffer`; the
// worker only reads the other one, and the flip happens on the RT thread
// after it has published the frame count for the write.
unsafe impl Sync for RenderBuffer {}

impl RenderBuffer {
    fn new() -> Self {
        Self {
            samples: UnsafeCell::new(vec![0.0; FILE_CHUNK_FRAMES * NUM_CHANNELS].into_boxed_slice()),
        }
    }
}

/// The shared state of an audio renderer.
pub struct AudioRendererState {
    flags: AtomicU32,
    /// The buffer currently accumulating input (0 or 1).
    current_buffer: AtomicUsize,
    /// Write position within the current buffer, in frames.
    cursor: AtomicUsize,
    /// Frames queued for the next file write (from the non-current
    /// buffer).
    frames_to_write: AtomicUsize,
    buffers: [RenderBuffer; 2],
    writer: Mutex<Box<dyn WavWriteStream>>,
    worker: WorkerHandle,
    /// The reusable write task; deferring it is a refcount bump, so the
    /// RT thread never allocates. Holds a weak back-reference to avoid a
    /// reference cycle.
    write_task: OnceLock<Arc<WriteTask>>,
}

impl AudioRendererState {
    pub fn is_recording(&self) -> bool {
        self.render_flags().contains(RenderFlags::RECORDING)
    }

    pub fn start_record(&self) {
        self.flags
            .fetch_or(RenderFlags::RECORDING.bits(), Ordering::AcqRel);
    }

    /// Stop recording and flush a partial chunk, if any.
    pub fn stop_record(&self) {
        self.flags
            .fetch_and(!RenderFlags::RECORDING.bits(), Ordering::AcqRel);

        let cursor = self.cursor.load(Ordering::Acquire);
        if cursor > 0 {
            self.frames_to_write.store(cursor, Ordering::Release);
            self.schedule_write();
        }
    }

    pub fn is_muted(&self) -> bool {
        self.render_flags().contains(RenderFlags::MUTE)
    }

    pub fn set_mute(&self, mute: bool) {
        if mute {
            self.flags
                .fetch_or(RenderFlags::MUTE.bits(), Ordering::AcqRel);
        } else {
            self.flags
                .fetch_and(!RenderFlags::MUTE.bits(), Ordering::AcqRel);
        }
    }

    fn render_flags(&self) -> RenderFlags {
        RenderFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Flip the active buffer, zero the fresh one, and hand the filled one
    /// to the worker pool. `frames_to_write` must already be set.
    fn schedule_write(&self) {
        let filled = self.current_buffer.load(Ordering::Acquire);
        self.current_buffer.store(1 - filled, Ordering::Release);
        self.cursor.store(0, Ordering::Release);

        // SAFETY: the buffer at `1 - filled` just became current; nothing
        // reads it until the write task for the *other* buffer runs.
        unsafe {
            (*self.buffers[1 - filled].samples.get()).fill(0.0);
        }

        let task = self.write_task.get().expect("renderer task not wired");
        self.worker.defer(task.clone());
    }

    /// Write the pending frames from the non-current buffer. Runs on the
    /// worker pool (or inline on the final flush).
    fn write_pending(&self) {
        let frames = self.frames_to_write.swap(0, Ordering::AcqRel);
        if frames == 0 {
            return;
        }

        log::info!("rendering {frames} frames");

        let index = 1 - self.current_buffer.load(Ordering::Acquire);
        // SAFETY: this buffer is not current, so the RT thread is not
        // writing it while the worker reads.
        let samples = unsafe { &(**self.buffers[index].samples.get())[..frames * NUM_CHANNELS] };

        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writer.write(samples) {
            panic!("render write failed: {e}");
        }
    }
}

struct WriteTask {
    state: Weak<AudioRendererState>,
}

impl WorkerTask for WriteTask {
    fn run(&self) {
        if let Some(state) = self.state.upgrade() {
            state.write_pending();
        }
    }
}

/// Accumulates the incoming signal into chunk-sized buffers and streams
/// them to a file from the worker pool.
///
/// Input is *summed* into the current buffer, so several branches routed
/// into one renderer mix in the file. With [`AudioRendererState::set_mute`]
/// the renderer still captures but passes silence downstream.
pub struct AudioRendererNode {
    state: Arc<AudioRendererState>,
    /// Frames seen by `process` this cycle; consumed by `on_cycle`.
    frames_this_cycle: usize,
}

impl AudioRendererNode {
    /// Create a renderer over an open write stream.
    pub fn new(writer: Box<dyn WavWriteStream>, worker: WorkerHandle) -> Self {
        let state = Arc::new(AudioRendererState {
            flags: AtomicU32::new(0),
            current_buffer: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            frames_to_write: AtomicUsize::new(0),
            buffers: [RenderBuffer::new(), RenderBuffer::new()],
            writer: Mutex::new(writer),
            worker,
            write_task: OnceLock::new(),
        });

        let _ = state.write_task.set(Arc::new(WriteTask {
            state: Arc::downgrade(&state),
        }));

        Self {
            state,
            frames_this_cycle: 0,
        }
    }

    /// Create a renderer writing a 32-bit float stereo WAV file.
    pub fn to_file(
        path: impl AsRef<Path>,
        sample_rate: u32,
        worker: WorkerHandle,
    ) -> Result<Self, WavError> {
        log::info!("creating audio renderer for {}", path.as_ref().display());
        let writer = WavFileWriter::create(path, sample_rate)?;
        Ok(Self::new(Box::new(writer), worker))
    }

    pub fn state(&self) -> &Arc<AudioRendererState> {
        &self.state
    }
}

impl AudioProcessor for AudioRendererNode {
    fn info(&self) -> ProcessorInfo {
        ProcessorInfo {
            debug_name: "audio_renderer",
            uses_on_cycle: true,
        }
    }

    fn process(&mut self, _sample_rate: f64, frames: usize, buffer: &mut [f32]) {
        let flags = self.state.render_flags();
        if !flags.contains(RenderFlags::RECORDING) {
            return;
        }

        let current = self.state.current_buffer.load(Ordering::Acquire);
        let cursor = self.state.cursor.load(Ordering::Acquire);

        // SAFETY: the RT thread owns the current buffer.
        let out = unsafe { &mut **self.state.buffers[current].samples.get() };

        let frames_to_capture = frames.min(FILE_CHUNK_FRAMES - cursor);
        for i in 0..frames_to_capture {
            let dst = (cursor + i) * NUM_CHANNELS;
            let src = i * NUM_CHANNELS;
            out[dst] += buffer[src];
            out[dst + 1] += buffer[src + 1];
        }

        if flags.contains(RenderFlags::MUTE) {
            buffer[..frames * NUM_CHANNELS].fill(0.0);
        }

        self.frames_this_cycle = frames;
    }

    fn on_cycle(&mut self) {
        if self.frames_this_cycle == 0 {
            return;
        }
        let frames_this_cycle = core::mem::take(&mut self.frames_this_cycle);

        let old_cursor = self
            .state
            .cursor
            .fetch_add(frames_this_cycle, Ordering::AcqRel);

        if old_cursor + frames_this_cycle >= FILE_CHUNK_FRAMES {
            log::info!(
                "scheduling render write (full chunk, previous cursor {old_cursor}, frames this cycle {frames_this_cycle})"
            );
            self.state
                .frames_to_write
                .store(FILE_CHUNK_FRAMES, Ordering::Release);
            self.state.schedule_write();
        }
    }
}

impl Drop for AudioRendererNode {
    fn drop(&mut self) {
        // Still recording on shutdown: flush the remaining partial chunk
        // directly, since the worker pool may already be gone.
        if self.state.is_recording() {
            let cursor = self.state.cursor.load(Ordering::Acquire);
            if cursor > 0 {
                self.state.frames_to_write.store(cursor, Ordering::Release);
                self.state
                    .current_buffer
                    .fetch_xor(1, Ordering::AcqRel);
                self.state.cursor.store(0, Ordering::Release);
                self.state.write_pending();
            }
            self.state
                .flags
                .fetch_and(!RenderFlags::RECORDING.bits(), Ordering::AcqRel);
        }

        log::info!("destroying audio renderer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collects everything written, for inspection.
    struct SinkStream {
        written: Arc<Mutex<Vec<f32>>>,
    }

    impl WavWriteStream for SinkStream {
        fn write(&mut self, interleaved: &[f32]) -> Result<(), WavError> {
            self.written.lock().unwrap().extend_from_slice(interleaved);
            Ok(())
        }
    }

    fn test_renderer() -> (AudioRendererNode, Arc<Mutex<Vec<f32>>>, cadenza_core::worker::WorkerPool)
    {
        let pool = cadenza_core::worker::WorkerPool::new(1, 16);
        let written = Arc::new(Mutex::new(Vec::new()));
        let node = AudioRendererNode::new(
            Box::new(SinkStream {
                written: Arc::clone(&written),
            }),
            pool.handle(),
        );
        (node, written, pool)
    }

    fn run_cycle(node: &mut AudioRendererNode, frames: usize, value: f32) -> Vec<f32> {
        let mut buffer = vec![value; frames * NUM_CHANNELS];
        node.process(48_000.0, frames, &mut buffer);
        node.on_cycle();
        buffer
    }

    #[test]
    fn ignores_input_until_recording() {
        let (mut node, written, pool) = test_renderer();

        run_cycle(&mut node, 512, 0.5);
        assert_eq!(node.state.cursor.load(Ordering::Acquire), 0);

        node.state.start_record();
        run_cycle(&mut node, 512, 0.5);
        assert_eq!(node.state.cursor.load(Ordering::Acquire), 512);

        pool.stop();
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn writes_a_full_chunk_and_continues_in_the_other_buffer() {
        let (mut node, written, pool) = test_renderer();
        pool.start();
        node.state.start_record();

        // Exactly one chunk's worth of 1024-frame cycles.
        for _ in 0..(FILE_CHUNK_FRAMES / 1024) {
            run_cycle(&mut node, 1024, 0.25);
        }

        pool.flush();
        pool.stop();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), FILE_CHUNK_FRAMES * NUM_CHANNELS);
        assert!(written.iter().all(|&s| s == 0.25));

        // The flip left the fresh buffer zeroed and the cursor at zero.
        assert_eq!(node.state.cursor.load(Ordering::Acquire), 0);
    }

    #[test]
    fn stop_record_flushes_a_partial_chunk() {
        let (mut node, written, pool) = test_renderer();
        pool.start();
        node.state.start_record();

        run_cycle(&mut node, 600, 0.5);
        node.state.stop_record();

        pool.flush();
        pool.stop();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 600 * NUM_CHANNELS);
        assert!(written.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn mute_silences_downstream_but_still_captures() {
        let (mut node, written, pool) = test_renderer();
        node.state.start_record();
        node.state.set_mute(true);

        let buffer = run_cycle(&mut node, 256, 0.7);
        assert!(buffer.iter().all(|&s| s == 0.0));

        node.state.stop_record();
        pool.start();
        pool.flush();
        pool.stop();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 256 * NUM_CHANNELS);
        assert!(written.iter().all(|&s| s == 0.7));
    }

    #[test]
    fn drop_flushes_while_recording() {
        let (mut node, written, pool) = test_renderer();
        node.state.start_record();

        run_cycle(&mut node, 100, 1.0);
        drop(node);
        pool.stop();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 100 * NUM_CHANNELS);
    }

    #[test]
    fn input_sums_across_process_calls_within_a_cycle() {
        let (mut node, written, pool) = test_renderer();
        node.state.start_record();

        // Two branches reach the renderer in one cycle; on_cycle advances
        // the cursor once.
        let mut a = vec![0.25f32; 128 * NUM_CHANNELS];
        let mut b = vec![0.5f32; 128 * NUM_CHANNELS];
        node.process(48_000.0, 128, &mut a);
        node.process(48_000.0, 128, &mut b);
        node.on_cycle();
        assert_eq!(node.state.cursor.load(Ordering::Acquire), 128);

        node.state.stop_record();
        pool.start();
        pool.flush();
        pool.stop();

        let written = written.lock().unwrap();
        assert!(written.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }
}
