use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::path::Path;
use std::sync::{Arc, Mutex};

use cadenza_core::node::{AudioProcessor, ProcessorInfo};
use cadenza_core::wav::{WavError, WavFileReader, WavReadStream};
use cadenza_core::worker::{WorkerHandle, WorkerTask};
use cadenza_core::{FILE_CHUNK_FRAMES, NUM_CHANNELS};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PlayerFlags: u32 {
        const LOOPING = 1 << 0;
        const FINISHED = 1 << 1;
        const SEEK_REQUESTED = 1 << 2;
        const RESET_REQUESTED = 1 << 3;
    }
}

/// One of the player's two streaming chunk buffers.
///
/// `frames` is the synchronization point: the loader fills the samples and
/// then stores the frame count (release); the RT thread loads the count
/// (acquire) before reading, and stores zero (release) once it has drained
/// the buffer, handing it back to the loader.
struct ChunkBuffer {
    samples: UnsafeCell<Box<[f32]>>,
    frames: AtomicUsize,
}

// SAFETY: governed by the `frames` protocol above.
unsafe impl Sync for ChunkBuffer {}

impl ChunkBuffer {
    fn new() -> Self {
        Self {
            samples: UnsafeCell::new(vec![0.0; FILE_CHUNK_FRAMES * NUM_CHANNELS].into_boxed_slice()),
            frames: AtomicUsize::new(0),
        }
    }
}

struct Loader {
    reader: Box<dyn WavReadStream>,
    /// The next file frame the loader will read.
    next_frame: u64,
}

/// The shared state of a WAV player: flags and transport position for the
/// control thread, chunk buffers for the loader and the RT thread.
pub struct WavPlayerState {
    flags: AtomicU32,
    current_frame: AtomicU64,
    total_frames: AtomicU64,
    /// Total frames mixed into the graph since creation; unlike
    /// `current_frame` this never wraps on loop.
    frames_played: AtomicU64,
    seek_target: AtomicU64,
    /// The buffer the RT thread is currently draining (0 or 1).
    current_buffer: AtomicUsize,
    /// Bumped whenever a seek or reset invalidates the buffered chunks;
    /// tells the RT thread to discard its local read cursor.
    generation: AtomicU64,
    buffers: [ChunkBuffer; 2],
    loader: Mutex<Loader>,
}

impl WavPlayerState {
    pub fn current_frame(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Acquire)
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.player_flags().contains(PlayerFlags::FINISHED)
    }

    pub fn is_looping(&self) -> bool {
        self.player_flags().contains(PlayerFlags::LOOPING)
    }

    pub fn set_looping(&self, looping: bool) {
        if looping {
            self.flags
                .fetch_or(PlayerFlags::LOOPING.bits(), Ordering::AcqRel);
        } else {
            self.flags
                .fetch_and(!PlayerFlags::LOOPING.bits(), Ordering::AcqRel);
        }
    }

    /// Request a seek. The next chunk load honours it and resets the
    /// playback position; a buffer already handed to the RT thread plays
    /// out first, so the audible jump lands within one chunk.
    pub fn seek(&self, frame: u64) {
        self.seek_target.store(frame, Ordering::Release);
        self.flags
            .fetch_or(PlayerFlags::SEEK_REQUESTED.bits(), Ordering::AcqRel);
        self.flags
            .fetch_and(!PlayerFlags::FINISHED.bits(), Ordering::AcqRel);
    }

    /// Request a rewind to the start of the stream.
    pub fn reset(&self) {
        self.flags
            .fetch_or(PlayerFlags::RESET_REQUESTED.bits(), Ordering::AcqRel);
        self.flags
            .fetch_and(!PlayerFlags::FINISHED.bits(), Ordering::AcqRel);
    }

    fn player_flags(&self) -> PlayerFlags {
        PlayerFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Fill every drained buffer from the stream. Runs under the loader
    /// lock, on the worker pool (or inline at creation time).
    fn load_chunks(&self) {
        let mut loader = self.loader.lock().unwrap();

        let flags = self.player_flags();
        if flags.contains(PlayerFlags::RESET_REQUESTED) {
            self.flags
                .fetch_and(!PlayerFlags::RESET_REQUESTED.bits(), Ordering::AcqRel);
            self.seek_loader(&mut loader, 0);
        } else if flags.contains(PlayerFlags::SEEK_REQUESTED) {
            self.flags
                .fetch_and(!PlayerFlags::SEEK_REQUESTED.bits(), Ordering::AcqRel);
            let target = self.seek_target.load(Ordering::Acquire);
            self.seek_loader(&mut loader, target);
        }

        for buffer in self.buffers.iter() {
            if buffer.frames.load(Ordering::Acquire) != 0 {
                continue;
            }

            // SAFETY: a buffer with a zero frame count belongs to the
            // loader, and the loader lock serializes loaders.
            let samples = unsafe { &mut **buffer.samples.get() };
            let frames = self.read_wrapping(&mut loader, samples);

            if frames > 0 {
                buffer.frames.store(frames, Ordering::Release);
            }
        }
    }

    fn seek_loader(&self, loader: &mut Loader, frame: u64) {
        let total = self.total_frames.load(Ordering::Acquire);
        let frame = if total > 0 { frame % total } else { 0 };

        if let Err(e) = loader.reader.seek(frame) {
            panic!("wav player seek failed: {e}");
        }
        loader.next_frame = frame;
        self.current_frame.store(frame, Ordering::Release);

        // Anything already buffered belongs to the old position.
        for buffer in self.buffers.iter() {
            buffer.frames.store(0, Ordering::Release);
        }
        self.current_buffer.store(0, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Read up to one chunk, wrapping at end-of-stream when looping.
    /// Returns the number of frames placed in `samples`.
    fn read_wrapping(&self, loader: &mut Loader, samples: &mut [f32]) -> usize {
        let mut filled = 0;

        while filled < FILE_CHUNK_FRAMES {
            let region = &mut samples[filled * NUM_CHANNELS..];
            let frames = match loader.reader.read(region) {
                Ok(frames) => frames,
                Err(e) => panic!("wav player read failed: {e}"),
            };
            filled += frames;
            loader.next_frame += frames as u64;

            if filled == FILE_CHUNK_FRAMES {
                break;
            }

            // End of stream inside the chunk.
            if !self.player_flags().contains(PlayerFlags::LOOPING) {
                break;
            }

            // An empty stream cannot make progress by wrapping.
            if frames == 0 && loader.next_frame == 0 {
                break;
            }

            if let Err(e) = loader.reader.seek(0) {
                panic!("wav player seek failed: {e}");
            }
            loader.next_frame = 0;
        }

        filled
    }
}

struct LoadTask {
    state: Arc<WavPlayerState>,
}

impl WorkerTask for LoadTask {
    fn run(&self) {
        self.state.load_chunks();
    }
}

/// Streams interleaved stereo f32 from a file in fixed 4096-frame chunks.
///
/// Double-buffered: while the RT thread drains one chunk buffer, the
/// worker pool refills the other. Both buffers are preloaded at creation.
/// The player *mixes* into its buffer rather than overwriting, so it can
/// share a branch with other sources.
pub struct WavPlayerNode {
    state: Arc<WavPlayerState>,
    task: Arc<LoadTask>,
    worker: WorkerHandle,
    /// Read position within the active chunk buffer. RT-thread local.
    cursor: usize,
    /// Mirror of `state.generation`; a mismatch invalidates `cursor`.
    generation: u64,
}

impl WavPlayerNode {
    /// Create a player over an open stream and preload both chunk
    /// buffers.
    pub fn new(reader: Box<dyn WavReadStream>, looping: bool, worker: WorkerHandle) -> Self {
        let total_frames = reader.total_frames();

        let state = Arc::new(WavPlayerState {
            flags: AtomicU32::new(if looping {
                PlayerFlags::LOOPING.bits()
            } else {
                PlayerFlags::empty().bits()
            }),
            current_frame: AtomicU64::new(0),
            total_frames: AtomicU64::new(total_frames),
            frames_played: AtomicU64::new(0),
            seek_target: AtomicU64::new(0),
            current_buffer: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            buffers: [ChunkBuffer::new(), ChunkBuffer::new()],
            loader: Mutex::new(Loader {
                reader,
                next_frame: 0,
            }),
        });

        state.load_chunks();

        Self {
            task: Arc::new(LoadTask {
                state: Arc::clone(&state),
            }),
            state,
            worker,
            cursor: 0,
            generation: 0,
        }
    }

    /// Open a 32-bit float stereo WAV file and create a player for it.
    pub fn from_file(
        path: impl AsRef<Path>,
        looping: bool,
        worker: WorkerHandle,
    ) -> Result<Self, WavError> {
        log::info!("creating wav player for {}", path.as_ref().display());
        let reader = WavFileReader::open(path)?;
        Ok(Self::new(Box::new(reader), looping, worker))
    }

    pub fn state(&self) -> &Arc<WavPlayerState> {
        &self.state
    }
}

impl AudioProcessor for WavPlayerNode {
    fn info(&self) -> ProcessorInfo {
        ProcessorInfo {
            debug_name: "wav_player",
            ..Default::default()
        }
    }

    fn process(&mut self, _sample_rate: f64, frames: usize, buffer: &mut [f32]) {
        let flags = self.state.player_flags();
        if flags.contains(PlayerFlags::FINISHED) {
            return;
        }

        let generation = self.state.generation.load(Ordering::Acquire);
        if generation != self.generation {
            // A seek or reset invalidated whatever this cursor pointed at.
            self.generation = generation;
            self.cursor = 0;
        }

        let active = self.state.current_buffer.load(Ordering::Acquire);
        let available = self.state.buffers[active].frames.load(Ordering::Acquire);

        if available == 0 {
            // The loader has not caught up (or the stream is exhausted).
            if !flags.contains(PlayerFlags::LOOPING)
                && self.state.current_frame.load(Ordering::Acquire)
                    >= self.state.total_frames.load(Ordering::Acquire)
            {
                self.state
                    .flags
                    .fetch_or(PlayerFlags::FINISHED.bits(), Ordering::AcqRel);
            }
            return;
        }

        // SAFETY: a buffer with a nonzero frame count belongs to the RT
        // thread until it stores zero back.
        let chunk = unsafe { &**self.state.buffers[active].samples.get() };

        let remaining = available - self.cursor;
        let frames_this_time = remaining.min(frames);

        for i in 0..frames_this_time {
            let src = (self.cursor + i) * NUM_CHANNELS;
            let dst = i * NUM_CHANNELS;
            buffer[dst] += chunk[src];
            buffer[dst + 1] += chunk[src + 1];
        }

        self.cursor += frames_this_time;

        let total = self.state.total_frames.load(Ordering::Acquire);
        let current = self
            .state
            .current_frame
            .fetch_add(frames_this_time as u64, Ordering::AcqRel)
            + frames_this_time as u64;
        if flags.contains(PlayerFlags::LOOPING) && total > 0 && current >= total {
            // Wrapped past the end of the file.
            self.state
                .current_frame
                .store(current % total, Ordering::Release);
        }
        self.state
            .frames_played
            .fetch_add(frames_this_time as u64, Ordering::AcqRel);

        if self.cursor >= available {
            // Active buffer drained: hand it back to the loader and flip.
            self.state.buffers[active].frames.store(0, Ordering::Release);
            self.state
                .current_buffer
                .store(1 - active, Ordering::Release);
            self.cursor = 0;

            self.worker.defer(self.task.clone());
        }
    }
}
