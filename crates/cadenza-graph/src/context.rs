use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once, OnceLock, Weak};
use std::time::{Duration, Instant};

use portable_atomic::AtomicF32;

use cadenza_core::bitset::AtomicBitSet;
use cadenza_core::node::AudioProcessor;
use cadenza_core::worker::{WorkerHandle, WorkerPool, WorkerTask};
use cadenza_core::{ProcessorId, StreamInfo, DEFAULT_SCRATCH_ARENA_KB};

use crate::backend::AudioBackend;
use crate::error::{NodeError, RouteError, StartStreamError, StopStreamError};
use crate::processor::EngineProcessor;
use crate::table::ProcessorTable;

bitflags::bitflags! {
    /// The engine lifecycle flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineFlags: u32 {
        const INITIALIZED = 1 << 0;
        const STARTED = 1 << 1;
        /// Set by [`EngineCtx::stop_stream`]; tells the RT thread to fade
        /// out and acknowledge.
        const STOP_REQUESTED = 1 << 2;
        /// Set by the RT thread once it has silenced its output after a
        /// stop request.
        const AUDIO_THREAD_SILENCED = 1 << 3;
    }
}

/// The configuration of an engine context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// The master output gain in the range `[0.0, 1.0]`.
    pub master_gain: f32,

    /// The size of the RT scratch arena in kibibytes.
    ///
    /// The arena bounds per-callback traversal memory to
    /// `depth · branches · block size`; the default of 512 KiB holds 64
    /// stereo branch buffers of 1024 frames.
    pub scratch_arena_kb: usize,

    /// The number of threads in the off-RT worker pool.
    ///
    /// By default this is set to `4`.
    pub worker_threads: usize,

    /// The capacity of the worker pool's task queue.
    ///
    /// By default this is set to `64`.
    pub worker_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            master_gain: 1.0,
            scratch_arena_kb: DEFAULT_SCRATCH_ARENA_KB,
            worker_threads: 4,
            worker_queue_capacity: 64,
        }
    }
}

/// State shared between the control thread, the RT thread and (through
/// the worker pool) the worker threads.
pub(crate) struct EngineShared {
    flags: AtomicU32,
    pub(crate) master_gain: AtomicF32,
    sample_rate: AtomicF32,
    pub(crate) table: ProcessorTable,
    /// The set of traversal roots.
    pub(crate) sources: AtomicBitSet,
    pub(crate) worker: WorkerPool,
    /// Gates the control thread during the stop handshake. The RT side
    /// never locks it; it only signals the condvar.
    stop_lock: Mutex<()>,
    pub(crate) stop_cond: Condvar,
}

impl EngineShared {
    #[inline]
    pub(crate) fn flags(&self) -> EngineFlags {
        EngineFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: EngineFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: EngineFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// The panic-path stop: silence the RT thread if it is still running,
    /// with a bounded wait so a dying process cannot deadlock on its own
    /// audio thread.
    fn panic_stop(&self) {
        let flags = self.flags();
        if !flags.contains(EngineFlags::STARTED) || flags.contains(EngineFlags::STOP_REQUESTED) {
            return;
        }

        log::error!("engine panic: silencing the audio thread");
        self.set_flags(EngineFlags::STOP_REQUESTED);

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut guard = self.stop_lock.lock().unwrap();
        while !self.flags().contains(EngineFlags::AUDIO_THREAD_SILENCED) {
            let now = Instant::now();
            if now >= deadline {
                log::error!("audio thread did not acknowledge the panic stop");
                return;
            }
            let (g, _) = self.stop_cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }
}

/// The engine registered for the process-wide panic hook, if any.
static PANIC_REGISTRY: OnceLock<Mutex<Weak<EngineShared>>> = OnceLock::new();
static PANIC_HOOK_INSTALL: Once = Once::new();

struct ActiveState<B: AudioBackend> {
    backend: B,
    stream_info: StreamInfo,
}

/// An engine context: the one object a host owns.
///
/// The context is the control-plane surface (lifecycle, node creation,
/// routing, parameter plumbing); its realtime counterpart,
/// [`EngineProcessor`], is handed to the backend at stream start and runs
/// inside the host audio callback.
///
/// Dropping the context stops the stream if one is running, stops the
/// worker pool, and destroys every remaining node exactly once.
pub struct EngineCtx<B: AudioBackend> {
    shared: Arc<EngineShared>,
    active: Option<ActiveState<B>>,
    config: EngineConfig,
}

impl<B: AudioBackend> EngineCtx<B> {
    /// Create a new engine context.
    pub fn new(config: EngineConfig) -> Self {
        log::info!(
            "initializing engine (master gain {}, scratch arena {} KiB)",
            config.master_gain,
            config.scratch_arena_kb
        );

        let worker = WorkerPool::new(config.worker_threads, config.worker_queue_capacity);
        worker.start();

        let shared = Arc::new(EngineShared {
            flags: AtomicU32::new(EngineFlags::INITIALIZED.bits()),
            master_gain: AtomicF32::new(config.master_gain.clamp(0.0, 1.0)),
            sample_rate: AtomicF32::new(0.0),
            table: ProcessorTable::new(),
            sources: AtomicBitSet::new(),
            worker,
            stop_lock: Mutex::new(()),
            stop_cond: Condvar::new(),
        });

        Self {
            shared,
            active: None,
            config,
        }
    }

    /// Insert a node into the graph and return its processor ID.
    pub fn add_processor(&mut self, node: Box<dyn AudioProcessor>) -> Result<ProcessorId, NodeError> {
        let info = node.info();
        let id = self.shared.table.insert(node)?;
        log::info!("created processor {} '{}'", id, info.debug_name);
        Ok(id)
    }

    /// Remove a node from the graph.
    ///
    /// Stale edges referencing the node are swept from every peer, and the
    /// node itself is destroyed once the RT thread can no longer reach it
    /// (immediately if the stream is not running).
    pub fn remove_processor(&mut self, id: ProcessorId) -> Result<(), NodeError> {
        self.shared.sources.clear(id as usize);
        self.shared.table.remove(id, self.is_started())
    }

    /// Set or clear the directed edge `src -> dst`.
    pub fn route(
        &mut self,
        src: ProcessorId,
        dst: ProcessorId,
        enable: bool,
    ) -> Result<(), RouteError> {
        self.shared.table.route(src, dst, enable)
    }

    /// Mark `id` as a traversal root. Multiple roots are permitted; each
    /// root's traversal mixes into the master output independently.
    pub fn add_source(&mut self, id: ProcessorId) -> Result<(), NodeError> {
        if !self.shared.table.is_live(id as usize) {
            return Err(NodeError::DeadSlot(id));
        }
        self.shared.sources.set(id as usize);
        Ok(())
    }

    /// Make `id` the only traversal root.
    pub fn set_source(&mut self, id: ProcessorId) -> Result<(), NodeError> {
        if !self.shared.table.is_live(id as usize) {
            return Err(NodeError::DeadSlot(id));
        }
        self.shared.sources.clear_all();
        self.shared.sources.set(id as usize);
        Ok(())
    }

    /// Submit a task to the off-RT worker pool and wake the workers.
    pub fn submit_task(&self, task: Arc<dyn WorkerTask>) {
        self.shared.worker.defer(task);
        self.shared.worker.flush();
    }

    /// A handle nodes use to defer work onto this engine's worker pool.
    pub fn worker_handle(&self) -> WorkerHandle {
        self.shared.worker.handle()
    }

    pub fn master_gain(&self) -> f32 {
        self.shared.master_gain.load(Ordering::Acquire)
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.shared
            .master_gain
            .store(gain.clamp(0.0, 1.0), Ordering::Release);
    }

    /// The sample rate of the running stream, or `0.0` before the first
    /// start.
    pub fn sample_rate(&self) -> f32 {
        self.shared.sample_rate.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> EngineFlags {
        self.shared.flags()
    }

    pub fn is_started(&self) -> bool {
        self.shared.flags().contains(EngineFlags::STARTED)
    }

    /// Information about the running stream, if any.
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.active.as_ref().map(|state| &state.stream_info)
    }

    /// Poll the status of the running audio stream.
    pub fn poll_backend(&mut self) -> Option<Result<(), B::StreamError>> {
        self.active.as_mut().map(|state| state.backend.poll_status())
    }

    /// Open the platform audio stream and hand the RT processor to it.
    ///
    /// Only one stream can exist on a context at a time.
    pub fn start_stream(
        &mut self,
        backend_config: B::Config,
    ) -> Result<(), StartStreamError<B::StartStreamError>> {
        if self.active.is_some() {
            return Err(StartStreamError::AlreadyStarted);
        }

        // A previous stop leaves its handshake flags set (observably, by
        // design); a new stream starts from a clean slate.
        self.shared
            .clear_flags(EngineFlags::STOP_REQUESTED | EngineFlags::AUDIO_THREAD_SILENCED);
        self.shared
            .master_gain
            .store(self.config.master_gain.clamp(0.0, 1.0), Ordering::Release);

        let (mut backend, stream_info) =
            B::start_stream(backend_config).map_err(StartStreamError::Backend)?;

        log::info!(
            "starting audio stream: {} Hz, max {} frames per callback",
            stream_info.sample_rate,
            stream_info.max_block_frames
        );

        self.shared
            .sample_rate
            .store(stream_info.sample_rate.get() as f32, Ordering::Release);

        let processor = EngineProcessor::new(
            Arc::clone(&self.shared),
            &stream_info,
            self.config.scratch_arena_kb,
        );
        backend.set_processor(processor);

        self.shared.set_flags(EngineFlags::STARTED);
        self.active = Some(ActiveState {
            backend,
            stream_info,
        });

        Ok(())
    }

    /// Stop the audio stream.
    ///
    /// Signals the RT thread to fade out, blocks until it acknowledges
    /// (bounded by one RT callback), then closes the backend. The
    /// handshake flags remain set until the next [`EngineCtx::start_stream`].
    pub fn stop_stream(&mut self) -> Result<(), StopStreamError> {
        if self.active.is_none() {
            return Err(StopStreamError::NotStarted);
        }

        log::info!("stopping audio stream");
        self.shared.set_flags(EngineFlags::STOP_REQUESTED);

        // Wait for the fade-out acknowledgement. The RT thread re-signals
        // on every callback while the stop is pending, so a wakeup lost in
        // the check-then-wait window heals within one callback.
        {
            let mut guard = self.shared.stop_lock.lock().unwrap();
            while !self
                .shared
                .flags()
                .contains(EngineFlags::AUDIO_THREAD_SILENCED)
            {
                guard = self.shared.stop_cond.wait(guard).unwrap();
            }
        }

        self.shared.clear_flags(EngineFlags::STARTED);

        // Dropping the backend handle closes the stream and, with it, the
        // RT processor.
        self.active = None;

        Ok(())
    }

    /// Register this engine with the process-wide panic hook.
    ///
    /// If a panic fires anywhere in the process while this engine's stream
    /// is running, the hook silences the audio thread through the regular
    /// stop handshake (with a bounded wait) before the panic proceeds.
    /// The hook chains to whatever hook was installed before it.
    pub fn install_panic_handler(&self) {
        let registry = PANIC_REGISTRY.get_or_init(|| Mutex::new(Weak::new()));
        *registry.lock().unwrap() = Arc::downgrade(&self.shared);

        PANIC_HOOK_INSTALL.call_once(|| {
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                previous(info);

                let shared = PANIC_REGISTRY
                    .get()
                    .and_then(|registry| registry.lock().ok().and_then(|weak| weak.upgrade()));

                if let Some(shared) = shared {
                    shared.panic_stop();
                }
            }));
        });
    }
}

#[cfg(test)]
impl<B: AudioBackend> EngineCtx<B> {
    pub(crate) fn test_shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }
}

impl<B: AudioBackend> Drop for EngineCtx<B> {
    fn drop(&mut self) {
        if self.active.is_some() {
            let _ = self.stop_stream();
        }

        self.shared.worker.stop();

        // Destroy every remaining node exactly once. The stream and the
        // workers are gone, so nothing races the table anymore.
        self.shared.table.clear_all();
        self.shared.flags.store(0, Ordering::Release);

        log::info!("engine deinitialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null::{NullBackend, NullConfig};
    use cadenza_core::node::ProcessorInfo;

    struct NullNode;

    impl AudioProcessor for NullNode {
        fn info(&self) -> ProcessorInfo {
            ProcessorInfo {
                debug_name: "null",
                ..Default::default()
            }
        }

        fn process(&mut self, _sample_rate: f64, _frames: usize, _buffer: &mut [f32]) {}
    }

    #[test]
    fn init_flags() {
        let ctx = EngineCtx::<NullBackend>::new(EngineConfig::default());

        let flags = ctx.flags();
        assert!(flags.contains(EngineFlags::INITIALIZED));
        assert!(!flags.contains(EngineFlags::STARTED));
        assert!(!flags.contains(EngineFlags::STOP_REQUESTED));
        assert!(!flags.contains(EngineFlags::AUDIO_THREAD_SILENCED));
    }

    #[test]
    fn stop_without_start_is_an_error() {
        let mut ctx = EngineCtx::<NullBackend>::new(EngineConfig::default());
        assert_eq!(ctx.stop_stream(), Err(StopStreamError::NotStarted));
    }

    #[test]
    fn start_twice_is_an_error() {
        let mut ctx = EngineCtx::<NullBackend>::new(EngineConfig::default());

        ctx.start_stream(NullConfig::default()).unwrap();
        assert!(matches!(
            ctx.start_stream(NullConfig::default()),
            Err(StartStreamError::AlreadyStarted)
        ));

        ctx.stop_stream().unwrap();
    }

    #[test]
    fn stop_handshake_flags() {
        let mut ctx = EngineCtx::<NullBackend>::new(EngineConfig::default());

        ctx.start_stream(NullConfig::default()).unwrap();
        assert!(ctx.is_started());
        assert!((ctx.sample_rate() - 48_000.0).abs() < f32::EPSILON);

        ctx.stop_stream().unwrap();

        let flags = ctx.flags();
        assert!(!flags.contains(EngineFlags::STARTED));
        assert!(flags.contains(EngineFlags::STOP_REQUESTED));
        assert!(flags.contains(EngineFlags::AUDIO_THREAD_SILENCED));
        assert_eq!(ctx.master_gain(), 0.0);

        // Restart clears the handshake flags and restores the configured
        // master gain.
        ctx.start_stream(NullConfig::default()).unwrap();
        assert!(!ctx.flags().contains(EngineFlags::STOP_REQUESTED));
        assert_eq!(ctx.master_gain(), 1.0);
        ctx.stop_stream().unwrap();
    }

    #[test]
    fn source_must_be_live() {
        let mut ctx = EngineCtx::<NullBackend>::new(EngineConfig::default());
        assert_eq!(ctx.add_source(3), Err(NodeError::DeadSlot(3)));

        let id = ctx.add_processor(Box::new(NullNode)).unwrap();
        ctx.add_source(id).unwrap();

        ctx.remove_processor(id).unwrap();
        assert_eq!(ctx.set_source(id), Err(NodeError::DeadSlot(id)));
    }
}
