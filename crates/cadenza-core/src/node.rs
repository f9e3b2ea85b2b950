/// Static information about a processor, reported once when the node is
/// inserted into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorInfo {
    /// The name of this type of node for debugging and logging purposes.
    pub debug_name: &'static str,

    /// Whether or not to call [`AudioProcessor::on_cycle`] on this node.
    ///
    /// If you do not need the per-cycle hook, leave this `false` to save
    /// the dispatch overhead.
    ///
    /// By default this is set to `false`.
    pub uses_on_cycle: bool,
}

impl Default for ProcessorInfo {
    fn default() -> Self {
        Self {
            debug_name: "unnamed",
            uses_on_cycle: false,
        }
    }
}

/// The trait describing a node in the audio-signal graph.
///
/// # Node lifecycle
///
/// 1. The user constructs the node and inserts it into the engine, which
///    calls [`AudioProcessor::info`] once and assigns a processor ID.
/// 2. While the stream runs, the RT thread invokes
///    [`AudioProcessor::process`] on every traversal that reaches the node,
///    and [`AudioProcessor::on_cycle`] once per callback after all
///    `process` calls of that cycle (only if `info().uses_on_cycle`).
/// 3. The node is dropped exactly once: either during engine deinit, or
///    (after explicit removal) once the RT thread can no longer reach it.
///
/// Parameters that other threads mutate while the RT thread is reading
/// them must be atomic scalars; writers use release stores and the RT
/// reader uses acquire loads.
pub trait AudioProcessor: Send + 'static {
    /// Return information about this node.
    fn info(&self) -> ProcessorInfo;

    /// Process `frames` frames of interleaved stereo audio in place.
    ///
    /// `buffer` has length `frames * 2`. Source nodes mix into it, effect
    /// nodes rewrite it, sink nodes may only read it; whatever is left in
    /// the buffer continues down the graph (or, at a leaf, is summed into
    /// the master mix).
    ///
    /// This runs on the RT thread: it must not block, allocate from the
    /// general heap, or take contended locks.
    fn process(&mut self, sample_rate: f64, frames: usize, buffer: &mut [f32]);

    /// Called once per RT callback after all `process` calls for this node
    /// have completed in that cycle.
    ///
    /// Used to advance per-cycle state and to enqueue worker tasks. Same
    /// restrictions as [`AudioProcessor::process`].
    fn on_cycle(&mut self) {}
}
