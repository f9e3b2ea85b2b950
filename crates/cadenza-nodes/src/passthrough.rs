use cadenza_core::node::{AudioProcessor, ProcessorInfo};

/// A node that leaves its buffer untouched.
///
/// Used as a fan-out point when multiple branches should share one
/// upstream sub-graph: route the shared input into the passthrough and the
/// passthrough into each branch.
pub struct PassthroughNode;

impl AudioProcessor for PassthroughNode {
    fn info(&self) -> ProcessorInfo {
        ProcessorInfo {
            debug_name: "passthrough",
            ..Default::default()
        }
    }

    fn process(&mut self, _sample_rate: f64, _frames: usize, _buffer: &mut [f32]) {
        // Do absolutely nothing.
    }
}
