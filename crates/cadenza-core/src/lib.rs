pub mod arena;
pub mod bitset;
pub mod dsp;
pub mod node;
pub mod wav;
pub mod worker;

use core::num::NonZeroU32;

/// The maximum number of processor slots in an engine.
pub const MAX_PROCESSORS: usize = 4096;

/// The default maximum number of frames delivered per RT callback.
pub const DEFAULT_MAX_BLOCK_FRAMES: usize = 1024;

/// The default output sample rate requested from the audio backend.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// The number of frames in one unit of file I/O (WAV player chunk loads
/// and audio renderer chunk writes).
pub const FILE_CHUNK_FRAMES: usize = 4096;

/// The default size of the RT scratch arena in kibibytes.
pub const DEFAULT_SCRATCH_ARENA_KB: usize = 512;

/// The number of channels in every buffer that crosses the node protocol.
/// The engine is natively interleaved stereo end-to-end.
pub const NUM_CHANNELS: usize = 2;

/// The index of a processor slot in the engine's processor table.
///
/// IDs are stable for the lifetime of the slot. After a slot is removed
/// and reclaimed, its ID may be reissued by a later insert.
pub type ProcessorId = u16;

/// Information about a running audio stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub sample_rate: NonZeroU32,
    /// The reciprocal of the sample rate.
    pub sample_rate_recip: f64,
    /// The maximum number of frames the backend will deliver in a single
    /// RT callback. Callbacks exceeding this are a contract violation.
    pub max_block_frames: usize,
    pub num_out_channels: usize,
    /// The name of the output audio device, if known.
    pub output_device_name: Option<String>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            sample_rate: NonZeroU32::new(DEFAULT_SAMPLE_RATE).unwrap(),
            sample_rate_recip: (DEFAULT_SAMPLE_RATE as f64).recip(),
            max_block_frames: DEFAULT_MAX_BLOCK_FRAMES,
            num_out_channels: NUM_CHANNELS,
            output_device_name: None,
        }
    }
}
