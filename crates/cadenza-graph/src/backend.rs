use core::error::Error;

use cadenza_core::StreamInfo;

use crate::processor::EngineProcessor;

/// The contract between the engine and whatever delivers its callbacks.
///
/// The engine cares about three promises, not about which platform API is
/// behind them:
///
/// * The [`StreamInfo`] negotiated when the stream opens is binding for
///   the stream's whole life — the sample rate never drifts, and no
///   callback ever asks the processor for more than
///   `StreamInfo::max_block_frames` frames.
/// * Each callback drives the [`EngineProcessor`] with one interleaved
///   stereo f32 buffer. If the device wants larger blocks than the
///   negotiated maximum, the backend splits them before calling in.
/// * A backend value *is* the stream's lifetime: dropping it tears the
///   stream down, taking the processor that was handed over with it.
///   [`EngineCtx`](crate::EngineCtx) relies on this for both
///   `stop_stream` and deinit.
pub trait AudioBackend: Sized {
    /// Stream parameters the host passes through
    /// [`EngineCtx::start_stream`](crate::EngineCtx::start_stream).
    type Config;
    /// Why a stream could not be opened.
    type StartStreamError: Error;
    /// Why a running stream died.
    type StreamError: Error;

    /// Open a stream with the given configuration.
    ///
    /// On success the stream is already running; until the processor
    /// arrives via [`AudioBackend::set_processor`], its callbacks must
    /// fill the output with silence.
    fn start_stream(config: Self::Config) -> Result<(Self, StreamInfo), Self::StartStreamError>;

    /// Move the realtime processor into the running stream.
    ///
    /// The engine calls this exactly once per stream, between a
    /// successful [`AudioBackend::start_stream`] and flagging itself
    /// started.
    fn set_processor(&mut self, processor: EngineProcessor);

    /// Check on the running stream.
    ///
    /// An error means the stream has died and will deliver no further
    /// callbacks; the host decides whether to restart.
    fn poll_status(&mut self) -> Result<(), Self::StreamError>;

    /// Enumerate the output devices this backend could open.
    ///
    /// Backends without a device concept (headless drivers, test
    /// harnesses) can rely on the empty default.
    fn output_devices() -> Vec<DeviceInfo> {
        Vec::new()
    }
}

/// One entry of [`AudioBackend::output_devices`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    /// Channel count of the device's preferred configuration.
    pub channels: u16,
    /// Whether the platform would pick this device on its own.
    pub is_default: bool,
}
