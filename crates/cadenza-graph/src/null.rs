//! A backend without an audio device.
//!
//! The null backend drives the [`EngineProcessor`] from a plain thread,
//! optionally paced to wall-clock time. It exists for headless hosts and
//! for the integration tests, which attach a capture channel and inspect
//! the produced blocks.

use core::convert::Infallible;
use core::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ringbuf::traits::{Consumer, Producer, Split};

use cadenza_core::{StreamInfo, DEFAULT_MAX_BLOCK_FRAMES, DEFAULT_SAMPLE_RATE, NUM_CHANNELS};

use crate::backend::{AudioBackend, DeviceInfo};
use crate::processor::EngineProcessor;

/// The configuration of a null backend stream.
pub struct NullConfig {
    pub sample_rate: u32,
    pub block_frames: usize,

    /// Pace callbacks to wall-clock time. Disable to run as fast as the
    /// engine allows (tests, faster-than-realtime drivers).
    ///
    /// By default this is set to `true`.
    pub realtime: bool,

    /// Every produced block is cloned into this channel, in callback
    /// order. When the channel is full, blocks are dropped — like a real
    /// device, the stream never stalls on its observer.
    pub capture: Option<SyncSender<Vec<f32>>>,
}

impl Default for NullConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_frames: DEFAULT_MAX_BLOCK_FRAMES,
            realtime: true,
            capture: None,
        }
    }
}

/// A backend that renders into the void.
pub struct NullBackend {
    stop: Arc<AtomicBool>,
    to_stream_tx: ringbuf::HeapProd<EngineProcessor>,
    thread: Option<JoinHandle<()>>,
}

impl AudioBackend for NullBackend {
    type Config = NullConfig;
    type StartStreamError = Infallible;
    type StreamError = Infallible;

    fn output_devices() -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            name: "null".into(),
            channels: NUM_CHANNELS as u16,
            is_default: true,
        }]
    }

    fn start_stream(config: Self::Config) -> Result<(Self, StreamInfo), Self::StartStreamError> {
        let sample_rate = NonZeroU32::new(config.sample_rate)
            .unwrap_or(NonZeroU32::new(DEFAULT_SAMPLE_RATE).unwrap());

        let stream_info = StreamInfo {
            sample_rate,
            sample_rate_recip: (sample_rate.get() as f64).recip(),
            max_block_frames: config.block_frames,
            num_out_channels: NUM_CHANNELS,
            output_device_name: Some("null".into()),
        };

        let (to_stream_tx, mut from_ctx_rx) = ringbuf::HeapRb::<EngineProcessor>::new(1).split();

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let block_period = Duration::from_secs_f64(
            config.block_frames as f64 * stream_info.sample_rate_recip,
        );
        let realtime = config.realtime;
        let capture = config.capture;
        let block_frames = config.block_frames;

        let thread = std::thread::Builder::new()
            .name("cadenza-null-audio".into())
            .spawn(move || {
                let mut processor: Option<EngineProcessor> = None;
                let mut buffer = vec![0.0f32; block_frames * NUM_CHANNELS];

                while !thread_stop.load(Ordering::Acquire) {
                    if processor.is_none() {
                        processor = from_ctx_rx.try_pop();
                    }

                    if let Some(processor) = processor.as_mut() {
                        processor.process_interleaved(&mut buffer);

                        if let Some(capture) = &capture {
                            let _ = capture.try_send(buffer.clone());
                        }
                    }

                    if realtime {
                        std::thread::sleep(block_period);
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
            .expect("failed to spawn null audio thread");

        Ok((
            Self {
                stop,
                to_stream_tx,
                thread: Some(thread),
            },
            stream_info,
        ))
    }

    fn set_processor(&mut self, processor: EngineProcessor) {
        if self.to_stream_tx.try_push(processor).is_err() {
            log::error!("null backend already received a processor");
        }
    }

    fn poll_status(&mut self) -> Result<(), Self::StreamError> {
        Ok(())
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
