//! A cpal output backend for Cadenza.
//!
//! Opens the default (or a named) output device with a single interleaved
//! stereo f32 stream and drives the [`EngineProcessor`] from the device's
//! data callback. Device blocks larger than the negotiated maximum are
//! split into engine-sized chunks before processing.

use core::num::NonZeroU32;
use core::time::Duration;
use std::sync::mpsc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer, Split};
use thiserror::Error;

use cadenza_core::{StreamInfo, DEFAULT_MAX_BLOCK_FRAMES, DEFAULT_SAMPLE_RATE, NUM_CHANNELS};
use cadenza_graph::backend::{AudioBackend, DeviceInfo};
use cadenza_graph::{EngineCtx, EngineProcessor};

const BUILD_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// An engine context driven by the cpal backend.
pub type CpalEngineCtx = EngineCtx<CpalBackend>;

/// The configuration of a cpal output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CpalConfig {
    /// The name of the output device to use. Set to `None` to use the
    /// system's default output device.
    pub device_name: Option<String>,

    /// The desired sample rate. Set to `None` to use the device's default
    /// rate.
    ///
    /// By default this is set to `Some(48_000)`.
    pub desired_sample_rate: Option<u32>,

    /// The desired block size of the audio stream. This also bounds the
    /// frames the engine sees per callback: larger device blocks are
    /// split.
    ///
    /// By default this is set to `1024`.
    pub block_frames: u32,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            desired_sample_rate: Some(DEFAULT_SAMPLE_RATE),
            block_frames: DEFAULT_MAX_BLOCK_FRAMES as u32,
        }
    }
}

/// An error when starting a cpal output stream.
#[derive(Debug, Error)]
pub enum StreamStartError {
    #[error("no suitable audio output device was found")]
    NoDevice,
    #[error("failed to query output configurations: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),
    #[error("the device has no stereo f32 output configuration")]
    NoSuitableConfig,
    #[error("failed to build the output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("failed to start the output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// A cpal backend handle. Dropping it stops the stream.
pub struct CpalBackend {
    from_err_rx: mpsc::Receiver<cpal::StreamError>,
    to_stream_tx: ringbuf::HeapProd<EngineProcessor>,
    _stream: cpal::Stream,
}

impl AudioBackend for CpalBackend {
    type Config = CpalConfig;
    type StartStreamError = StreamStartError;
    type StreamError = cpal::StreamError;

    fn output_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();

        let default_name = host
            .default_output_device()
            .and_then(|device| device.name().ok());

        let Ok(devices) = host.output_devices() else {
            log::warn!("failed to enumerate audio output devices");
            return Vec::new();
        };

        devices
            .filter_map(|device| {
                let name = device.name().ok()?;
                let channels = device
                    .default_output_config()
                    .map(|config| config.channels())
                    .unwrap_or(0);
                let is_default = Some(&name) == default_name.as_ref();

                Some(DeviceInfo {
                    name,
                    channels,
                    is_default,
                })
            })
            .collect()
    }

    fn start_stream(config: Self::Config) -> Result<(Self, StreamInfo), Self::StartStreamError> {
        let host = cpal::default_host();

        let device = match &config.device_name {
            Some(name) => host
                .output_devices()
                .ok()
                .and_then(|mut devices| {
                    devices.find(|device| device.name().map(|n| &n == name).unwrap_or(false))
                })
                .or_else(|| {
                    log::warn!("output device '{name}' not found, falling back to default");
                    host.default_output_device()
                }),
            None => host.default_output_device(),
        }
        .ok_or(StreamStartError::NoDevice)?;

        log::info!(
            "using audio output device: {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );

        let range = device
            .supported_output_configs()?
            .find(|range| {
                range.channels() as usize == NUM_CHANNELS
                    && range.sample_format() == cpal::SampleFormat::F32
            })
            .ok_or(StreamStartError::NoSuitableConfig)?;

        let supported_config = match config.desired_sample_rate {
            Some(rate) => range
                .clone()
                .try_with_sample_rate(cpal::SampleRate(rate))
                .unwrap_or_else(|| range.with_max_sample_rate()),
            None => range.with_max_sample_rate(),
        };

        let sample_rate = supported_config.sample_rate().0;
        let max_block_frames = config.block_frames.max(1) as usize;

        let buffer_size = match supported_config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max }
                if (*min..=*max).contains(&config.block_frames) =>
            {
                cpal::BufferSize::Fixed(config.block_frames)
            }
            _ => cpal::BufferSize::Default,
        };

        let stream_config = cpal::StreamConfig {
            channels: NUM_CHANNELS as u16,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size,
        };

        log::info!(
            "starting cpal output stream: {} Hz, block size {:?}",
            sample_rate,
            stream_config.buffer_size
        );

        let (to_stream_tx, mut from_ctx_rx) = ringbuf::HeapRb::<EngineProcessor>::new(1).split();
        let (err_tx, from_err_rx) = mpsc::channel();

        let mut processor: Option<EngineProcessor> = None;

        let stream = device.build_output_stream(
            &stream_config,
            move |output: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                if processor.is_none() {
                    processor = from_ctx_rx.try_pop();
                }

                match processor.as_mut() {
                    Some(processor) => {
                        // The device may deliver more frames than the
                        // engine's negotiated maximum; feed it in chunks.
                        for chunk in output.chunks_mut(max_block_frames * NUM_CHANNELS) {
                            processor.process_interleaved(chunk);
                        }
                    }
                    None => output.fill(0.0),
                }
            },
            move |err| {
                log::error!("audio output stream error: {err}");
                let _ = err_tx.send(err);
            },
            Some(BUILD_STREAM_TIMEOUT),
        )?;

        stream.play()?;

        let stream_info = StreamInfo {
            sample_rate: NonZeroU32::new(sample_rate)
                .unwrap_or(NonZeroU32::new(DEFAULT_SAMPLE_RATE).unwrap()),
            sample_rate_recip: (sample_rate as f64).recip(),
            max_block_frames,
            num_out_channels: NUM_CHANNELS,
            output_device_name: device.name().ok(),
        };

        Ok((
            Self {
                from_err_rx,
                to_stream_tx,
                _stream: stream,
            },
            stream_info,
        ))
    }

    fn set_processor(&mut self, processor: EngineProcessor) {
        if self.to_stream_tx.try_push(processor).is_err() {
            log::error!("cpal backend already received a processor");
        }
    }

    fn poll_status(&mut self) -> Result<(), Self::StreamError> {
        match self.from_err_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}
