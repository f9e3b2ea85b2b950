//! The WAV streaming contract consumed by the file-backed nodes, plus
//! `hound`-backed implementations for 32-bit float stereo files.
//!
//! The engine core only depends on the traits: a reader yields interleaved
//! stereo f32 frames, a writer accepts the same.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use thiserror::Error;

use crate::NUM_CHANNELS;

#[derive(Debug, Error)]
pub enum WavError {
    #[error("wav i/o error: {0}")]
    Hound(#[from] hound::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported wav format: {0}")]
    UnsupportedFormat(String),
}

/// A streaming source of interleaved stereo f32 frames.
pub trait WavReadStream: Send {
    /// The total number of frames in the stream.
    fn total_frames(&self) -> u64;

    /// Position the stream at the given frame.
    fn seek(&mut self, frame: u64) -> Result<(), WavError>;

    /// Fill `interleaved` from the current position and return the number
    /// of frames read. Returning fewer frames than requested (possibly
    /// zero) means the end of the stream was reached.
    fn read(&mut self, interleaved: &mut [f32]) -> Result<usize, WavError>;
}

/// A streaming sink of interleaved stereo f32 frames.
pub trait WavWriteStream: Send {
    fn write(&mut self, interleaved: &[f32]) -> Result<(), WavError>;
}

/// A [`WavReadStream`] over a 32-bit float stereo WAV file.
pub struct WavFileReader {
    inner: hound::WavReader<BufReader<File>>,
    total_frames: u64,
}

impl WavFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WavError> {
        let inner = hound::WavReader::open(path)?;

        let spec = inner.spec();
        if spec.channels as usize != NUM_CHANNELS
            || spec.sample_format != hound::SampleFormat::Float
            || spec.bits_per_sample != 32
        {
            return Err(WavError::UnsupportedFormat(format!(
                "expected stereo 32-bit float, got {} channel(s) of {}-bit {:?}",
                spec.channels, spec.bits_per_sample, spec.sample_format
            )));
        }

        let total_frames = inner.duration() as u64;

        Ok(Self {
            inner,
            total_frames,
        })
    }
}

impl WavReadStream for WavFileReader {
    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn seek(&mut self, frame: u64) -> Result<(), WavError> {
        self.inner.seek(frame as u32)?;
        Ok(())
    }

    fn read(&mut self, interleaved: &mut [f32]) -> Result<usize, WavError> {
        let mut samples = self.inner.samples::<f32>();
        let mut frames_read = 0;

        for frame in interleaved.chunks_exact_mut(NUM_CHANNELS) {
            let (Some(left), Some(right)) = (samples.next(), samples.next()) else {
                break;
            };
            frame[0] = left?;
            frame[1] = right?;
            frames_read += 1;
        }

        Ok(frames_read)
    }
}

/// A [`WavWriteStream`] that renders to a 32-bit float stereo WAV file.
///
/// The file header is finalized when the writer is dropped.
pub struct WavFileWriter {
    inner: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavFileWriter {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, WavError> {
        let spec = hound::WavSpec {
            channels: NUM_CHANNELS as u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        Ok(Self {
            inner: Some(hound::WavWriter::create(path, spec)?),
        })
    }
}

impl WavWriteStream for WavFileWriter {
    fn write(&mut self, interleaved: &[f32]) -> Result<(), WavError> {
        let writer = self
            .inner
            .as_mut()
            .expect("write after wav writer was finalized");

        for &sample in interleaved {
            writer.write_sample(sample)?;
        }

        Ok(())
    }
}

impl Drop for WavFileWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.inner.take() {
            if let Err(e) = writer.finalize() {
                log::error!("failed to finalize wav file: {e}");
            }
        }
    }
}
