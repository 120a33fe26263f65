use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Sample rate agreed with the voice provider for all PCM traffic.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Bytes per sample for signed 16-bit PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Reasons a buffer is rejected as an audio frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("audio frame is empty")]
    Empty,

    #[error("audio frame has odd byte length {0}")]
    OddLength(usize),
}

/// A buffer of signed 16-bit little-endian PCM samples, mono.
///
/// Frames carry no timestamp; ordering comes from arrival order on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
    sample_rate: u32,
}

impl AudioFrame {
    /// Wrap raw PCM bytes, rejecting zero-length and odd-length buffers.
    pub fn from_pcm(data: Bytes, sample_rate: u32) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        if data.len() % BYTES_PER_SAMPLE != 0 {
            return Err(FrameError::OddLength(data.len()));
        }
        Ok(Self { data, sample_rate })
    }

    /// Build a frame from decoded samples.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Result<Self, FrameError> {
        let mut data = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self::from_pcm(Bytes::from(data), sample_rate)
    }

    /// A frame of digital silence with `sample_count` samples.
    pub fn silence(sample_count: usize, sample_rate: u32) -> Result<Self, FrameError> {
        Self::from_pcm(
            Bytes::from(vec![0u8; sample_count * BYTES_PER_SAMPLE]),
            sample_rate,
        )
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback duration: `sample_count / sample_rate`.
    pub fn duration(&self) -> Duration {
        let nanos = self.sample_count() as u64 * 1_000_000_000 / u64::from(self.sample_rate);
        Duration::from_nanos(nanos)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Decode the little-endian payload into samples.
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }
}
