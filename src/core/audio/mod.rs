//! Raw PCM audio primitives shared by the relay and the local harness.
//!
//! All audio is signed 16-bit little-endian mono at the rate agreed with the
//! voice provider (16 kHz by default).

mod frame;
mod jitter;
mod queue;

pub use frame::{AudioFrame, BYTES_PER_SAMPLE, DEFAULT_SAMPLE_RATE, FrameError};
pub use jitter::{
    JitterBuffer, JitterConfig, JitterStats, PlaybackClock, ScheduledPlayback,
};
pub use queue::FrameQueue;
