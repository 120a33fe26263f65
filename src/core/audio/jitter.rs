//! Playback scheduling for synthesized audio arriving with irregular timing.
//!
//! Frames are placed back to back on a virtual timeline measured by the output
//! clock. The first frame of a speaking turn starts `lead_time` after its arrival;
//! every later frame starts exactly where the previous one ended. When the
//! playhead falls behind the clock the schedule resnaps to `now + lead_time`
//! instead of compressing time to catch up.
//!
//! Single owner: the provider-to-device task of one session. No locking.

use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::frame::{AudioFrame, DEFAULT_SAMPLE_RATE, FrameError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterConfig {
    /// Buffering margin applied at the start of a turn and after a resnap.
    pub lead_time: Duration,
    /// A turn ends when no frame arrived for this long.
    pub turn_idle_timeout: Duration,
    pub sample_rate: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            lead_time: Duration::from_millis(50),
            turn_idle_timeout: Duration::from_millis(1500),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

// ---------------------------------------------------------------------------
// Output clock
// ---------------------------------------------------------------------------

/// Monotonic output clock, measured from the moment a session started.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    origin: Instant,
}

impl PlaybackClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::start()
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Where one frame was placed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPlayback {
    pub start_time: Duration,
    pub duration: Duration,
    /// First frame of a new speaking turn.
    pub turn_started: bool,
    /// The playhead had fallen behind and was moved forward.
    pub resnapped: bool,
}

impl ScheduledPlayback {
    pub fn end_time(&self) -> Duration {
        self.start_time + self.duration
    }
}

/// Snapshot of the schedule counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub frames_scheduled: u64,
    /// Malformed buffers rejected before scheduling.
    pub frames_dropped: u64,
    pub resnaps: u64,
    pub turns: u64,
    pub playhead: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Idle,
    Speaking,
    /// End of speech was signalled; frames may still be in flight.
    Draining,
}

/// Jitter buffer holding the per-session `PlaybackSchedule`.
#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterConfig,
    playhead: Duration,
    turn: TurnState,
    last_arrival: Option<Duration>,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            playhead: Duration::ZERO,
            turn: TurnState::Idle,
            last_arrival: None,
            stats: JitterStats::default(),
        }
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    /// Next free start position on the timeline.
    pub fn playhead(&self) -> Duration {
        self.playhead
    }

    pub fn is_speaking(&self) -> bool {
        self.turn != TurnState::Idle
    }

    /// Whether previously scheduled audio is still playing at `now`.
    pub fn in_flight(&self, now: Duration) -> bool {
        self.turn != TurnState::Idle && self.playhead > now
    }

    /// Place a frame on the timeline and advance the playhead by its duration.
    pub fn schedule(&mut self, frame: &AudioFrame, now: Duration) -> ScheduledPlayback {
        self.settle(now);

        let mut turn_started = false;
        let mut resnapped = false;
        match self.turn {
            TurnState::Idle => {
                self.playhead = now + self.config.lead_time;
                self.stats.turns += 1;
                turn_started = true;
            }
            TurnState::Speaking | TurnState::Draining => {
                if self.playhead < now {
                    self.playhead = now + self.config.lead_time;
                    self.stats.resnaps += 1;
                    resnapped = true;
                }
            }
        }
        self.turn = TurnState::Speaking;

        let duration = frame.duration();
        let start_time = self.playhead;
        self.playhead += duration;
        self.last_arrival = Some(now);
        self.stats.frames_scheduled += 1;
        self.stats.playhead = self.playhead;

        ScheduledPlayback {
            start_time,
            duration,
            turn_started,
            resnapped,
        }
    }

    /// Schedule a raw PCM buffer. Zero-length and odd-length buffers are
    /// counted and dropped without touching the playhead.
    pub fn schedule_pcm(&mut self, data: Bytes, now: Duration) -> Option<ScheduledPlayback> {
        match AudioFrame::from_pcm(data, self.config.sample_rate) {
            Ok(frame) => Some(self.schedule(&frame, now)),
            Err(e) => {
                self.record_drop(&e);
                None
            }
        }
    }

    /// Explicit end-of-speech. Outstanding frames keep playing; the turn state
    /// resets once the playhead has been reached.
    pub fn end_turn(&mut self, now: Duration) {
        if self.turn == TurnState::Speaking {
            self.turn = TurnState::Draining;
        }
        self.settle(now);
    }

    /// Drop all turn state immediately (session teardown, barge-in).
    pub fn reset(&mut self) {
        self.turn = TurnState::Idle;
        self.playhead = Duration::ZERO;
        self.last_arrival = None;
        self.stats.playhead = Duration::ZERO;
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    fn settle(&mut self, now: Duration) {
        if self.turn == TurnState::Speaking {
            let idle = self
                .last_arrival
                .is_some_and(|last| now.saturating_sub(last) >= self.config.turn_idle_timeout);
            if idle {
                self.turn = TurnState::Draining;
            }
        }
        if self.turn == TurnState::Draining && now >= self.playhead {
            debug!(turns = self.stats.turns, "Speaking turn drained");
            self.turn = TurnState::Idle;
            self.last_arrival = None;
        }
    }

    fn record_drop(&mut self, error: &FrameError) {
        self.stats.frames_dropped += 1;
        debug!(
            error = %error,
            dropped = self.stats.frames_dropped,
            "Dropping malformed audio frame"
        );
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(JitterConfig::default())
    }
}
