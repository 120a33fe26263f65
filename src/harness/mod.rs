//! Local audio harness.
//!
//! Streams a WAV file to the voice provider the same way a device would and
//! records the replies into another WAV file, with no browser or AR device
//! involved. Input blocks come from a dedicated producer thread through a
//! drop-oldest [`FrameQueue`]; provider audio goes through the jitter buffer
//! and is handed to an [`AudioSink`] on its own thread with a short write
//! timeout so a slow output never stalls the provider channel.

pub mod wav;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::core::audio::{
    AudioFrame, FrameError, FrameQueue, JitterBuffer, JitterConfig, JitterStats, PlaybackClock,
    ScheduledPlayback,
};
use crate::core::provider::{
    CallClient, ProviderChannel, ProviderCommand, ProviderError, ProviderEvent, ProviderFrame,
    UpstreamConnector, UpstreamTarget, WebSocketConnector,
};
use crate::errors::{RelayError, RelayResult};
use crate::utils::{UrlValidationError, validate_upstream_url};

pub use wav::{BLOCK_DURATION, WavSink, WavSource, block_samples};

/// Capacity of the input hand-off queue, in blocks.
pub const INPUT_QUEUE_CAPACITY: usize = 20;
/// Silence is sent when no input block arrived for this long.
pub const SILENCE_AFTER: Duration = Duration::from_secs(1);
pub const SINK_WRITE_TIMEOUT: Duration = Duration::from_millis(100);
/// Default time to keep listening after the input file is exhausted.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(10);

const SINK_QUEUE_CAPACITY: usize = 4;
const PROVIDER_CLOSE_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported audio: {0}")]
    Format(String),

    #[error("Invalid audio frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Audio sink is closed")]
    SinkClosed,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Invalid upstream URL: {0}")]
    Url(#[from] UrlValidationError),

    #[error("Failed to start {0} thread: {1}")]
    Thread(&'static str, std::io::Error),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

// =============================================================================
// Output sink
// =============================================================================

/// Blocking audio output, driven from its own thread.
pub trait AudioSink: Send + 'static {
    fn write(&mut self, playback: &ScheduledPlayback, frame: &AudioFrame) -> HarnessResult<()>;
    fn finish(&mut self) -> HarnessResult<()>;
}

/// Owns the sink thread. Frames that cannot be queued within the write
/// timeout are dropped and counted as overruns.
pub struct SinkWriter {
    tx: mpsc::Sender<(ScheduledPlayback, AudioFrame)>,
    thread: thread::JoinHandle<HarnessResult<()>>,
    timeout: Duration,
    overruns: u64,
}

impl SinkWriter {
    pub fn spawn(sink: impl AudioSink, timeout: Duration) -> HarnessResult<Self> {
        let (tx, mut rx) = mpsc::channel::<(ScheduledPlayback, AudioFrame)>(SINK_QUEUE_CAPACITY);
        let mut sink = sink;
        let thread = thread::Builder::new()
            .name("harness-sink".to_string())
            .spawn(move || {
                while let Some((playback, frame)) = rx.blocking_recv() {
                    sink.write(&playback, &frame)?;
                }
                sink.finish()
            })
            .map_err(|e| HarnessError::Thread("sink", e))?;
        Ok(Self {
            tx,
            thread,
            timeout,
            overruns: 0,
        })
    }

    pub async fn submit(&mut self, playback: ScheduledPlayback, frame: AudioFrame) -> RelayResult<()> {
        match self.tx.send_timeout((playback, frame), self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.overruns += 1;
                Err(RelayError::AudioOverrun {
                    dropped: self.overruns,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(RelayError::ChannelClosed {
                side: "audio sink",
            }),
        }
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Flush queued frames and finalize the sink.
    pub async fn close(self) -> HarnessResult<()> {
        let Self { tx, thread, .. } = self;
        drop(tx);
        join_thread("sink", thread).await?
    }
}

async fn join_thread<T: Send + 'static>(
    name: &'static str,
    handle: thread::JoinHandle<T>,
) -> HarnessResult<T> {
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .map_err(|_| HarnessError::ThreadPanicked(name))?
        .map_err(|_| HarnessError::ThreadPanicked(name))
}

// =============================================================================
// Input producer
// =============================================================================

/// Push the source's blocks at real-time pace, then close the queue.
fn spawn_producer(
    source: WavSource,
    queue: FrameQueue<AudioFrame>,
    stop: Arc<AtomicBool>,
) -> HarnessResult<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("harness-input".to_string())
        .spawn(move || {
            let mut next = std::time::Instant::now();
            for block in source.blocks() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                next += block.duration();
                queue.push(block);
                if let Some(wait) = next.checked_duration_since(std::time::Instant::now()) {
                    thread::sleep(wait);
                }
            }
            queue.close();
        })
        .map_err(|e| HarnessError::Thread("input", e))
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Explicit provider WebSocket URL instead of creating a call.
    pub url: Option<String>,
    pub linger: Duration,
}

/// Where and how one harness run talks to the provider.
#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub target: UpstreamTarget,
    pub jitter: JitterConfig,
    pub linger: Duration,
}

impl StreamPlan {
    pub fn from_config(config: &ServerConfig, url: Option<&str>, linger: Duration) -> HarnessResult<Self> {
        let target = match url {
            Some(raw) => UpstreamTarget::Url(
                validate_upstream_url(raw, config.provider.allow_insecure_upstream)?.to_string(),
            ),
            None => UpstreamTarget::CreateCall,
        };
        Ok(Self {
            target,
            jitter: config.relay.jitter_config(),
            linger,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    CallEnded,
    ProviderError,
    ChannelClosed,
    InputFinished,
    Interrupted,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EndReason::CallEnded => "call ended by provider",
            EndReason::ProviderError => "provider error",
            EndReason::ChannelClosed => "provider channel closed",
            EndReason::InputFinished => "input finished",
            EndReason::Interrupted => "interrupted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarnessReport {
    pub call_id: Option<String>,
    pub blocks_sent: u64,
    pub silence_sent: u64,
    pub input_dropped: u64,
    pub frames_received: u64,
    pub output_overruns: u64,
    pub jitter: JitterStats,
    pub end_reason: Option<EndReason>,
}

impl fmt::Display for HarnessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "call:             {}", self.call_id.as_deref().unwrap_or("-"))?;
        writeln!(f, "blocks sent:      {}", self.blocks_sent)?;
        writeln!(f, "silence sent:     {}", self.silence_sent)?;
        writeln!(f, "input dropped:    {}", self.input_dropped)?;
        writeln!(f, "frames received:  {}", self.frames_received)?;
        writeln!(f, "output overruns:  {}", self.output_overruns)?;
        writeln!(f, "speaking turns:   {}", self.jitter.turns)?;
        writeln!(f, "resnaps:          {}", self.jitter.resnaps)?;
        match self.end_reason {
            Some(reason) => write!(f, "ended:            {reason}"),
            None => write!(f, "ended:            -"),
        }
    }
}

/// Run the harness against the configured provider until the call ends or
/// Ctrl-C is pressed.
pub async fn run(config: &ServerConfig, options: HarnessOptions) -> HarnessResult<HarnessReport> {
    let plan = StreamPlan::from_config(config, options.url.as_deref(), options.linger)?;
    let source = WavSource::open(&options.input, config.relay.sample_rate)?;
    let sink = WavSink::create(&options.output, config.relay.sample_rate)?;
    let calls = CallClient::new(config.provider.call_client_config())?;
    let connector = WebSocketConnector::new(calls, config.provider.connect_timeout);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    stream_session(&connector, plan, source, sink, shutdown).await
}

/// Stream `source` over a channel opened by `connector`, writing provider
/// audio to `sink`, until the call ends or `shutdown` completes.
pub async fn stream_session<F>(
    connector: &dyn UpstreamConnector,
    plan: StreamPlan,
    source: WavSource,
    sink: impl AudioSink,
    shutdown: F,
) -> HarnessResult<HarnessReport>
where
    F: Future<Output = ()>,
{
    let rate = plan.jitter.sample_rate;
    let ProviderChannel {
        call_id,
        commands,
        mut frames,
        task,
    } = connector.open(plan.target).await?;
    info!(
        call_id = ?call_id,
        seconds = source.duration().as_secs_f64(),
        "Harness streaming input"
    );

    let queue = FrameQueue::new(INPUT_QUEUE_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let producer = spawn_producer(source, queue.clone(), stop.clone())?;
    let mut writer = SinkWriter::spawn(sink, SINK_WRITE_TIMEOUT)?;
    let mut jitter = JitterBuffer::new(plan.jitter);
    let clock = PlaybackClock::start();
    let silence = AudioFrame::silence(block_samples(rate), rate)?;

    let mut report = HarnessReport {
        call_id,
        ..HarnessReport::default()
    };
    let mut input_done = false;
    let mut linger_until = Instant::now();
    let mut silence_ticker = tokio::time::interval(SILENCE_AFTER);
    tokio::pin!(shutdown);

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => break EndReason::Interrupted,

            _ = tokio::time::sleep_until(linger_until), if input_done => {
                break EndReason::InputFinished;
            }

            block = tokio::time::timeout(SILENCE_AFTER, queue.recv()), if !input_done => {
                let frame = match block {
                    Ok(Some(frame)) => {
                        report.blocks_sent += 1;
                        frame
                    }
                    Ok(None) => {
                        info!("Input exhausted, listening for {:?}", plan.linger);
                        input_done = true;
                        linger_until = Instant::now() + plan.linger;
                        silence_ticker.reset();
                        continue;
                    }
                    Err(_) => {
                        report.silence_sent += 1;
                        silence.clone()
                    }
                };
                if commands.send(ProviderCommand::Audio(frame.into_bytes())).await.is_err() {
                    break EndReason::ChannelClosed;
                }
            }

            _ = silence_ticker.tick(), if input_done => {
                report.silence_sent += 1;
                if commands.send(ProviderCommand::Audio(silence.as_bytes().clone())).await.is_err() {
                    break EndReason::ChannelClosed;
                }
            }

            frame = frames.recv() => match frame {
                Some(ProviderFrame::Audio(pcm)) => {
                    play(pcm, rate, &clock, &mut jitter, &mut writer, &mut report).await;
                }
                Some(ProviderFrame::Json(value)) => match ProviderEvent::interpret(&value) {
                    ProviderEvent::LegacyAudio(pcm) => {
                        play(pcm, rate, &clock, &mut jitter, &mut writer, &mut report).await;
                    }
                    event @ ProviderEvent::SpeechUpdate { .. } if event.ends_assistant_turn() => {
                        jitter.end_turn(clock.now());
                    }
                    ProviderEvent::CallEnded { reason } => {
                        info!(reason = ?reason, "Provider ended the call");
                        break EndReason::CallEnded;
                    }
                    ProviderEvent::Error { message } => {
                        warn!(message = ?message, "Provider reported an error");
                        break EndReason::ProviderError;
                    }
                    _ => {
                        debug!(
                            msg_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("unknown"),
                            "Provider message"
                        );
                    }
                },
                None => break EndReason::ChannelClosed,
            },
        }
    };
    info!(reason = %reason, "Harness stopping");

    stop.store(true, Ordering::Release);
    queue.close();
    drop(commands);
    if let Some(mut task) = task
        && tokio::time::timeout(PROVIDER_CLOSE_GRACE, &mut task).await.is_err()
    {
        task.abort();
    }
    join_thread("input", producer).await?;

    report.input_dropped = queue.dropped();
    report.output_overruns = writer.overruns();
    report.jitter = jitter.stats();
    report.end_reason = Some(reason);
    writer.close().await?;
    Ok(report)
}

async fn play(
    pcm: Bytes,
    rate: u32,
    clock: &PlaybackClock,
    jitter: &mut JitterBuffer,
    writer: &mut SinkWriter,
    report: &mut HarnessReport,
) {
    let Some(playback) = jitter.schedule_pcm(pcm.clone(), clock.now()) else {
        return;
    };
    let Ok(frame) = AudioFrame::from_pcm(pcm, rate) else {
        return;
    };
    report.frames_received += 1;
    if let Err(err) = writer.submit(playback, frame).await {
        if err.is_fatal() {
            warn!("{err}");
        } else {
            debug!("{err}");
        }
    }
}
