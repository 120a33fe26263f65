//! WAV input and output for the local harness.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use super::{AudioSink, HarnessError, HarnessResult};
use crate::core::audio::{AudioFrame, ScheduledPlayback};

/// Block length streamed to the provider.
pub const BLOCK_DURATION: Duration = Duration::from_millis(20);

/// Samples in one block at `sample_rate`.
pub fn block_samples(sample_rate: u32) -> usize {
    (u64::from(sample_rate) * BLOCK_DURATION.as_millis() as u64 / 1000) as usize
}

/// A mono 16-bit WAV file read fully into memory.
#[derive(Debug, Clone)]
pub struct WavSource {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl WavSource {
    /// Load `path`, which must be mono 16-bit PCM at `expected_rate`.
    pub fn open(path: &Path, expected_rate: u32) -> HarnessResult<Self> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int
        {
            return Err(HarnessError::Format(format!(
                "{} must be mono 16-bit PCM, got {} channel(s) at {} bits",
                path.display(),
                spec.channels,
                spec.bits_per_sample
            )));
        }
        if spec.sample_rate != expected_rate {
            return Err(HarnessError::Format(format!(
                "{} is {} Hz, expected {} Hz",
                path.display(),
                spec.sample_rate,
                expected_rate
            )));
        }

        let samples = reader.into_samples::<i16>().collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_samples(samples, expected_rate))
    }

    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// 20 ms frames; the last one may be shorter.
    pub fn blocks(&self) -> impl Iterator<Item = AudioFrame> + '_ {
        self.samples
            .chunks(block_samples(self.sample_rate).max(1))
            .filter_map(|chunk| AudioFrame::from_samples(chunk, self.sample_rate).ok())
    }
}

/// Writes provider audio at its scheduled position, filling gaps with
/// silence so the file follows the playback timeline.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    sample_rate: u32,
    written: u64,
}

impl WavSink {
    pub fn create(path: &Path, sample_rate: u32) -> HarnessResult<Self> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        Ok(Self {
            writer: Some(WavWriter::create(path, spec)?),
            sample_rate,
            written: 0,
        })
    }

    fn position_of(&self, at: Duration) -> u64 {
        (at.as_secs_f64() * f64::from(self.sample_rate)).round() as u64
    }
}

impl AudioSink for WavSink {
    fn write(&mut self, playback: &ScheduledPlayback, frame: &AudioFrame) -> HarnessResult<()> {
        let target = self.position_of(playback.start_time);
        let writer = self.writer.as_mut().ok_or(HarnessError::SinkClosed)?;
        while self.written < target {
            writer.write_sample(0i16)?;
            self.written += 1;
        }
        for sample in frame.samples() {
            writer.write_sample(sample)?;
            self.written += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> HarnessResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_wav(path: &Path, spec: WavSpec, samples: &[i16]) {
        let mut writer = WavWriter::create(path, spec).unwrap();
        for sample in samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn mono16(rate: u32) -> WavSpec {
        WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    #[test]
    fn test_source_blocks_are_20ms() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.wav");
        let samples: Vec<i16> = (0..800).map(|i| i as i16).collect();
        write_wav(&path, mono16(16_000), &samples);

        let source = WavSource::open(&path, 16_000).unwrap();
        let blocks: Vec<AudioFrame> = source.blocks().collect();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].sample_count(), 320);
        assert_eq!(blocks[0].duration(), BLOCK_DURATION);
        assert_eq!(blocks[2].sample_count(), 160);
        assert_eq!(blocks[1].samples()[0], 320);
    }

    #[test]
    fn test_source_rejects_wrong_format() {
        let dir = TempDir::new().unwrap();
        let stereo = dir.path().join("stereo.wav");
        let mut spec = mono16(16_000);
        spec.channels = 2;
        write_wav(&stereo, spec, &[0, 0, 1, 1]);
        assert!(matches!(
            WavSource::open(&stereo, 16_000),
            Err(HarnessError::Format(_))
        ));

        let wrong_rate = dir.path().join("rate.wav");
        write_wav(&wrong_rate, mono16(8_000), &[0, 1]);
        let err = WavSource::open(&wrong_rate, 16_000).unwrap_err();
        assert!(err.to_string().contains("expected 16000 Hz"));
    }

    #[test]
    fn test_sink_pads_to_schedule() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.wav");
        let mut sink = WavSink::create(&path, 16_000).unwrap();

        let frame = AudioFrame::from_samples(&[7; 160], 16_000).unwrap();
        let playback = ScheduledPlayback {
            start_time: Duration::from_millis(50),
            duration: frame.duration(),
            turn_started: true,
            resnapped: false,
        };
        sink.write(&playback, &frame).unwrap();
        sink.finish().unwrap();
        sink.finish().unwrap();

        let samples: Vec<i16> = WavReader::open(&path)
            .unwrap()
            .into_samples::<i16>()
            .map(Result::unwrap)
            .collect();
        assert_eq!(samples.len(), 800 + 160);
        assert!(samples[..800].iter().all(|s| *s == 0));
        assert_eq!(samples[800], 7);
    }
}
