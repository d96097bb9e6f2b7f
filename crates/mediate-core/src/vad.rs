//! Incremental frame-aligned voice activity detection.
//!
//! [`VadStream`] consumes arbitrary-sized PCM chunks, partitions them into
//! fixed-duration frames, and emits [`SpeechStart`] when a run of speech
//! frames latches and [`SpeechSegment`] once the trailing silence (hangover)
//! completes. Byte offsets are absolute: `processed_bytes` plus the buffer
//! length always equals the total bytes ever received, so frame index `k`
//! maps to byte offset `k * frame_bytes` for the lifetime of the stream.

use crate::error::ConfigError;
use crate::BYTES_PER_SAMPLE;

/// Hard cap on buffered frames while idle; older audio is discarded.
const MAX_IDLE_FRAMES: usize = 100;

/// RMS amplitude (in s16 units) a frame must exceed to count as speech,
/// indexed by aggressiveness. Level 0 is permissive, level 3 strict.
const SPEECH_RMS_THRESHOLDS: [f64; 4] = [200.0, 350.0, 500.0, 700.0];

/// Runtime configuration for [`VadStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadConfig {
    /// PCM sample rate in Hz. Must be 8000, 16000, 32000, or 48000.
    pub sample_rate: u32,
    /// Frame size in milliseconds: 10, 20, or 30.
    pub frame_ms: u32,
    /// Speech/noise decision strictness, 0 (permissive) to 3 (strict).
    pub aggressiveness: u8,
    /// Consecutive speech frames required to latch a start.
    pub start_trigger_frames: u32,
    /// Consecutive silence frames required to close a segment (hangover).
    pub stop_trigger_frames: u32,
    /// Frames prepended before the latched start to avoid clipping onsets.
    pub preroll_frames: u32,
}

impl VadConfig {
    pub fn new(
        sample_rate: u32,
        frame_ms: u32,
        aggressiveness: u8,
        start_trigger_frames: u32,
        stop_trigger_frames: u32,
        preroll_frames: u32,
    ) -> Result<Self, ConfigError> {
        if !matches!(sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(ConfigError::UnsupportedSampleRate(sample_rate));
        }
        if !matches!(frame_ms, 10 | 20 | 30) {
            return Err(ConfigError::UnsupportedFrameDuration(frame_ms));
        }
        if aggressiveness > 3 {
            return Err(ConfigError::AggressivenessOutOfRange(aggressiveness));
        }
        if start_trigger_frames < 1 {
            return Err(ConfigError::TriggerTooSmall {
                field: "start_trigger_frames",
            });
        }
        if stop_trigger_frames < 1 {
            return Err(ConfigError::TriggerTooSmall {
                field: "stop_trigger_frames",
            });
        }
        Ok(Self {
            sample_rate,
            frame_ms,
            aggressiveness,
            start_trigger_frames,
            stop_trigger_frames,
            preroll_frames,
        })
    }

    /// Re-check the invariants for a hand-assembled config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::new(
            self.sample_rate,
            self.frame_ms,
            self.aggressiveness,
            self.start_trigger_frames,
            self.stop_trigger_frames,
            self.preroll_frames,
        )
        .map(|_| ())
    }

    /// Size of one frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize / 1000) * BYTES_PER_SAMPLE
    }

    /// Duration of one frame in seconds.
    pub fn frame_duration_s(&self) -> f64 {
        self.frame_ms as f64 / 1000.0
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 30,
            aggressiveness: 2,
            start_trigger_frames: 3,
            stop_trigger_frames: 5,
            preroll_frames: 2,
        }
    }
}

/// VAD has latched onto speech.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechStart {
    pub start_time_s: f64,
    pub start_byte: u64,
}

/// Completed speech segment cut from the rolling PCM buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    pub start_time_s: f64,
    pub end_time_s: f64,
    pub pcm: Vec<u8>,
}

impl SpeechSegment {
    pub fn duration_s(&self) -> f64 {
        self.end_time_s - self.start_time_s
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStart(SpeechStart),
    Segment(SpeechSegment),
}

/// Stateful detector over a continuous PCM stream.
#[derive(Debug)]
pub struct VadStream {
    config: VadConfig,
    frame_bytes: usize,
    threshold: f64,

    buffer: Vec<u8>,
    /// Bytes discarded from the front of the buffer since stream start.
    processed_bytes: u64,
    /// Offset of the next unprocessed frame, relative to the buffer start.
    cursor: usize,

    active: bool,
    start_frame: u64,
    speech_run: u32,
    silence_run: u32,
}

impl VadStream {
    pub fn new(config: VadConfig) -> Self {
        Self {
            frame_bytes: config.frame_bytes(),
            threshold: SPEECH_RMS_THRESHOLDS[config.aggressiveness as usize],
            config,
            buffer: Vec::new(),
            processed_bytes: 0,
            cursor: 0,
            active: false,
            start_frame: 0,
            speech_run: 0,
            silence_run: 0,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Whether a speech segment is currently open.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed PCM bytes and collect any speech events produced.
    pub fn add_audio(&mut self, pcm: &[u8]) -> Vec<VadEvent> {
        if pcm.is_empty() {
            return Vec::new();
        }
        self.buffer.extend_from_slice(pcm);
        let mut events = Vec::new();

        while self.cursor + self.frame_bytes <= self.buffer.len() {
            let frame = &self.buffer[self.cursor..self.cursor + self.frame_bytes];
            let frame_index = (self.processed_bytes + self.cursor as u64) / self.frame_bytes as u64;
            let is_speech = frame_rms(frame) > self.threshold;

            if is_speech {
                self.speech_run += 1;
                self.silence_run = 0;
            } else {
                self.speech_run = 0;
                self.silence_run += 1;
            }

            if !self.active {
                if is_speech && self.speech_run >= self.config.start_trigger_frames {
                    self.active = true;
                    let tentative =
                        frame_index + 1 - u64::from(self.config.start_trigger_frames);
                    self.start_frame =
                        tentative.saturating_sub(u64::from(self.config.preroll_frames));
                    let start_byte = self.start_frame * self.frame_bytes as u64;
                    events.push(VadEvent::SpeechStart(SpeechStart {
                        start_time_s: self.byte_to_time(start_byte),
                        start_byte,
                    }));
                }
            } else if !is_speech && self.silence_run >= self.config.stop_trigger_frames {
                let mut end_frame = frame_index + 1 - u64::from(self.config.stop_trigger_frames);
                if end_frame < self.start_frame {
                    end_frame = frame_index;
                }
                let start_byte = self.start_frame * self.frame_bytes as u64;
                let end_byte = end_frame * self.frame_bytes as u64;
                events.push(VadEvent::Segment(self.slice_segment(start_byte, end_byte)));
                self.reset_after_segment(end_byte);
            }

            self.cursor += self.frame_bytes;
        }

        // Bound memory during long silence. Only safe while idle; an open
        // segment must keep its start byte resident until it closes.
        if !self.active {
            let max_buffer = self.frame_bytes * MAX_IDLE_FRAMES;
            if self.buffer.len() > max_buffer {
                let trim = self.buffer.len() - max_buffer;
                self.buffer.drain(..trim);
                self.processed_bytes += trim as u64;
                self.cursor = self.cursor.saturating_sub(trim);
            }
        }

        events
    }

    /// Close an open segment at the current position and emit it.
    pub fn force_close(&mut self) -> Option<SpeechSegment> {
        if !self.active {
            return None;
        }
        let end_frame = (self.processed_bytes + self.cursor as u64) / self.frame_bytes as u64;
        if end_frame <= self.start_frame {
            self.reset();
            return None;
        }
        let start_byte = self.start_frame * self.frame_bytes as u64;
        let end_byte = end_frame * self.frame_bytes as u64;
        let segment = self.slice_segment(start_byte, end_byte);
        self.reset_after_segment(end_byte);
        Some(segment)
    }

    /// Drop all buffered audio and return to the idle state.
    pub fn reset(&mut self) {
        self.processed_bytes += self.buffer.len() as u64;
        self.buffer.clear();
        self.cursor = 0;
        self.active = false;
        self.start_frame = 0;
        self.speech_run = 0;
        self.silence_run = 0;
    }

    fn slice_segment(&self, start_byte: u64, end_byte: u64) -> SpeechSegment {
        let start_rel = start_byte.saturating_sub(self.processed_bytes) as usize;
        let end_rel = (end_byte.saturating_sub(self.processed_bytes) as usize).min(self.buffer.len());
        let pcm = self.buffer[start_rel.min(end_rel)..end_rel].to_vec();
        SpeechSegment {
            start_time_s: self.byte_to_time(start_byte),
            end_time_s: self.byte_to_time(end_byte),
            pcm,
        }
    }

    fn reset_after_segment(&mut self, end_byte: u64) {
        let end_rel = (end_byte.saturating_sub(self.processed_bytes) as usize).min(self.buffer.len());
        self.buffer.drain(..end_rel);
        self.processed_bytes += end_rel as u64;
        self.cursor = self.cursor.saturating_sub(end_rel);
        self.active = false;
        self.start_frame = 0;
        self.speech_run = 0;
        self.silence_run = 0;
    }

    fn byte_to_time(&self, byte: u64) -> f64 {
        (byte as f64 / BYTES_PER_SAMPLE as f64) / self.config.sample_rate as f64
    }
}

fn frame_rms(frame: &[u8]) -> f64 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for pair in frame.chunks_exact(BYTES_PER_SAMPLE) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        sum += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt()
}
