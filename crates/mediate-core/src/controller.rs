//! Top-level turn orchestrator.
//!
//! A single cooperative loop services the serial bridge, feeds the VAD, and
//! drives each captured segment through ASR → rewrite → synthesis →
//! playback. Capture and playback are interlocked: the device microphone
//! stream is paused for the duration of playback and a short suspension
//! window afterwards drops any audio that leaks in before the device
//! rebalances. Every observable state change is appended to the journal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::warn;

use crate::bridge::AudioBridge;
use crate::error::{BridgeError, ConfigError, ControllerError};
use crate::journal::Journal;
use crate::playback::{apply_gain_db, downsample_linear, infer_sample_rate, mean_abs_amplitude};
use crate::types::{Presence, Rewriter, Synthesizer, Transcriber, TranscriptionResult, TransformResult};
use crate::vad::{SpeechSegment, SpeechStart, VadConfig, VadEvent, VadStream};

/// Transcripts that are exactly one of these markers carry no speech.
const BLANK_TRANSCRIPT_MARKERS: [&str; 5] = [
    "[BLANK_AUDIO]",
    "[BLANK]",
    "[SILENCE]",
    "[EMPTY]",
    "[NO_SPEECH]",
];

/// Parenthesized annotations the recognizer emits for non-speech audio.
const PARENTHETICAL_NOISE_TOKENS: [&str; 8] = [
    "music",
    "upbeat music",
    "background music",
    "applause",
    "laughter",
    "silence",
    "noise",
    "static",
];

const PUNCT_ONLY_CHARSET: &str = ".,!?:;-'\"()[]{} ";

/// Rewriter outputs containing one of these phrases are the model talking
/// about the transcript rather than rewriting it.
const LLM_DIAGNOSTIC_PHRASES: [&str; 6] = [
    "please provide the transcript",
    "no transcript provided",
    "there was no transcript",
    "i'm unable to correct",
    "transcript is blank",
    "it seems there was no input",
];

const LLM_NOISE_MARKERS: [&str; 3] = ["[no_speech]", "[blank_audio]", "[silence]"];

const PREVIEW_LIMIT: usize = 120;
const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(500);
const BUSY_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);
const PRESENCE_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Controller states, journaled on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    CaptureRequested,
    Asr,
    LlmTransform,
    TtsSynthesis,
    Playback,
    ReturnToIdle,
    PresenceIdle,
    PresenceActive,
    ErrorTimeout,
    FatalError,
}

impl TurnState {
    pub fn name(&self) -> &'static str {
        match self {
            TurnState::Idle => "Idle",
            TurnState::CaptureRequested => "CaptureRequested",
            TurnState::Asr => "ASR",
            TurnState::LlmTransform => "LLMTransform",
            TurnState::TtsSynthesis => "TTSSynthesis",
            TurnState::Playback => "Playback",
            TurnState::ReturnToIdle => "ReturnToIdle",
            TurnState::PresenceIdle => "PresenceIdle",
            TurnState::PresenceActive => "PresenceActive",
            TurnState::ErrorTimeout => "ErrorTimeout",
            TurnState::FatalError => "FatalError",
        }
    }
}

/// How a segment left the pipeline. Oversized rejections are the one path
/// that does not flush the serial input afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentOutcome {
    /// Full pipeline ran and playback finished.
    Completed,
    /// Soft discard (too short, low energy, blank, or diagnostic output).
    Discarded,
    /// Exceeded the capture cap outside the force-close path.
    RejectedOversized,
}

/// Configuration knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capture sample rate handed to the transcriber.
    pub sample_rate: u32,
    /// Rate the device plays back at; synthesis output is downsampled to it.
    pub playback_sample_rate: u32,
    pub playback_gain_db: f64,
    pub vad: VadConfig,
    /// Force-close a capture that runs longer than this many seconds.
    pub max_capture_seconds: Option<f64>,
    pub min_segment_duration: f64,
    pub min_mean_abs_amplitude: f64,
    /// How long after playback before capture audio is admitted again.
    pub capture_resume_delay: Duration,
    pub asr_timeout: Duration,
    pub llm_timeout: Duration,
    pub tts_first_chunk_timeout: Duration,
    pub playback_timeout: Duration,
    /// Fallback when the synthesis response does not advertise a rate.
    pub tts_expected_sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            playback_sample_rate: 16_000,
            playback_gain_db: 0.0,
            vad: VadConfig::default(),
            max_capture_seconds: None,
            min_segment_duration: 0.3,
            min_mean_abs_amplitude: 200.0,
            capture_resume_delay: Duration::from_millis(750),
            asr_timeout: Duration::from_secs(15),
            llm_timeout: Duration::from_secs(20),
            tts_first_chunk_timeout: Duration::from_secs(5),
            playback_timeout: Duration::from_secs(20),
            tts_expected_sample_rate: 24_000,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vad.validate()?;
        if self.sample_rate == 0 {
            return Err(ConfigError::NonPositive {
                field: "sample_rate",
            });
        }
        if self.playback_sample_rate == 0 {
            return Err(ConfigError::NonPositive {
                field: "playback_sample_rate",
            });
        }
        if self.tts_expected_sample_rate == 0 {
            return Err(ConfigError::NonPositive {
                field: "tts_expected_sample_rate",
            });
        }
        if self.min_segment_duration <= 0.0 {
            return Err(ConfigError::NonPositive {
                field: "min_segment_duration",
            });
        }
        if self.min_mean_abs_amplitude < 0.0 {
            return Err(ConfigError::NonPositive {
                field: "min_mean_abs_amplitude",
            });
        }
        if let Some(max) = self.max_capture_seconds {
            if max <= 0.0 {
                return Err(ConfigError::NonPositive {
                    field: "max_capture_seconds",
                });
            }
        }
        for (field, value) in [
            ("asr_timeout", self.asr_timeout),
            ("llm_timeout", self.llm_timeout),
            ("tts_first_chunk_timeout", self.tts_first_chunk_timeout),
            ("playback_timeout", self.playback_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::NonPositive { field });
            }
        }
        Ok(())
    }
}

/// High-level orchestrator binding the bridge, VAD, and pipeline stages.
pub struct SessionController<B, A, L, S> {
    bridge: B,
    asr: A,
    llm: L,
    tts: S,
    config: SessionConfig,
    vad: VadStream,
    journal: Journal,

    state: TurnState,
    processing_segment: bool,
    session_id: Option<String>,
    capture_started_at: Option<Instant>,
    capture_suspended_until: Option<Instant>,
    /// Last presence value acted upon; `None` until telemetry arrives.
    presence_state: Option<bool>,
    stop_flag: Arc<AtomicBool>,
    cycles_completed: u64,
}

impl<B, A, L, S> SessionController<B, A, L, S>
where
    B: AudioBridge,
    A: Transcriber,
    L: Rewriter,
    S: Synthesizer,
{
    pub fn new(
        bridge: B,
        asr: A,
        llm: L,
        tts: S,
        config: SessionConfig,
        journal: Journal,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let vad = VadStream::new(config.vad);
        Ok(Self {
            bridge,
            asr,
            llm,
            tts,
            config,
            vad,
            journal,
            state: TurnState::Idle,
            processing_segment: false,
            session_id: None,
            capture_started_at: None,
            capture_suspended_until: None,
            presence_state: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            cycles_completed: 0,
        })
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Flag checked at the top of each loop iteration; share it with the
    /// thread that handles shutdown signals.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Run capture → ASR → rewrite → synthesis → playback cycles until
    /// stopped or `max_cycles` turns have completed successfully.
    pub fn run(&mut self, max_cycles: Option<u64>) -> Result<(), ControllerError> {
        self.transition(TurnState::Idle, json!({"reason": "controller.start"}));

        while !self.stop_flag.load(Ordering::SeqCst) {
            if let Some(max) = max_cycles {
                if self.cycles_completed >= max {
                    break;
                }
            }

            if self.processing_segment {
                // Keep the framing alive but do not feed VAD while busy.
                let _ = self.bridge.read_audio_chunk(BUSY_DRAIN_TIMEOUT)?;
                continue;
            }

            if self.close_overlong_capture()? {
                if let Some(max) = max_cycles {
                    if self.cycles_completed >= max {
                        return Ok(());
                    }
                }
                continue;
            }

            match self.presence_blocks_capture() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    self.transition(
                        TurnState::FatalError,
                        json!({"stage": "presence", "error": err.to_string()}),
                    );
                    return Err(err.into());
                }
            }

            let chunk = match self.bridge.read_audio_chunk(IDLE_READ_TIMEOUT) {
                Ok(chunk) => chunk,
                Err(err) => {
                    let metadata = match &err {
                        BridgeError::MalformedAudioHeader { header } => json!({
                            "stage": "capture",
                            "reason": "malformed_audio_header",
                            "header": hex_string(header),
                        }),
                        other => json!({
                            "stage": "capture",
                            "reason": "audio_read_failed",
                            "error": other.to_string(),
                        }),
                    };
                    self.transition(TurnState::FatalError, metadata);
                    return Err(err.into());
                }
            };
            let Some(chunk) = chunk else { continue };

            if let Some(until) = self.capture_suspended_until {
                if Instant::now() < until {
                    // Playback tail still settling on the device side.
                    continue;
                }
                self.capture_suspended_until = None;
            }

            for event in self.vad.add_audio(&chunk) {
                match event {
                    VadEvent::SpeechStart(start) => self.handle_capture_start(&start),
                    VadEvent::Segment(segment) => {
                        let success = self.handle_segment(segment, false);
                        self.finish_cycle(success);
                        if let Some(max) = max_cycles {
                            if self.cycles_completed >= max {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event handlers

    fn handle_capture_start(&mut self, event: &SpeechStart) {
        if self.processing_segment {
            return;
        }
        self.session_id = Some(new_session_id());
        self.capture_started_at = Some(Instant::now());
        self.transition(
            TurnState::CaptureRequested,
            json!({"start_time_s": event.start_time_s, "start_byte": event.start_byte}),
        );
    }

    /// Force-close a capture exceeding `max_capture_seconds`. Returns true
    /// when the loop iteration has been consumed.
    fn close_overlong_capture(&mut self) -> Result<bool, ControllerError> {
        if self.state != TurnState::CaptureRequested {
            return Ok(false);
        }
        let (Some(max_capture), Some(started)) =
            (self.config.max_capture_seconds, self.capture_started_at)
        else {
            return Ok(false);
        };
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= max_capture {
            return Ok(false);
        }

        self.transition(
            TurnState::CaptureRequested,
            json!({"reason": "capture.timeout", "duration_s": elapsed}),
        );
        match self.vad.force_close() {
            Some(segment) => {
                let success = self.handle_segment(segment, true);
                self.finish_cycle(success);
            }
            None => {
                self.vad.reset();
                self.bridge.flush_input()?;
                self.transition(TurnState::Idle, json!({"reason": "capture.timeout"}));
                self.session_id = None;
                self.capture_started_at = None;
            }
        }
        Ok(true)
    }

    fn finish_cycle(&mut self, success: bool) {
        let reason = if success {
            self.cycles_completed += 1;
            "cycle.complete"
        } else {
            "cycle.discarded"
        };
        self.transition(
            TurnState::Idle,
            json!({"reason": reason, "cycles": self.cycles_completed}),
        );
        self.session_id = None;
        self.capture_started_at = None;
    }

    fn handle_segment(&mut self, segment: SpeechSegment, allow_timeout_segment: bool) -> bool {
        if self.session_id.is_none() {
            self.session_id = Some(new_session_id());
        }
        self.processing_segment = true;
        let outcome = self.process_segment(&segment, allow_timeout_segment);
        self.processing_segment = false;
        // Oversized rejections leave the input buffer untouched; every other
        // outcome flushes stale capture data before the next cycle.
        if !matches!(outcome, Ok(SegmentOutcome::RejectedOversized)) {
            if let Err(err) = self.bridge.flush_input() {
                warn!("failed to flush serial input after segment: {err}");
            }
        }
        match outcome {
            Ok(SegmentOutcome::Completed) => true,
            Ok(_) => false,
            Err(err) => {
                self.transition(
                    TurnState::ErrorTimeout,
                    json!({"stage": "pipeline", "error": err.to_string()}),
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Segment pipeline

    fn process_segment(
        &mut self,
        segment: &SpeechSegment,
        allow_timeout_segment: bool,
    ) -> anyhow::Result<SegmentOutcome> {
        let duration = segment.duration_s();
        if duration < self.config.min_segment_duration {
            self.transition(
                TurnState::ReturnToIdle,
                json!({
                    "reason": "segment.discarded",
                    "cause": "segment.too_short",
                    "duration_s": duration,
                }),
            );
            return Ok(SegmentOutcome::Discarded);
        }

        if !allow_timeout_segment {
            if let Some(max) = self.config.max_capture_seconds {
                if duration > max {
                    self.transition(
                        TurnState::ErrorTimeout,
                        json!({
                            "stage": "capture",
                            "reason": "segment.too_long",
                            "duration_s": duration,
                        }),
                    );
                    return Ok(SegmentOutcome::RejectedOversized);
                }
            }
        }

        let mean_abs = mean_abs_amplitude(&segment.pcm);
        if mean_abs < self.config.min_mean_abs_amplitude {
            self.transition(
                TurnState::ReturnToIdle,
                json!({
                    "reason": "segment.discarded",
                    "cause": "low_energy",
                    "mean_abs": mean_abs as i64,
                    "duration_s": duration,
                }),
            );
            return Ok(SegmentOutcome::Discarded);
        }

        let asr_result = self.run_asr(segment)?;
        if is_blank_transcript(asr_result.text.trim()) {
            self.transition(
                TurnState::ReturnToIdle,
                json!({"reason": "segment.discarded", "cause": "blank_transcript"}),
            );
            return Ok(SegmentOutcome::Discarded);
        }

        let llm_result = self.run_llm(&asr_result)?;
        if is_invalid_llm_output(&llm_result.output_text) {
            self.transition(
                TurnState::ReturnToIdle,
                json!({
                    "reason": "segment.discarded",
                    "cause": "llm_diagnostic",
                    "llm_preview": truncate_preview(&llm_result.output_text),
                }),
            );
            return Ok(SegmentOutcome::Discarded);
        }

        let playback = self.run_tts_and_play(&llm_result)?;
        self.transition(
            TurnState::ReturnToIdle,
            json!({"reason": "playback.complete", "playback": playback}),
        );
        self.capture_suspended_until = Some(Instant::now() + self.config.capture_resume_delay);
        self.vad.reset();
        Ok(SegmentOutcome::Completed)
    }

    fn run_asr(&mut self, segment: &SpeechSegment) -> anyhow::Result<TranscriptionResult> {
        let started = Instant::now();
        self.transition(
            TurnState::Asr,
            json!({
                "reason": "segment.complete",
                "duration_s": segment.duration_s(),
                "bytes": segment.pcm.len(),
            }),
        );
        let result = self
            .asr
            .transcribe_pcm(&segment.pcm, self.config.sample_rate)?;
        let latency = started.elapsed();
        self.transition(
            TurnState::Asr,
            json!({
                "reason": "complete",
                "latency_ms": latency.as_millis() as u64,
                "text_preview": truncate_preview(&result.text),
            }),
        );
        if latency > self.config.asr_timeout {
            anyhow::bail!(
                "transcription exceeded its budget ({:.2}s > {:.2}s)",
                latency.as_secs_f64(),
                self.config.asr_timeout.as_secs_f64()
            );
        }
        Ok(result)
    }

    fn run_llm(&mut self, asr_result: &TranscriptionResult) -> anyhow::Result<TransformResult> {
        let started = Instant::now();
        self.transition(
            TurnState::LlmTransform,
            json!({
                "reason": "start",
                "transcript_preview": truncate_preview(&asr_result.text),
            }),
        );
        let result = self.llm.transform(&asr_result.text)?;
        let latency = started.elapsed();
        self.transition(
            TurnState::LlmTransform,
            json!({
                "reason": "complete",
                "latency_ms": latency.as_millis() as u64,
                "output_preview": truncate_preview(&result.output_text),
            }),
        );
        if latency > self.config.llm_timeout {
            anyhow::bail!(
                "rewrite exceeded its budget ({:.2}s > {:.2}s)",
                latency.as_secs_f64(),
                self.config.llm_timeout.as_secs_f64()
            );
        }
        Ok(result)
    }

    fn run_tts_and_play(&mut self, llm_result: &TransformResult) -> anyhow::Result<serde_json::Value> {
        let started = Instant::now();
        self.transition(
            TurnState::TtsSynthesis,
            json!({
                "reason": "start",
                "text_preview": truncate_preview(&llm_result.output_text),
            }),
        );

        let mut pcm: Vec<u8> = Vec::new();
        let mut headers: HashMap<String, String> = HashMap::new();
        let mut content_type: Option<String> = None;
        let mut first_chunk_latency: Option<Duration> = None;
        let mut elapsed: Option<Duration> = None;
        let mut stream_total_bytes: u64 = 0;

        let stream = self.tts.stream_synthesis(&llm_result.output_text)?;
        for chunk in stream {
            let chunk = chunk?;
            if !chunk.headers.is_empty() {
                headers.extend(chunk.headers.clone());
            }
            if chunk.content_type.is_some() {
                content_type = chunk.content_type.clone();
            }
            if first_chunk_latency.is_none() {
                first_chunk_latency = chunk.first_chunk_latency;
            }
            if chunk.is_last {
                elapsed = chunk.elapsed.or_else(|| Some(started.elapsed()));
                stream_total_bytes = chunk.total_bytes;
                break;
            }
            pcm.extend_from_slice(&chunk.data);
        }
        // Streams normally end with a terminal chunk; tolerate ones that
        // just stop.
        let elapsed = elapsed.or_else(|| Some(started.elapsed()));

        let tts_latency = started.elapsed();
        self.transition(
            TurnState::TtsSynthesis,
            json!({
                "reason": "complete",
                "latency_ms": tts_latency.as_millis() as u64,
                "first_chunk_ms": millis_or_zero(first_chunk_latency),
                "stream_bytes": stream_total_bytes,
            }),
        );
        if let Some(first) = first_chunk_latency {
            if first > self.config.tts_first_chunk_timeout {
                anyhow::bail!(
                    "first synthesis chunk exceeded its budget ({:.2}s > {:.2}s)",
                    first.as_secs_f64(),
                    self.config.tts_first_chunk_timeout.as_secs_f64()
                );
            }
        }
        if pcm.is_empty() {
            anyhow::bail!("synthesis returned no audio data");
        }

        let src_rate = infer_sample_rate(&headers, content_type.as_deref())
            .unwrap_or(self.config.tts_expected_sample_rate);
        let (pcm, sample_rate) =
            downsample_linear(&pcm, src_rate, self.config.playback_sample_rate)?;
        let pcm = apply_gain_db(&pcm, self.config.playback_gain_db);

        let playback_started = Instant::now();
        self.transition(
            TurnState::Playback,
            json!({"reason": "start", "sample_rate": sample_rate, "bytes": pcm.len()}),
        );
        self.bridge.pause_capture()?;
        let play_result = self
            .bridge
            .flush_input()
            .and_then(|_| self.bridge.play_pcm(&pcm, sample_rate));
        let resume_result = self.bridge.resume_capture();
        play_result?;
        resume_result?;
        let playback_elapsed = playback_started.elapsed();
        self.transition(
            TurnState::Playback,
            json!({
                "reason": "complete",
                "duration_ms": playback_elapsed.as_millis() as u64,
            }),
        );
        if playback_elapsed > self.config.playback_timeout {
            anyhow::bail!(
                "playback exceeded its budget ({:.2}s > {:.2}s)",
                playback_elapsed.as_secs_f64(),
                self.config.playback_timeout.as_secs_f64()
            );
        }

        Ok(json!({
            "tts_first_chunk_ms": millis_or_zero(first_chunk_latency),
            "tts_elapsed_ms": millis_or_zero(elapsed),
            "playback_ms": playback_elapsed.as_millis() as u64,
            "pcm_bytes": pcm.len(),
            "sample_rate": sample_rate,
        }))
    }

    // ------------------------------------------------------------------
    // Presence gating

    fn presence_blocks_capture(&mut self) -> Result<bool, BridgeError> {
        match self.bridge.presence() {
            Presence::Unknown => {
                self.bridge.poll_presence(PRESENCE_POLL_TIMEOUT)?;
                Ok(false)
            }
            Presence::Idle => {
                if self.presence_state != Some(false) {
                    self.transition(TurnState::PresenceIdle, json!({"reason": "presence.off"}));
                    self.vad.reset();
                    self.bridge.flush_input()?;
                    self.session_id = None;
                    self.capture_started_at = None;
                }
                self.presence_state = Some(false);
                self.bridge.poll_presence(PRESENCE_POLL_TIMEOUT)?;
                std::thread::sleep(PRESENCE_POLL_TIMEOUT);
                Ok(true)
            }
            Presence::Active => {
                if self.presence_state == Some(false) {
                    self.transition(TurnState::PresenceActive, json!({"reason": "presence.on"}));
                }
                self.presence_state = Some(true);
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------
    // Journal

    fn transition(&mut self, state: TurnState, metadata: serde_json::Value) {
        self.state = state;
        self.journal
            .record(state.name(), self.session_id.as_deref(), metadata);
    }
}

fn new_session_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn millis_or_zero(duration: Option<Duration>) -> u64 {
    duration.map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn truncate_preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= PREVIEW_LIMIT {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(PREVIEW_LIMIT - 3).collect();
    format!("{head}...")
}

/// True when a transcript carries no usable speech: a blank/noise marker, a
/// parenthesized annotation like `(background music)`, punctuation only, or
/// nothing at all.
fn is_blank_transcript(text: &str) -> bool {
    let normalized = text.trim();
    if normalized.is_empty() {
        return true;
    }
    let upper = normalized.to_uppercase();
    if BLANK_TRANSCRIPT_MARKERS.contains(&upper.as_str()) {
        return true;
    }

    let lower = normalized.to_lowercase();
    if normalized.starts_with('(') && normalized.ends_with(')') {
        let inner = lower.trim_matches(|c| c == '(' || c == ')' || c == ' ');
        if inner.is_empty() {
            return true;
        }
        if PARENTHETICAL_NOISE_TOKENS
            .iter()
            .any(|token| inner.contains(token))
        {
            return true;
        }
    }

    if normalized.starts_with('[') && normalized.ends_with(']') {
        let inner = lower.trim_matches(|c| c == '[' || c == ']' || c == ' ');
        if BLANK_TRANSCRIPT_MARKERS
            .iter()
            .map(|marker| marker.trim_matches(|c| c == '[' || c == ']').to_lowercase())
            .any(|marker| marker == inner)
        {
            return true;
        }
    }

    normalized.chars().all(|c| PUNCT_ONLY_CHARSET.contains(c))
}

/// True when the rewriter produced a diagnostic instead of a rewrite.
fn is_invalid_llm_output(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    if LLM_DIAGNOSTIC_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
    {
        return true;
    }
    LLM_NOISE_MARKERS.contains(&lowered.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_stable() {
        assert_eq!(TurnState::Asr.name(), "ASR");
        assert_eq!(TurnState::LlmTransform.name(), "LLMTransform");
        assert_eq!(TurnState::TtsSynthesis.name(), "TTSSynthesis");
        assert_eq!(TurnState::ReturnToIdle.name(), "ReturnToIdle");
    }

    #[test]
    fn blank_transcripts_are_detected() {
        assert!(is_blank_transcript(""));
        assert!(is_blank_transcript("   "));
        assert!(is_blank_transcript("[BLANK_AUDIO]"));
        assert!(is_blank_transcript("[blank_audio]"));
        assert!(is_blank_transcript("[ NO_SPEECH ]"));
        assert!(is_blank_transcript("(music)"));
        assert!(is_blank_transcript("(Upbeat Music)"));
        assert!(is_blank_transcript("(background noise)"));
        assert!(is_blank_transcript("( )"));
        assert!(is_blank_transcript("...!?"));
        assert!(!is_blank_transcript("turn the lights on"));
        assert!(!is_blank_transcript("(he said) hello"));
        assert!(!is_blank_transcript("[1] first item"));
    }

    #[test]
    fn llm_diagnostics_are_detected() {
        assert!(is_invalid_llm_output(""));
        assert!(is_invalid_llm_output("Please provide the transcript."));
        assert!(is_invalid_llm_output(
            "It seems there was no input to work with"
        ));
        assert!(is_invalid_llm_output("[NO_SPEECH]"));
        assert!(!is_invalid_llm_output("The lights are now on."));
    }

    #[test]
    fn preview_truncates_to_limit() {
        let long = "x".repeat(300);
        let preview = truncate_preview(&long);
        assert_eq!(preview.chars().count(), PREVIEW_LIMIT);
        assert!(preview.ends_with("..."));
        assert_eq!(truncate_preview(" short "), "short");
    }

    #[test]
    fn session_ids_are_eight_hex_digits() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_zero_timeouts() {
        let config = SessionConfig {
            llm_timeout: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonPositive {
                field: "llm_timeout"
            })
        );
    }

    #[test]
    fn config_rejects_nonpositive_capture_cap() {
        let config = SessionConfig {
            max_capture_seconds: Some(0.0),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
