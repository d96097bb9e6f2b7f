//! End-to-end scenarios for the session controller, driven through fake
//! bridge and pipeline-stage implementations.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use mediate_core::{
    AudioBridge, BridgeError, Journal, Presence, Rewriter, SessionConfig, SessionController,
    SynthesisChunk, SynthesisStream, Synthesizer, TranscriptionResult, Transcriber,
    TransformResult, TurnState, VadConfig,
};

const FRAME_BYTES: usize = 960; // 30 ms at 16 kHz, s16 mono

fn speech_frame() -> Vec<u8> {
    (0..FRAME_BYTES / 2)
        .flat_map(|i| {
            let value: i16 = if i % 2 == 0 { 8000 } else { -8000 };
            value.to_le_bytes()
        })
        .collect()
}

fn quiet_spiky_frame() -> Vec<u8> {
    // Loud enough for the VAD (RMS ~1900) but a mean absolute amplitude
    // (~125) below the low-energy gate.
    (0..FRAME_BYTES / 2)
        .flat_map(|i| {
            let value: i16 = if i == 0 || i == 240 { 30_000 } else { 0 };
            value.to_le_bytes()
        })
        .collect()
}

fn silence_frame() -> Vec<u8> {
    vec![0u8; FRAME_BYTES]
}

/// A burst long enough to pass the minimum-duration gate, followed by the
/// hangover silence that closes it.
fn speech_burst() -> Vec<Feed> {
    let mut feed = Vec::new();
    for _ in 0..12 {
        feed.push(Feed::Audio(speech_frame()));
    }
    for _ in 0..7 {
        feed.push(Feed::Audio(silence_frame()));
    }
    feed
}

#[derive(Clone)]
enum Feed {
    Audio(Vec<u8>),
    Presence(Presence),
    Malformed,
}

#[derive(Default)]
struct BridgeLog {
    commands: Vec<String>,
    played: Vec<(u32, Vec<u8>)>,
}

/// Scripted bridge: pops feed items in order; once the script is exhausted
/// it trips the controller's stop flag so tests terminate.
struct FakeBridge {
    feed: VecDeque<Feed>,
    presence: Presence,
    log: Arc<Mutex<BridgeLog>>,
    stop: Arc<Mutex<Option<Arc<AtomicBool>>>>,
    empty_reads: usize,
}

impl FakeBridge {
    fn new(feed: Vec<Feed>) -> (Self, Arc<Mutex<BridgeLog>>, Arc<Mutex<Option<Arc<AtomicBool>>>>) {
        let log = Arc::new(Mutex::new(BridgeLog::default()));
        let stop = Arc::new(Mutex::new(None));
        (
            Self {
                feed: feed.into(),
                presence: Presence::Unknown,
                log: Arc::clone(&log),
                stop: Arc::clone(&stop),
                empty_reads: 0,
            },
            log,
            stop,
        )
    }

    fn note_empty_read(&mut self) {
        self.empty_reads += 1;
        if self.empty_reads > 3 {
            if let Some(flag) = self.stop.lock().unwrap().as_ref() {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl AudioBridge for FakeBridge {
    fn read_audio_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BridgeError> {
        loop {
            match self.feed.pop_front() {
                Some(Feed::Audio(chunk)) => return Ok(Some(chunk)),
                Some(Feed::Presence(p)) => {
                    self.presence = p;
                    continue;
                }
                Some(Feed::Malformed) => {
                    return Err(BridgeError::MalformedAudioHeader {
                        header: vec![0x41, 0x55, 0x44, 0x30, 9, 1, 0, 0, 4, 0, 0, 0],
                    })
                }
                None => {
                    self.note_empty_read();
                    std::thread::sleep(timeout.min(Duration::from_millis(20)));
                    return Ok(None);
                }
            }
        }
    }

    fn pause_capture(&mut self) -> Result<(), BridgeError> {
        self.log.lock().unwrap().commands.push("pause".into());
        Ok(())
    }

    fn resume_capture(&mut self) -> Result<(), BridgeError> {
        self.log.lock().unwrap().commands.push("resume".into());
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), BridgeError> {
        self.log.lock().unwrap().commands.push("flush".into());
        Ok(())
    }

    fn play_pcm(&mut self, pcm: &[u8], sample_rate: u32) -> Result<(), BridgeError> {
        let mut log = self.log.lock().unwrap();
        log.commands.push(format!("play:{sample_rate}"));
        log.played.push((sample_rate, pcm.to_vec()));
        Ok(())
    }

    fn presence(&self) -> Presence {
        self.presence
    }

    fn poll_presence(&mut self, _timeout: Duration) -> Result<(), BridgeError> {
        match self.feed.pop_front() {
            Some(Feed::Presence(p)) => self.presence = p,
            Some(Feed::Audio(_)) => {} // discarded while gated
            Some(other) => self.feed.push_front(other),
            None => self.note_empty_read(),
        }
        Ok(())
    }
}

struct FakeAsr {
    text: String,
    calls: Arc<AtomicUsize>,
}

impl FakeAsr {
    fn returning(text: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                text: text.to_string(),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl Transcriber for FakeAsr {
    fn transcribe_pcm(&self, _pcm: &[u8], _sample_rate: u32) -> Result<TranscriptionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TranscriptionResult {
            text: self.text.clone(),
            segments: vec![self.text.clone()],
            metadata: None,
            source: "fake-asr".into(),
        })
    }

    fn transcribe_file(&self, _path: &Path) -> Result<TranscriptionResult> {
        self.transcribe_pcm(&[], 16_000)
    }
}

struct FakeLlm {
    output: String,
    calls: Arc<AtomicUsize>,
}

impl FakeLlm {
    fn returning(output: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                output: output.to_string(),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl Rewriter for FakeLlm {
    fn transform(&self, text: &str) -> Result<TransformResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TransformResult {
            input_text: text.to_string(),
            output_text: self.output.clone(),
            raw: Value::Null,
        })
    }
}

struct FakeTts {
    pcm: Vec<u8>,
    headers: HashMap<String, String>,
    calls: Arc<AtomicUsize>,
}

impl FakeTts {
    fn streaming(pcm: Vec<u8>, declared_rate: Option<u32>) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut headers = HashMap::new();
        if let Some(rate) = declared_rate {
            headers.insert("x-audio-sample-rate".to_string(), rate.to_string());
        }
        (
            Self {
                pcm,
                headers,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl Synthesizer for FakeTts {
    fn stream_synthesis(&self, _text: &str) -> Result<SynthesisStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let half = (self.pcm.len() / 2).max(1).min(self.pcm.len());
        let (first, second) = self.pcm.split_at(half);
        let total = self.pcm.len() as u64;
        let chunks = vec![
            SynthesisChunk {
                sequence: 1,
                data: first.to_vec(),
                first_chunk_latency: Some(Duration::from_millis(12)),
                headers: self.headers.clone(),
                content_type: Some("application/octet-stream".into()),
                total_bytes: first.len() as u64,
                ..Default::default()
            },
            SynthesisChunk {
                sequence: 2,
                data: second.to_vec(),
                headers: self.headers.clone(),
                total_bytes: total,
                ..Default::default()
            },
            SynthesisChunk {
                sequence: 3,
                is_last: true,
                total_bytes: total,
                elapsed: Some(Duration::from_millis(80)),
                headers: self.headers.clone(),
                ..Default::default()
            },
        ];
        Ok(Box::new(chunks.into_iter().map(Ok)))
    }
}

struct Harness {
    controller: SessionController<FakeBridge, FakeAsr, FakeLlm, FakeTts>,
    log: Arc<Mutex<BridgeLog>>,
    journal_dir: tempfile::TempDir,
}

impl Harness {
    fn journal_states(&self) -> Vec<(String, Value)> {
        let path = self.journal_dir.path().join("session.jsonl");
        let content = std::fs::read_to_string(path).unwrap_or_default();
        content
            .lines()
            .map(|line| {
                let value: Value = serde_json::from_str(line).unwrap();
                (value["state"].as_str().unwrap().to_string(), value)
            })
            .collect()
    }
}

fn harness(feed: Vec<Feed>, asr: FakeAsr, llm: FakeLlm, tts: FakeTts, config: SessionConfig) -> Harness {
    let (bridge, log, stop) = FakeBridge::new(feed);
    let journal_dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(&journal_dir.path().join("session.jsonl")).unwrap();
    let controller = SessionController::new(bridge, asr, llm, tts, config, journal).unwrap();
    *stop.lock().unwrap() = Some(controller.stop_handle());
    Harness {
        controller,
        log,
        journal_dir,
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        vad: VadConfig::new(16_000, 30, 2, 3, 5, 0).unwrap(),
        ..SessionConfig::default()
    }
}

#[test]
fn successful_turn_runs_all_stages_and_plays_downsampled_audio() {
    let mut feed = vec![Feed::Presence(Presence::Active)];
    feed.extend(speech_burst());

    let (asr, asr_calls) = FakeAsr::returning("turn the lights on");
    let (llm, llm_calls) = FakeLlm::returning("Turn the lights on.");
    // 2400 samples at a declared 24 kHz → 1600 samples at 16 kHz.
    let (tts, tts_calls) = FakeTts::streaming(vec![0u8; 4800], Some(24_000));

    let mut h = harness(feed, asr, llm, tts, test_config());
    h.controller.run(Some(1)).unwrap();

    assert_eq!(h.controller.cycles_completed(), 1);
    assert_eq!(asr_calls.load(Ordering::SeqCst), 1);
    assert_eq!(llm_calls.load(Ordering::SeqCst), 1);
    assert_eq!(tts_calls.load(Ordering::SeqCst), 1);

    let log = h.log.lock().unwrap();
    assert_eq!(log.played.len(), 1);
    let (rate, pcm) = &log.played[0];
    assert_eq!(*rate, 16_000);
    assert_eq!(pcm.len(), 3200);

    // Half-duplex interlock around playback.
    let commands = log.commands.join(",");
    assert!(commands.contains("pause,flush,play:16000,resume"), "{commands}");

    let states: Vec<String> = h.journal_states().iter().map(|(s, _)| s.clone()).collect();
    for expected in [
        "CaptureRequested",
        "ASR",
        "LLMTransform",
        "TTSSynthesis",
        "Playback",
        "ReturnToIdle",
    ] {
        assert!(states.iter().any(|s| s == expected), "missing {expected}");
    }
}

#[test]
fn blank_transcript_discards_without_llm_or_tts() {
    let mut feed = vec![Feed::Presence(Presence::Active)];
    feed.extend(speech_burst());

    let (asr, asr_calls) = FakeAsr::returning("[BLANK_AUDIO]");
    let (llm, llm_calls) = FakeLlm::returning("unused");
    let (tts, tts_calls) = FakeTts::streaming(vec![0u8; 100], None);

    let mut h = harness(feed, asr, llm, tts, test_config());
    h.controller.run(Some(1)).unwrap();

    assert_eq!(h.controller.cycles_completed(), 0);
    assert_eq!(asr_calls.load(Ordering::SeqCst), 1);
    assert_eq!(llm_calls.load(Ordering::SeqCst), 0);
    assert_eq!(tts_calls.load(Ordering::SeqCst), 0);

    let discard = h
        .journal_states()
        .into_iter()
        .find(|(state, value)| state == "ReturnToIdle" && value["cause"] == "blank_transcript");
    assert!(discard.is_some(), "expected a blank_transcript discard");
}

#[test]
fn llm_diagnostic_discards_before_synthesis() {
    let mut feed = vec![Feed::Presence(Presence::Active)];
    feed.extend(speech_burst());

    let (asr, _) = FakeAsr::returning("mumble mumble");
    let (llm, _) = FakeLlm::returning("Please provide the transcript you want corrected.");
    let (tts, tts_calls) = FakeTts::streaming(vec![0u8; 100], None);

    let mut h = harness(feed, asr, llm, tts, test_config());
    h.controller.run(Some(1)).unwrap();

    assert_eq!(tts_calls.load(Ordering::SeqCst), 0);
    let discard = h
        .journal_states()
        .into_iter()
        .find(|(state, value)| state == "ReturnToIdle" && value["cause"] == "llm_diagnostic");
    assert!(discard.is_some());
}

#[test]
fn short_segment_never_reaches_asr() {
    let mut feed = vec![Feed::Presence(Presence::Active)];
    for _ in 0..5 {
        feed.push(Feed::Audio(speech_frame()));
    }
    for _ in 0..7 {
        feed.push(Feed::Audio(silence_frame()));
    }

    let (asr, asr_calls) = FakeAsr::returning("anything");
    let (llm, _) = FakeLlm::returning("anything");
    let (tts, _) = FakeTts::streaming(vec![0u8; 100], None);

    let mut h = harness(feed, asr, llm, tts, test_config());
    h.controller.run(Some(1)).unwrap();

    assert_eq!(asr_calls.load(Ordering::SeqCst), 0);
    let discard = h
        .journal_states()
        .into_iter()
        .find(|(state, value)| state == "ReturnToIdle" && value["cause"] == "segment.too_short");
    assert!(discard.is_some());
}

#[test]
fn low_energy_segment_is_discarded() {
    let mut feed = vec![Feed::Presence(Presence::Active)];
    for _ in 0..12 {
        feed.push(Feed::Audio(quiet_spiky_frame()));
    }
    for _ in 0..7 {
        feed.push(Feed::Audio(silence_frame()));
    }

    let (asr, asr_calls) = FakeAsr::returning("anything");
    let (llm, _) = FakeLlm::returning("anything");
    let (tts, _) = FakeTts::streaming(vec![0u8; 100], None);

    let mut h = harness(feed, asr, llm, tts, test_config());
    h.controller.run(Some(1)).unwrap();

    assert_eq!(asr_calls.load(Ordering::SeqCst), 0);
    let discard = h
        .journal_states()
        .into_iter()
        .find(|(state, value)| state == "ReturnToIdle" && value["cause"] == "low_energy");
    assert!(discard.is_some());
}

#[test]
fn presence_off_discards_audio_until_presence_returns() {
    let mut feed = vec![Feed::Presence(Presence::Idle)];
    // Audio arriving while idle is consumed by the presence poll.
    feed.push(Feed::Audio(speech_frame()));
    feed.push(Feed::Audio(speech_frame()));
    feed.push(Feed::Presence(Presence::Active));
    feed.extend(speech_burst());

    let (asr, asr_calls) = FakeAsr::returning("hello there");
    let (llm, _) = FakeLlm::returning("Hello there.");
    let (tts, _) = FakeTts::streaming(vec![0u8; 3200], Some(16_000));

    let mut h = harness(feed, asr, llm, tts, test_config());
    h.controller.run(Some(1)).unwrap();

    // Exactly one turn from the burst after presence came back.
    assert_eq!(h.controller.cycles_completed(), 1);
    assert_eq!(asr_calls.load(Ordering::SeqCst), 1);

    let states: Vec<String> = h.journal_states().iter().map(|(s, _)| s.clone()).collect();
    assert!(states.iter().any(|s| s == "PresenceIdle"));
    assert!(states.iter().any(|s| s == "PresenceActive"));
}

#[test]
fn overlong_capture_is_force_closed_and_processed() {
    let mut feed = vec![Feed::Presence(Presence::Active)];
    // Continuous speech, never a hangover: only the capture cap closes it.
    for _ in 0..40 {
        feed.push(Feed::Audio(speech_frame()));
    }

    let (asr, asr_calls) = FakeAsr::returning("a very long utterance");
    let (llm, _) = FakeLlm::returning("A very long utterance.");
    let (tts, _) = FakeTts::streaming(vec![0u8; 3200], Some(16_000));

    let config = SessionConfig {
        max_capture_seconds: Some(0.05),
        ..test_config()
    };
    let mut h = harness(feed, asr, llm, tts, config);
    h.controller.run(Some(1)).unwrap();

    // The segment exceeded max_capture_seconds but was admitted because it
    // came from the force-close path.
    assert_eq!(h.controller.cycles_completed(), 1);
    assert_eq!(asr_calls.load(Ordering::SeqCst), 1);

    let timeout = h
        .journal_states()
        .into_iter()
        .find(|(state, value)| state == "CaptureRequested" && value["reason"] == "capture.timeout");
    assert!(timeout.is_some());
}

#[test]
fn oversized_segment_is_rejected_without_a_flush() {
    // The burst closes naturally with 0.36 s of media, over the 0.2 s cap,
    // long before the wall-clock force-close can trigger.
    let mut feed = vec![Feed::Presence(Presence::Active)];
    feed.extend(speech_burst());

    let (asr, asr_calls) = FakeAsr::returning("anything");
    let (llm, _) = FakeLlm::returning("anything");
    let (tts, _) = FakeTts::streaming(vec![0u8; 100], None);

    let config = SessionConfig {
        max_capture_seconds: Some(0.2),
        ..test_config()
    };
    let mut h = harness(feed, asr, llm, tts, config);
    h.controller.run(Some(1)).unwrap();

    assert_eq!(h.controller.cycles_completed(), 0);
    assert_eq!(asr_calls.load(Ordering::SeqCst), 0);

    let rejection = h
        .journal_states()
        .into_iter()
        .find(|(state, value)| state == "ErrorTimeout" && value["reason"] == "segment.too_long");
    assert!(rejection.is_some());

    // Unlike every other segment outcome, this rejection leaves the serial
    // input untouched.
    assert!(h.log.lock().unwrap().commands.is_empty());
}

#[test]
fn malformed_header_is_fatal() {
    let feed = vec![Feed::Presence(Presence::Active), Feed::Malformed];

    let (asr, _) = FakeAsr::returning("anything");
    let (llm, _) = FakeLlm::returning("anything");
    let (tts, _) = FakeTts::streaming(vec![0u8; 100], None);

    let mut h = harness(feed, asr, llm, tts, test_config());
    let err = h.controller.run(Some(1)).unwrap_err();
    assert!(err.to_string().contains("malformed audio frame header"));
    assert_eq!(h.controller.state(), TurnState::FatalError);

    let fatal = h
        .journal_states()
        .into_iter()
        .find(|(state, value)| state == "FatalError" && value["reason"] == "malformed_audio_header");
    assert!(fatal.is_some());
}

#[test]
fn upsampling_requirement_aborts_the_turn() {
    let mut feed = vec![Feed::Presence(Presence::Active)];
    feed.extend(speech_burst());

    let (asr, _) = FakeAsr::returning("hello");
    let (llm, _) = FakeLlm::returning("Hello.");
    // Declared 8 kHz source against a 16 kHz playback target.
    let (tts, _) = FakeTts::streaming(vec![0u8; 1600], Some(8_000));

    let mut h = harness(feed, asr, llm, tts, test_config());
    h.controller.run(Some(1)).unwrap();

    assert_eq!(h.controller.cycles_completed(), 0);
    assert!(h.log.lock().unwrap().played.is_empty());
    let error = h
        .journal_states()
        .into_iter()
        .find(|(state, value)| {
            state == "ErrorTimeout"
                && value["error"]
                    .as_str()
                    .is_some_and(|e| e.contains("upsampling"))
        });
    assert!(error.is_some());
}

#[test]
fn audio_right_after_playback_is_suppressed() {
    let mut feed = vec![Feed::Presence(Presence::Active)];
    feed.extend(speech_burst());
    // A second burst arrives within the capture-resume window; it must not
    // open another turn.
    feed.extend(speech_burst());

    let (asr, asr_calls) = FakeAsr::returning("first turn");
    let (llm, _) = FakeLlm::returning("First turn.");
    let (tts, _) = FakeTts::streaming(vec![0u8; 3200], Some(16_000));

    let mut h = harness(feed, asr, llm, tts, test_config());
    h.controller.run(Some(2)).unwrap();

    assert_eq!(h.controller.cycles_completed(), 1);
    assert_eq!(asr_calls.load(Ordering::SeqCst), 1);
}
