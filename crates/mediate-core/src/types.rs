//! Interface types for the external pipeline stages.
//!
//! The controller only ever sees these traits; the concrete engines (an
//! offline CLI, an HTTP service, an in-process model) are wired in by the
//! application.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;

/// Device-reported presence telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presence {
    /// No telemetry received yet.
    #[default]
    Unknown,
    /// A person is in front of the device; capture is allowed.
    Active,
    /// Nobody present; audio is discarded.
    Idle,
}

/// Result of transcribing one speech segment.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    /// Cleaned full transcript.
    pub text: String,
    /// Per-segment transcript lines, when the engine reports them.
    pub segments: Vec<String>,
    /// Engine-specific metadata (raw JSON output, timing, ...).
    pub metadata: Option<serde_json::Value>,
    /// Identifier of the backend that produced this result.
    pub source: String,
}

/// Result of rewriting a transcript through the language model.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub input_text: String,
    /// Single line of plain text, or a noise marker such as `[NO_SPEECH]`.
    pub output_text: String,
    /// Raw response payload for the journal.
    pub raw: serde_json::Value,
}

/// One element of a synthesis stream.
///
/// Exactly one chunk per stream has `is_last = true`; it carries no audio
/// and reports the stream totals.
#[derive(Debug, Clone, Default)]
pub struct SynthesisChunk {
    pub sequence: u64,
    pub data: Vec<u8>,
    pub is_last: bool,
    pub total_bytes: u64,
    pub first_chunk_latency: Option<Duration>,
    pub elapsed: Option<Duration>,
    pub content_type: Option<String>,
    /// Response headers, lowercased keys.
    pub headers: HashMap<String, String>,
}

/// Speech-to-text capability.
pub trait Transcriber {
    /// Transcribe raw little-endian s16 mono PCM.
    fn transcribe_pcm(&self, pcm: &[u8], sample_rate: u32) -> Result<TranscriptionResult>;

    /// Transcribe an audio file on disk.
    fn transcribe_file(&self, path: &Path) -> Result<TranscriptionResult>;
}

/// Transcript rewriting capability.
pub trait Rewriter {
    fn transform(&self, text: &str) -> Result<TransformResult>;
}

/// A lazy, finite, non-restartable sequence of synthesis chunks.
pub type SynthesisStream = Box<dyn Iterator<Item = Result<SynthesisChunk>> + Send>;

/// Streaming text-to-speech capability.
pub trait Synthesizer {
    fn stream_synthesis(&self, text: &str) -> Result<SynthesisStream>;
}
