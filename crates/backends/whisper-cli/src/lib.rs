//! Offline transcription through the whisper.cpp command-line tool.
//!
//! PCM segments are written to a temporary 16-bit mono WAV, the CLI is
//! invoked with JSON output enabled, and the result file is parsed into a
//! [`TranscriptionResult`]. No model stays resident between calls, which
//! keeps this backend completely stateless at the cost of per-call startup.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::debug;

use mediate_core::{TranscriptionResult, Transcriber};

const BACKEND_ID: &str = "whisper-cli";

/// Well-known executable locations relative to a whisper.cpp checkout.
const BINARY_CANDIDATES: [&str; 6] = [
    "whisper-cli",
    "build/bin/whisper-cli",
    "bin/whisper-cli",
    "main",
    "build/bin/main",
    "bin/main",
];

/// Configuration for running the whisper.cpp CLI.
#[derive(Debug, Clone)]
pub struct WhisperCliConfig {
    pub binary_path: PathBuf,
    pub model_path: PathBuf,
    pub language: String,
    pub translate: bool,
    pub extra_args: Vec<String>,
}

impl WhisperCliConfig {
    /// Resolve and validate paths. `binary_path` may point at the executable
    /// itself or at a checkout directory containing one of the usual build
    /// locations.
    pub fn new(binary_path: &Path, model_path: &Path) -> Result<Self> {
        let binary_path = resolve_binary(binary_path)?;
        if !model_path.exists() {
            bail!("whisper model not found at {}", model_path.display());
        }
        Ok(Self {
            binary_path,
            model_path: model_path.to_path_buf(),
            language: "en".to_string(),
            translate: false,
            extra_args: Vec::new(),
        })
    }
}

fn resolve_binary(candidate: &Path) -> Result<PathBuf> {
    if candidate.is_file() {
        return Ok(candidate.to_path_buf());
    }
    for name in BINARY_CANDIDATES {
        let probe = candidate.join(name);
        if probe.is_file() {
            return Ok(probe);
        }
    }
    bail!(
        "could not find a whisper.cpp executable at {} or its usual build subpaths",
        candidate.display()
    )
}

/// Runs whisper.cpp against PCM buffers or audio files.
pub struct WhisperCliTranscriber {
    config: WhisperCliConfig,
}

impl WhisperCliTranscriber {
    pub fn new(config: WhisperCliConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, audio_path: &Path, out_prefix: &Path) -> Command {
        let cfg = &self.config;
        let mut cmd = Command::new(&cfg.binary_path);
        cmd.arg("-m")
            .arg(&cfg.model_path)
            .arg("-f")
            .arg(audio_path)
            .arg("--language")
            .arg(&cfg.language)
            .arg("--output-json")
            .arg("--output-file")
            .arg(out_prefix);
        if cfg.translate {
            cmd.arg("--translate");
        }
        for extra in &cfg.extra_args {
            cmd.arg(extra);
        }
        cmd
    }
}

impl Transcriber for WhisperCliTranscriber {
    fn transcribe_pcm(&self, pcm: &[u8], sample_rate: u32) -> Result<TranscriptionResult> {
        let dir = tempfile::tempdir().context("failed to create scratch directory")?;
        let wav_path = dir.path().join("segment.wav");
        write_wav(&wav_path, pcm, sample_rate)?;
        self.transcribe_file(&wav_path)
    }

    fn transcribe_file(&self, audio_path: &Path) -> Result<TranscriptionResult> {
        if !audio_path.exists() {
            bail!("audio file not found: {}", audio_path.display());
        }
        let dir = tempfile::tempdir().context("failed to create scratch directory")?;
        let out_prefix = dir.path().join("out");

        let mut cmd = self.build_command(audio_path, &out_prefix);
        debug!("running {:?}", cmd);
        let output = cmd
            .output()
            .with_context(|| format!("failed to launch {}", self.config.binary_path.display()))?;
        if !output.status.success() {
            bail!(
                "whisper.cpp exited with {}:\n{}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let json_path = out_prefix.with_extension("json");
        let raw = std::fs::read_to_string(&json_path)
            .with_context(|| format!("whisper.cpp output missing at {}", json_path.display()))?;
        let data: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse whisper.cpp JSON at {}", json_path.display()))?;

        Ok(TranscriptionResult {
            text: extract_text(&data),
            segments: extract_segments(&data),
            metadata: Some(data),
            source: BACKEND_ID.to_string(),
        })
    }
}

fn write_wav(path: &Path, pcm: &[u8], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create WAV at {}", path.display()))?;
    for pair in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
    }
    writer.finalize()?;
    Ok(())
}

fn extract_text(data: &Value) -> String {
    if let Some(text) = data.get("text").and_then(Value::as_str) {
        return text.trim().to_string();
    }
    if let Some(items) = data.get("transcription").and_then(Value::as_array) {
        let joined: String = items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        return joined.trim().to_string();
    }
    String::new()
}

fn extract_segments(data: &Value) -> Vec<String> {
    if let Some(items) = data.get("transcription").and_then(Value::as_array) {
        return items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .map(|text| text.trim().to_string())
            .collect();
    }
    if let Some(text) = data.get("text").and_then(Value::as_str) {
        return vec![text.trim().to_string()];
    }
    Vec::new()
}
