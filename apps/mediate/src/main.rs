//! Entry point: wires the serial bridge, the whisper.cpp backend, and the
//! LLM/TTS clients into the session controller and runs capture cycles.

mod llm;
mod tts;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use llm::{OpenAiRewriter, RewriterConfig};
use mediate_core::{Journal, SerialBridge, SessionConfig, SessionController, VadConfig, DEFAULT_BAUD};
use tts::{SpeechConfig, SpeechStreamer};
use whisper_cli::{WhisperCliConfig, WhisperCliTranscriber};

/// Coordinate capture → ASR → LLM → TTS playback cycles against the
/// serial-attached audio device.
#[derive(Parser, Debug)]
#[command(name = "mediate", version)]
struct Cli {
    /// Serial port of the audio device (e.g. /dev/ttyACM0)
    #[arg(long)]
    port: String,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Path to the whisper.cpp executable or checkout directory
    #[arg(long)]
    whisper_binary: PathBuf,

    /// Path to the ggml model file
    #[arg(long)]
    whisper_model: PathBuf,

    /// Base URL of the OpenAI-compatible chat-completions service
    #[arg(long, default_value = "http://127.0.0.1:8000/v1")]
    llm_base_url: String,

    /// Model name exposed by the rewrite service
    #[arg(long, default_value = "hugging-quants/Meta-Llama-3.1-8B-Instruct-GPTQ-INT4")]
    llm_model: String,

    /// Base URL of the speech synthesis service
    #[arg(long, default_value = "http://127.0.0.1:8880/v1")]
    tts_base_url: String,

    /// Synthesis endpoint path
    #[arg(long, default_value = "/audio/speech")]
    tts_endpoint: String,

    /// Voice identifier (e.g. af_bella)
    #[arg(long)]
    tts_voice: Option<String>,

    /// Requested audio format from the synthesis service
    #[arg(long, default_value = "pcm", value_parser = ["pcm", "wav", "mp3", "flac", "opus", "m4a"])]
    tts_format: String,

    /// Additional payload fields forwarded to the synthesis service (repeatable)
    #[arg(long = "tts-extra", value_name = "KEY=VALUE")]
    tts_extra: Vec<String>,

    /// Playback sample rate for the device
    #[arg(long, default_value_t = 16_000)]
    playback_rate: u32,

    /// Sample rate assumed when the synthesis response does not declare one
    #[arg(long, default_value_t = 24_000)]
    tts_expected_rate: u32,

    /// Gain applied to playback audio, in dB
    #[arg(long, default_value_t = 0.0)]
    playback_gain_db: f64,

    /// Apply a ~250 Hz high-pass to playback audio
    #[arg(long)]
    high_pass_playback: bool,

    /// Directory for JSONL session journals
    #[arg(long, default_value = "logs/sessions")]
    log_dir: PathBuf,

    /// Stop after N completed cycles (default unlimited)
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Force-close captures that run longer than this many seconds
    #[arg(long)]
    max_capture_seconds: Option<f64>,

    #[arg(long, default_value_t = 30)]
    vad_frame_ms: u32,

    #[arg(long, default_value_t = 2)]
    vad_aggressiveness: u8,

    #[arg(long, default_value_t = 3)]
    vad_start_frames: u32,

    #[arg(long, default_value_t = 5)]
    vad_stop_frames: u32,

    #[arg(long, default_value_t = 2)]
    vad_preroll_frames: u32,
}

fn init_logging(log_dir: &std::path::Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(log_dir, "mediate.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);
    let console_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Parse repeatable `key=value` arguments into a JSON payload map.
fn parse_extra(values: &[String]) -> Result<Map<String, Value>> {
    let mut extras = Map::new();
    for item in values {
        let Some((key, raw_value)) = item.split_once('=') else {
            bail!("invalid extra payload entry (expected key=value): {item}");
        };
        extras.insert(key.trim().to_string(), auto_cast(raw_value.trim()));
    }
    Ok(extras)
}

/// Interpret a CLI value as bool, number, JSON, or fall back to a string.
fn auto_cast(value: &str) -> Value {
    match value.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(parsed) = serde_json::from_str::<Value>(value) {
        return parsed;
    }
    Value::String(value.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.log_dir)?;

    let extras = parse_extra(&cli.tts_extra)?;

    let vad = VadConfig::new(
        16_000,
        cli.vad_frame_ms,
        cli.vad_aggressiveness,
        cli.vad_start_frames,
        cli.vad_stop_frames,
        cli.vad_preroll_frames,
    )?;

    let session_config = SessionConfig {
        sample_rate: vad.sample_rate,
        playback_sample_rate: cli.playback_rate,
        playback_gain_db: cli.playback_gain_db,
        vad,
        max_capture_seconds: cli.max_capture_seconds,
        tts_expected_sample_rate: cli.tts_expected_rate,
        ..SessionConfig::default()
    };

    let journal_path = cli.log_dir.join(format!(
        "session_{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    let journal = Journal::open(&journal_path)
        .with_context(|| format!("failed to open journal at {}", journal_path.display()))?;
    info!("journal: {}", journal_path.display());

    let bridge = SerialBridge::open(&cli.port, cli.baud, cli.high_pass_playback)
        .with_context(|| format!("failed to open serial port {}", cli.port))?;

    let asr = WhisperCliTranscriber::new(WhisperCliConfig::new(
        &cli.whisper_binary,
        &cli.whisper_model,
    )?);

    let rewriter = OpenAiRewriter::new(RewriterConfig {
        base_url: cli.llm_base_url.clone(),
        model: cli.llm_model.clone(),
        ..RewriterConfig::default()
    })?;

    let synthesizer = SpeechStreamer::new(SpeechConfig {
        base_url: cli.tts_base_url.clone(),
        endpoint: cli.tts_endpoint.clone(),
        voice: cli.tts_voice.clone(),
        response_format: cli.tts_format.clone(),
        extra_payload: extras,
        ..SpeechConfig::default()
    })?;

    let mut controller =
        SessionController::new(bridge, asr, rewriter, synthesizer, session_config, journal)?;

    info!("entering mediation loop (max_cycles={:?})", cli.max_cycles);
    let outcome = controller.run(cli.max_cycles);
    info!(
        "mediation loop finished after {} completed cycles",
        controller.cycles_completed()
    );
    outcome?;
    Ok(())
}
