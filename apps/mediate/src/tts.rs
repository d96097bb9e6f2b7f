//! Streaming client for an OpenAI-compatible speech synthesis endpoint.
//!
//! `stream_synthesis` returns immediately; a worker thread posts the request
//! and feeds audio chunks through a bounded channel, so the controller sees
//! the first chunk as soon as the service produces it. The stream ends with
//! exactly one terminal chunk carrying byte totals and elapsed time.

use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use mediate_core::{SynthesisChunk, SynthesisStream, Synthesizer};

/// In-flight chunks buffered between the worker and the consumer.
const CHANNEL_DEPTH: usize = 8;

/// Configuration for [`SpeechStreamer`].
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub base_url: String,
    pub endpoint: String,
    pub model: String,
    pub voice: Option<String>,
    /// Requested audio container: pcm, wav, mp3, flac, opus, or m4a.
    pub response_format: String,
    pub speed: Option<f64>,
    pub stream_chunk_bytes: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Additional payload fields forwarded verbatim.
    pub extra_payload: Map<String, Value>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8880/v1".to_string(),
            endpoint: "/audio/speech".to_string(),
            model: "kokoro".to_string(),
            voice: None,
            response_format: "pcm".to_string(),
            speed: None,
            stream_chunk_bytes: 32_768,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            extra_payload: Map::new(),
        }
    }
}

impl SpeechConfig {
    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("base_url must be provided");
        }
        if self.endpoint.is_empty() {
            bail!("endpoint must be provided");
        }
        if self.model.is_empty() {
            bail!("model must be provided");
        }
        if self.stream_chunk_bytes == 0 {
            bail!("stream_chunk_bytes must be positive");
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        Ok(())
    }

    fn build_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let endpoint = if self.endpoint.starts_with('/') {
            self.endpoint.clone()
        } else {
            format!("/{}", self.endpoint)
        };
        format!("{base}{endpoint}")
    }

    fn accept_header(&self) -> &'static str {
        match self.response_format.to_lowercase().as_str() {
            "mp3" => "audio/mpeg",
            "wav" => "audio/wav",
            "flac" => "audio/flac",
            "m4a" => "audio/mp4",
            "opus" => "audio/ogg",
            "pcm" => "application/octet-stream",
            _ => "*/*",
        }
    }

    fn build_payload(&self, text: &str) -> Result<Value> {
        if text.trim().is_empty() {
            bail!("text to synthesize must be non-empty");
        }
        let mut payload = self.extra_payload.clone();
        payload
            .entry("model".to_string())
            .or_insert_with(|| Value::String(self.model.clone()));
        payload.insert("input".to_string(), Value::String(text.to_string()));
        if let Some(voice) = &self.voice {
            payload
                .entry("voice".to_string())
                .or_insert_with(|| Value::String(voice.clone()));
        }
        payload
            .entry("response_format".to_string())
            .or_insert_with(|| Value::String(self.response_format.clone()));
        if let Some(speed) = self.speed {
            if let Some(number) = serde_json::Number::from_f64(speed) {
                payload
                    .entry("speed".to_string())
                    .or_insert(Value::Number(number));
            }
        }
        Ok(Value::Object(payload))
    }
}

/// Streaming synthesis client.
pub struct SpeechStreamer {
    config: SpeechConfig,
    client: reqwest::blocking::Client,
}

impl SpeechStreamer {
    pub fn new(config: SpeechConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .context("failed to build HTTP client for synthesis")?;
        Ok(Self { config, client })
    }
}

impl Synthesizer for SpeechStreamer {
    fn stream_synthesis(&self, text: &str) -> Result<SynthesisStream> {
        let payload = self.config.build_payload(text)?;
        let url = self.config.build_url();
        let accept = self.config.accept_header();
        let chunk_bytes = self.config.stream_chunk_bytes;
        let client = self.client.clone();

        let (tx, rx) = crossbeam_channel::bounded::<Result<SynthesisChunk>>(CHANNEL_DEPTH);
        std::thread::spawn(move || {
            stream_worker(client, url, payload, accept, chunk_bytes, tx);
        });
        Ok(Box::new(rx.into_iter()))
    }
}

fn stream_worker(
    client: reqwest::blocking::Client,
    url: String,
    payload: Value,
    accept: &'static str,
    chunk_bytes: usize,
    tx: crossbeam_channel::Sender<Result<SynthesisChunk>>,
) {
    let started = Instant::now();
    let response = match client
        .post(&url)
        .json(&payload)
        .header(reqwest::header::ACCEPT, accept)
        .send()
    {
        Ok(response) => response,
        Err(err) => {
            let _ = tx.send(Err(anyhow!(err).context(format!("synthesis request to {url} failed"))));
            return;
        }
    };

    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    if !status.is_success() {
        let detail = extract_error_detail(response);
        let _ = tx.send(Err(anyhow!(
            "synthesis request failed with status {status}: {detail}"
        )));
        return;
    }
    if content_type
        .as_deref()
        .is_some_and(|ct| ct.to_lowercase().contains("application/json"))
    {
        let detail = extract_error_detail(response);
        let _ = tx.send(Err(anyhow!(
            "synthesis service returned JSON instead of audio: {detail}"
        )));
        return;
    }

    let mut response = response;
    let mut buf = vec![0u8; chunk_bytes];
    let mut sequence: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut first_chunk_latency: Option<Duration> = None;

    loop {
        match response.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                sequence += 1;
                total_bytes += n as u64;
                if first_chunk_latency.is_none() {
                    first_chunk_latency = Some(started.elapsed());
                }
                let chunk = SynthesisChunk {
                    sequence,
                    data: buf[..n].to_vec(),
                    is_last: false,
                    total_bytes,
                    first_chunk_latency: if sequence == 1 { first_chunk_latency } else { None },
                    elapsed: None,
                    content_type: content_type.clone(),
                    headers: headers.clone(),
                };
                if tx.send(Ok(chunk)).is_err() {
                    debug!("synthesis consumer went away; aborting stream");
                    return;
                }
            }
            Err(err) => {
                warn!("synthesis stream read failed after {total_bytes} bytes: {err}");
                let _ = tx.send(Err(anyhow!(err).context("synthesis stream read failed")));
                return;
            }
        }
    }

    let terminal = SynthesisChunk {
        sequence: sequence + 1,
        data: Vec::new(),
        is_last: true,
        total_bytes,
        first_chunk_latency,
        elapsed: Some(started.elapsed()),
        content_type,
        headers,
    };
    let _ = tx.send(Ok(terminal));
}

fn extract_error_detail(response: reqwest::blocking::Response) -> String {
    match response.text() {
        Ok(text) => text.chars().take(400).collect(),
        Err(_) => String::from("<unreadable body>"),
    }
}
