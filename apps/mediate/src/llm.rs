//! Transcript rewriting through an OpenAI-compatible chat-completions API.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::debug;

use mediate_core::{Rewriter, TransformResult};

/// Rough characters-per-token bound used for the output guardrail.
const CHARS_PER_TOKEN: f64 = 4.2;

/// Configuration for [`OpenAiRewriter`].
#[derive(Debug, Clone)]
pub struct RewriterConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub timeout: std::time::Duration,
    pub stop: Vec<String>,
    /// System prompt; a deployment choice, not part of the pipeline contract.
    pub system_prompt: String,
    /// User prompt template; `{transcript}` is replaced with the input.
    pub user_prompt_template: String,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/v1".to_string(),
            model: "hugging-quants/Meta-Llama-3.1-8B-Instruct-GPTQ-INT4".to_string(),
            temperature: 0.2,
            top_p: 0.9,
            max_tokens: 128,
            timeout: std::time::Duration::from_secs(30),
            stop: Vec::new(),
            system_prompt: "You perfect automatic speech recognition transcripts. Return only \
                            the corrected transcript with no explanations, headers, or meta \
                            commentary. If the transcript is blank or contains only noise \
                            markers, respond with the token [NO_SPEECH]."
                .to_string(),
            user_prompt_template: "Rewrite the transcript into clean, fluent text in the same \
                                   language. Do not add new information or commentary. Output \
                                   the corrected text only. If the transcript is blank, \
                                   non-speech, or noise markers such as [BLANK_AUDIO], reply \
                                   with [NO_SPEECH].\n\nTranscript:\n{transcript}\n\nCorrected \
                                   text:"
                .to_string(),
        }
    }
}

impl RewriterConfig {
    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("base_url must be provided");
        }
        if self.model.is_empty() {
            bail!("model must be provided");
        }
        if self.max_tokens == 0 {
            bail!("max_tokens must be positive");
        }
        if self.timeout.is_zero() {
            bail!("timeout must be positive");
        }
        Ok(())
    }

    fn char_cap(&self) -> usize {
        (self.max_tokens as f64 * CHARS_PER_TOKEN) as usize
    }

    fn build_payload(&self, transcript: &str) -> Value {
        let user_prompt = self
            .user_prompt_template
            .replace("{transcript}", transcript.trim());
        let mut payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": self.system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": self.temperature,
            "top_p": self.top_p,
            "max_tokens": self.max_tokens,
        });
        if !self.stop.is_empty() {
            payload["stop"] = json!(self.stop);
        }
        payload
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiRewriter {
    config: RewriterConfig,
    client: reqwest::blocking::Client,
}

impl OpenAiRewriter {
    pub fn new(mut config: RewriterConfig) -> Result<Self> {
        config.validate()?;
        while config.base_url.ends_with('/') {
            config.base_url.pop();
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client for the rewriter")?;
        Ok(Self { config, client })
    }
}

impl Rewriter for OpenAiRewriter {
    fn transform(&self, text: &str) -> Result<TransformResult> {
        let payload = self.config.build_payload(text);
        let url = format!("{}/chat/completions", self.config.base_url);
        debug!("rewrite request to {url}");

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .with_context(|| format!("rewrite request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("rewrite request failed with {status}: {}", body.trim());
        }
        let data: Value = response
            .json()
            .context("rewrite response was not valid JSON")?;

        let content = extract_content(&data);
        if content.is_empty() {
            bail!("rewrite response did not include completion content");
        }
        let mut cleaned = content.trim().to_string();
        let cap = self.config.char_cap();
        if cleaned.chars().count() > cap {
            cleaned = cleaned.chars().take(cap).collect::<String>();
            cleaned.truncate(cleaned.trim_end().len());
        }
        Ok(TransformResult {
            input_text: text.to_string(),
            output_text: cleaned,
            raw: data,
        })
    }
}

fn extract_content(data: &Value) -> String {
    let Some(choice) = data.get("choices").and_then(Value::as_array).and_then(|c| c.first())
    else {
        return String::new();
    };
    if let Some(content) = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return content.to_string();
    }
    choice
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
