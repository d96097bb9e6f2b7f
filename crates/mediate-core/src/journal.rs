//! Append-only JSONL journal of controller state transitions.
//!
//! One canonical JSON object per line, flushed after every record so a crash
//! never loses committed transitions. Records are mirrored to the process
//! log sink; no rotation is performed here.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

pub struct Journal {
    file: Option<Mutex<BufWriter<File>>>,
    path: Option<PathBuf>,
}

impl Journal {
    /// Journal that only mirrors to the log sink.
    pub fn disabled() -> Self {
        Self {
            file: None,
            path: None,
        }
    }

    /// Open (or create) the JSONL file at `path` in append mode.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(BufWriter::new(file))),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one transition record.
    ///
    /// `metadata` must be a JSON object; its fields are merged after the
    /// timestamp, state, and session id.
    pub fn record(&self, state: &str, session: Option<&str>, metadata: Value) {
        let mut payload = serde_json::Map::new();
        payload.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        payload.insert("state".to_string(), Value::String(state.to_string()));
        if let Some(session) = session {
            payload.insert("session".to_string(), Value::String(session.to_string()));
        }
        if let Value::Object(map) = metadata {
            payload.extend(map);
        }

        let line = Value::Object(payload).to_string();
        info!(target: "journal", "{line}");

        if let Some(file) = &self.file {
            let mut writer = file.lock();
            if let Err(err) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
                warn!("failed to append journal record: {err}");
            }
        }
    }
}
