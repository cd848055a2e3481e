//! Append-only interaction journal.
//!
//! One JSONL line per agent or scan run: what came in, which tools ran
//! with what outcome, what went back out, and whether delivery actually
//! happened. The file is the audit trail; a size cap keeps it from
//! growing without bound by dropping the older half on rotation.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::StateError;

/// Rotation threshold.
pub const JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
/// Per-step result summaries are bounded; full payloads never land here.
const SUMMARY_MAX: usize = 200;
/// Stored response snippet length.
const RESPONSE_SNIPPET_MAX: usize = 500;

/// What initiated a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// A user message.
    Chat,
    /// A scheduled scan or check-in.
    Proactive,
}

/// One tool round inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    pub tool: String,
    pub input: Value,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub ts: DateTime<Utc>,
    pub mode: RunMode,
    pub input: String,
    pub steps: Vec<ToolStep>,
    pub response: String,
    pub response_sent: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Accumulates a record while a run is in flight. Delivery outcome is
/// only known after the reply is sent, so the record is sealed by
/// [`InteractionDraft::finish`].
#[derive(Debug)]
pub struct InteractionDraft {
    started: Instant,
    ts: DateTime<Utc>,
    mode: RunMode,
    input: String,
    steps: Vec<ToolStep>,
    error: Option<String>,
}

impl InteractionDraft {
    pub fn new(mode: RunMode, input: &str) -> Self {
        InteractionDraft {
            started: Instant::now(),
            ts: Utc::now(),
            mode,
            input: input.to_string(),
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn push_step(&mut self, tool: &str, input: Value, summary: &str, error: Option<String>) {
        self.steps.push(ToolStep {
            tool: tool.to_string(),
            input,
            summary: clip(summary, SUMMARY_MAX),
            error,
        });
    }

    /// Record the run-level failure. Later calls overwrite; the last
    /// word on a run wins.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn finish(self, response: &str, response_sent: bool) -> InteractionRecord {
        InteractionRecord {
            ts: self.ts,
            mode: self.mode,
            input: self.input,
            steps: self.steps,
            response: clip(response, RESPONSE_SNIPPET_MAX),
            response_sent,
            duration_ms: self.started.elapsed().as_millis() as u64,
            error: self.error,
        }
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut clipped: String = text.chars().take(max.saturating_sub(1)).collect();
        clipped.push('…');
        clipped
    }
}

/// JSONL writer with size-capped rotation and a tail query for the ops
/// surface.
pub struct Journal {
    path: PathBuf,
    max_bytes: u64,
}

impl Journal {
    pub fn new(path: PathBuf) -> Self {
        Journal {
            path,
            max_bytes: JOURNAL_MAX_BYTES,
        }
    }

    #[cfg(test)]
    fn with_max_bytes(path: PathBuf, max_bytes: u64) -> Self {
        Journal { path, max_bytes }
    }

    pub async fn append(&self, record: &InteractionRecord) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let line = serde_json::to_string(record).map_err(|e| StateError::Corrupt {
            reason: format!("record serialization failed: {e}"),
        })?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        if file.metadata().await?.len() > self.max_bytes {
            drop(file);
            let contents = tokio::fs::read_to_string(&self.path).await?;
            tokio::fs::write(&self.path, keep_newer_half(&contents)).await?;
        }

        tracing::info!(
            mode = ?record.mode,
            steps = record.steps.len(),
            response_sent = record.response_sent,
            duration_ms = record.duration_ms,
            error = record.error.as_deref().unwrap_or(""),
            "interaction recorded"
        );
        Ok(())
    }

    /// Last `count` records, newest last. Unparseable lines are skipped,
    /// not fatal: the journal outlives format changes.
    pub async fn tail(
        &self,
        count: usize,
        errors_only: bool,
    ) -> Result<Vec<InteractionRecord>, StateError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let records: Vec<InteractionRecord> = contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|r: &InteractionRecord| !errors_only || r.error.is_some())
            .collect();
        let skip = records.len().saturating_sub(count);
        Ok(records.into_iter().skip(skip).collect())
    }
}

fn keep_newer_half(contents: &str) -> String {
    let lines: Vec<&str> = contents.lines().collect();
    let keep_from = lines.len() / 2;
    let mut kept = lines[keep_from..].join("\n");
    if !kept.is_empty() {
        kept.push('\n');
    }
    tracing::info!(dropped = keep_from, "journal rotated");
    kept
}
