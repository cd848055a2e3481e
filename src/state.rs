//! Durable operational state.
//!
//! The only things persisted locally: the cleanup queue, the daily
//! summary handle, alert signatures, and the last-seen user activity
//! timestamp. Task content lives in the store, never here. One JSON
//! document, loaded at startup, rewritten after every mutation under a
//! single writer lock.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::channels::channel::MessageRef;
use crate::error::StateError;

/// One queued cleanup candidate. Position is its index in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupEntry {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Where today's summary lives, so the hourly scan can edit it in
/// place instead of stacking new messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummaryState {
    /// Calendar date in the home timezone the summary belongs to.
    pub date: NaiveDate,
    pub message: MessageRef,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default)]
    pub cleanup_queue: Vec<CleanupEntry>,
    #[serde(default)]
    pub cleanup_last_refill: Option<DateTime<Utc>>,
    #[serde(default)]
    pub daily_summary: Option<DailySummaryState>,
    /// Condition kind -> last alerted signature.
    #[serde(default)]
    pub alert_signatures: BTreeMap<String, String>,
    #[serde(default)]
    pub last_user_interaction: Option<DateTime<Utc>>,
}

impl AppState {
    pub fn queue_contains(&self, id: &str) -> bool {
        self.cleanup_queue.iter().any(|e| e.id == id)
    }

    /// Append if absent. Returns whether the entry was added.
    pub fn queue_append(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        if self.queue_contains(id) {
            return false;
        }
        self.cleanup_queue.push(CleanupEntry {
            id: id.to_string(),
            enqueued_at: now,
        });
        true
    }

    /// Remove wherever it sits. Returns whether anything was removed.
    pub fn queue_remove(&mut self, id: &str) -> bool {
        let before = self.cleanup_queue.len();
        self.cleanup_queue.retain(|e| e.id != id);
        self.cleanup_queue.len() != before
    }

    /// Move an entry to the tail, keeping its original enqueue time.
    /// Returns false when the id is not queued.
    pub fn queue_defer(&mut self, id: &str) -> bool {
        let Some(pos) = self.cleanup_queue.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = self.cleanup_queue.remove(pos);
        self.cleanup_queue.push(entry);
        true
    }

    /// First `n` entries without consuming them.
    pub fn queue_head(&self, n: usize) -> Vec<CleanupEntry> {
        self.cleanup_queue.iter().take(n).cloned().collect()
    }

    /// Has the user said anything since the current summary went out?
    pub fn user_active_since_summary(&self) -> bool {
        match (&self.daily_summary, self.last_user_interaction) {
            (Some(summary), Some(seen)) => seen > summary.sent_at,
            _ => false,
        }
    }
}

/// Owns the state file. All mutation goes through [`StateStore::mutate`],
/// which persists before releasing the lock, so resolutions can never
/// interleave half-written.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<AppState>,
}

impl StateStore {
    /// Load from disk. A missing file starts fresh; an unreadable one
    /// also starts fresh, loudly, rather than refusing to boot.
    pub async fn load(path: PathBuf) -> Result<Self, StateError> {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "state file corrupt, starting fresh");
                    AppState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(StateStore {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> AppState {
        self.state.lock().await.clone()
    }

    /// Apply a mutation and persist it before anyone else can run.
    pub async fn mutate<F, R>(&self, apply: F) -> Result<R, StateError>
    where
        F: FnOnce(&mut AppState) -> R,
    {
        let mut state = self.state.lock().await;
        let result = apply(&mut state);
        self.persist(&state).await?;
        Ok(result)
    }

    async fn persist(&self, state: &AppState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(state).map_err(|e| StateError::Corrupt {
            reason: format!("state serialization failed: {e}"),
        })?;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}
