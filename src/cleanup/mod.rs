//! Stale-backlog cleanup.
//!
//! A durable queue of long-untouched backlog tasks cycles through the
//! user a few at a time. Refill discovers qualifying tasks and appends
//! newcomers oldest-first; presentation shows the head of the queue
//! with Keep / Retire / Later buttons without consuming it; resolution
//! applies the pressed choice. Every mutation is persisted through the
//! state store, so a restart resumes exactly where the queue stood.
//!
//! Resolution is deliberately forgiving: the same button delivered
//! twice, or a task closed out-of-band in the store, ends in a calm
//! no-op rather than an error.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::channels::channel::{Choice, Outbox, OutgoingMessage};
use crate::config::PolicyConfig;
use crate::error::StoreError;
use crate::journal::{InteractionDraft, Journal, RunMode};
use crate::model::{TaskRecord, TaskStatus};
use crate::state::{CleanupEntry, StateStore};
use crate::store::backend::TaskQuery;
use crate::store::resilient::{Deadline, ResilientStore};

/// Callback data prefix for cleanup buttons.
pub const CALLBACK_PREFIX: &str = "cleanup";

/// The three-way choice on a presented entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the task; stop asking about it.
    Retain,
    /// Close it in the store as Won't Do.
    Retire,
    /// Ask again after the rest of the queue has had its turn.
    Defer,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Retain => "retain",
            Disposition::Retire => "retire",
            Disposition::Defer => "defer",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Disposition::Retain => "keep",
            Disposition::Retire => "retire",
            Disposition::Defer => "later",
        }
    }

    fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "keep" => Some(Disposition::Retain),
            "retire" => Some(Disposition::Retire),
            "later" => Some(Disposition::Defer),
            _ => None,
        }
    }
}

/// What a resolution actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Retained,
    Retired,
    Deferred,
    /// The store already had it closed; dropped from review.
    AlreadyClosed,
    /// Not in the queue any more; a repeat press or a stale button.
    AlreadyHandled,
}

impl Resolution {
    /// Button-ack text shown to the user.
    pub fn feedback(&self) -> &'static str {
        match self {
            Resolution::Retained => "Kept.",
            Resolution::Retired => "Retired as Won't Do.",
            Resolution::Deferred => "Moved to the back of the queue.",
            Resolution::AlreadyClosed => "Already closed in the store; removed from review.",
            Resolution::AlreadyHandled => "Already handled.",
        }
    }
}

/// Parse cleanup button data of the form `cleanup:<verb>:<task id>`.
pub fn parse_callback(data: &str) -> Option<(Disposition, &str)> {
    let rest = data.strip_prefix(CALLBACK_PREFIX)?.strip_prefix(':')?;
    let (verb, id) = rest.split_once(':')?;
    let disposition = Disposition::from_verb(verb)?;
    if id.is_empty() {
        return None;
    }
    Some((disposition, id))
}

pub fn handles(data: &str) -> bool {
    parse_callback(data).is_some()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PresentOutcome {
    pub shown: usize,
    pub dropped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct CleanupService {
    store: ResilientStore,
    state: Arc<StateStore>,
    policy: PolicyConfig,
}

impl CleanupService {
    pub fn new(store: ResilientStore, state: Arc<StateStore>, policy: PolicyConfig) -> Self {
        CleanupService {
            store,
            state,
            policy,
        }
    }

    /// Discover qualifying backlog and append newcomers at the tail,
    /// oldest creation first. Identifiers already queued are left
    /// untouched, so calling this twice changes nothing.
    pub async fn refill(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let cutoff = now - Duration::days(i64::from(self.policy.cleanup_age_days));
        let candidates = self
            .store
            .query_tasks(&TaskQuery::cleanup_candidates(cutoff), Deadline::Bulk)
            .await
            .context("cleanup refill query")?;

        let added = self
            .state
            .mutate(|s| {
                let mut added = 0;
                for task in &candidates {
                    if s.queue_append(&task.id, now) {
                        added += 1;
                    }
                }
                s.cleanup_last_refill = Some(now);
                added
            })
            .await?;
        tracing::info!(candidates = candidates.len(), added, "cleanup refill");
        Ok(added)
    }

    /// Head of the queue, up to the batch size. Presentation only;
    /// nothing is removed until the user answers.
    pub async fn next_batch(&self) -> Vec<CleanupEntry> {
        self.state
            .snapshot()
            .await
            .queue_head(self.policy.cleanup_batch)
    }

    /// Show the current batch, one message per task.
    ///
    /// Each entry is re-read first: tasks closed or deleted out-of-band
    /// drop out silently instead of being asked about. A fetch or send
    /// failure leaves the entry queued for the next cycle.
    pub async fn present_batch(&self, outbox: &Outbox) -> PresentOutcome {
        let mut outcome = PresentOutcome::default();
        for entry in self.next_batch().await {
            let task = match self.store.fetch_task(&entry.id, Deadline::Bulk).await {
                Ok(task) => task,
                Err(StoreError::NotFound { .. }) => {
                    tracing::info!(id = %entry.id, "queued task vanished, dropping");
                    self.drop_entry(&entry.id).await;
                    outcome.dropped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(id = %entry.id, error = %e, "cleanup fetch failed, will retry");
                    outcome.failed += 1;
                    continue;
                }
            };
            if task.status.is_some_and(|s| s.is_terminal()) {
                tracing::info!(id = %entry.id, "queued task already closed, dropping");
                self.drop_entry(&entry.id).await;
                outcome.dropped += 1;
                continue;
            }

            let message = OutgoingMessage::plain(presentation_text(&task, &entry))
                .with_buttons(vec![vec![
                    Choice::new("Keep", button_data(Disposition::Retain, &task.id)),
                    Choice::new("Retire", button_data(Disposition::Retire, &task.id)),
                    Choice::new("Later", button_data(Disposition::Defer, &task.id)),
                ]]);
            match outbox.send(message).await {
                Ok(_) => outcome.shown += 1,
                Err(e) => {
                    tracing::warn!(id = %entry.id, error = %e, "cleanup send failed, will retry");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Apply one disposition.
    ///
    /// Membership is checked first: an identifier no longer queued is a
    /// finished conversation, whatever the button says. Retire re-reads
    /// the record and leaves an out-of-band close untouched.
    pub async fn resolve(&self, id: &str, disposition: Disposition) -> anyhow::Result<Resolution> {
        if !self.state.snapshot().await.queue_contains(id) {
            return Ok(Resolution::AlreadyHandled);
        }
        let resolution = match disposition {
            Disposition::Retain => {
                let removed = self.state.mutate(|s| s.queue_remove(id)).await?;
                if removed {
                    Resolution::Retained
                } else {
                    Resolution::AlreadyHandled
                }
            }
            Disposition::Defer => {
                let moved = self.state.mutate(|s| s.queue_defer(id)).await?;
                if moved {
                    Resolution::Deferred
                } else {
                    Resolution::AlreadyHandled
                }
            }
            Disposition::Retire => match self.store.fetch_task(id, Deadline::Interactive).await {
                Ok(task) if task.status.is_some_and(|s| s.is_terminal()) => {
                    self.drop_entry(id).await;
                    Resolution::AlreadyClosed
                }
                Ok(_) => {
                    self.store
                        .update_status(id, TaskStatus::WontDo, Deadline::Interactive)
                        .await
                        .context("cleanup retire update")?;
                    self.drop_entry(id).await;
                    Resolution::Retired
                }
                Err(StoreError::NotFound { .. }) => {
                    self.drop_entry(id).await;
                    Resolution::AlreadyClosed
                }
                // Leave it queued; the user can press again.
                Err(e) => return Err(e).context("cleanup retire fetch"),
            },
        };
        tracing::info!(id, disposition = disposition.as_str(), ?resolution, "cleanup resolved");
        Ok(resolution)
    }

    /// One scheduled pass: refill, then present, then journal.
    pub async fn run_cycle(&self, outbox: &Outbox, journal: &Journal, now: DateTime<Utc>) {
        let mut draft = InteractionDraft::new(RunMode::Proactive, "cleanup cycle");

        match self.refill(now).await {
            Ok(added) => {
                draft.push_step("refill", json!({}), &format!("{added} newly queued"), None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cleanup refill failed");
                draft.push_step("refill", json!({}), "refill failed", Some(e.to_string()));
                draft.set_error(format!("refill failed: {e}"));
            }
        }

        let outcome = self.present_batch(outbox).await;
        draft.push_step(
            "present",
            json!({ "batch": self.policy.cleanup_batch }),
            &format!(
                "{} shown, {} dropped, {} failed",
                outcome.shown, outcome.dropped, outcome.failed
            ),
            None,
        );

        let response = if outcome.shown == 0 {
            "(no stale tasks to review)".to_string()
        } else {
            format!("{} stale tasks presented for review", outcome.shown)
        };
        let record = draft.finish(&response, outcome.failed == 0);
        if let Err(e) = journal.append(&record).await {
            tracing::warn!(error = %e, "cleanup journal append failed");
        }
    }

    async fn drop_entry(&self, id: &str) {
        if let Err(e) = self.state.mutate(|s| s.queue_remove(id)).await {
            tracing::warn!(id, error = %e, "queue removal persist failed");
        }
    }
}

fn button_data(disposition: Disposition, id: &str) -> String {
    format!("{CALLBACK_PREFIX}:{}:{id}", disposition.verb())
}

fn presentation_text(task: &TaskRecord, entry: &CleanupEntry) -> String {
    let mut text = format!("Stale backlog review:\n{}", task.title);
    if let Some(status) = task.status {
        text.push_str(&format!("\nStatus: {status}"));
    }
    if let Some(created) = task.created_at {
        text.push_str(&format!("\nCreated: {}", created.date_naive()));
    }
    let _ = entry;
    text.push_str("\n\nKeep it, retire it, or decide later?");
    text
}
