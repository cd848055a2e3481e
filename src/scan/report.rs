//! Summary rendering and delivery.
//!
//! The scan's read side ([`crate::scan::engine`]) hands over a report;
//! this side turns it into messages. The daily summary is edited in
//! place while it stays current: same home-timezone date, and the user
//! has not spoken since it went out (editing a message the user already
//! scrolled past would go unseen). Alerts are standalone sends, deduped
//! by condition signature so an unchanged situation is announced once.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::channels::channel::{MessageRef, Outbox, OutgoingMessage};
use crate::error::ChannelError;
use crate::journal::{InteractionDraft, Journal, RunMode};
use crate::model::TaskRecord;
use crate::scan::engine::ScanReport;
use crate::state::{DailySummaryState, StateStore};

/// Listing cap per tier; the rest folds into a count.
const TIER_DISPLAY_MAX: usize = 5;

/// The summary text, or nothing when every tier is empty. Alerts do
/// not count; they travel as their own messages.
pub fn render_summary(report: &ScanReport) -> Option<String> {
    if report.overdue.is_empty() && report.due_soon.is_empty() && report.stale.is_empty() {
        return None;
    }
    let mut out = format!("*Task scan for {}*\n", report.date);
    push_tier(&mut out, "Overdue", &report.overdue, due_line);
    push_tier(&mut out, "Due soon", &report.due_soon, due_line);
    push_tier(&mut out, "Going stale", &report.stale, stale_line);
    out.push_str(&format!("\n{} open tasks.", report.open_count));
    Some(out)
}

fn push_tier(
    out: &mut String,
    heading: &str,
    tasks: &[TaskRecord],
    line: fn(&TaskRecord) -> String,
) {
    if tasks.is_empty() {
        return;
    }
    out.push_str(&format!("\n*{heading} ({})*\n", tasks.len()));
    for task in tasks.iter().take(TIER_DISPLAY_MAX) {
        out.push_str(&line(task));
        out.push('\n');
    }
    if tasks.len() > TIER_DISPLAY_MAX {
        out.push_str(&format!("…and {} more\n", tasks.len() - TIER_DISPLAY_MAX));
    }
}

fn due_line(task: &TaskRecord) -> String {
    match task.target_date {
        Some(date) => format!("• {} (due {date})", task.title),
        None => format!("• {}", task.title),
    }
}

fn stale_line(task: &TaskRecord) -> String {
    match task.edited_at {
        Some(ts) => format!("• {} (last touched {})", task.title, ts.date_naive()),
        None => format!("• {}", task.title),
    }
}

/// Delivers scan output and keeps the summary/alert bookkeeping.
pub struct SummaryPublisher {
    outbox: Outbox,
    state: Arc<StateStore>,
    journal: Arc<Journal>,
}

impl SummaryPublisher {
    pub fn new(outbox: Outbox, state: Arc<StateStore>, journal: Arc<Journal>) -> Self {
        SummaryPublisher {
            outbox,
            state,
            journal,
        }
    }

    /// Deliver one scan cycle and append its interaction record.
    ///
    /// `with_summary` is true for the daily review and manual cycles;
    /// hourly ticks deliver alerts only. Failed sends leave no
    /// bookkeeping behind, so the next cycle retries them.
    pub async fn publish(
        &self,
        report: &ScanReport,
        now: DateTime<Utc>,
        with_summary: bool,
        trigger: &str,
    ) {
        let mut draft = InteractionDraft::new(RunMode::Proactive, trigger);
        draft.push_step(
            "scan",
            json!({ "date": report.date.to_string() }),
            &report.tier_counts(),
            None,
        );
        let mut all_sent = true;

        let summary = if with_summary { render_summary(report) } else { None };
        if let Some(text) = &summary {
            if let Err(e) = self.deliver_summary(report, text, now).await {
                tracing::warn!(error = %e, "summary delivery failed");
                draft.set_error(format!("summary delivery failed: {e}"));
                all_sent = false;
            }
        }

        self.deliver_alerts(report, &mut draft, &mut all_sent).await;

        let response = summary.unwrap_or_else(|| "(nothing to send)".to_string());
        if let Err(e) = self.journal.append(&draft.finish(&response, all_sent)).await {
            tracing::warn!(error = %e, "scan journal append failed");
        }
    }

    /// Same-day summary is edited in place while the user has been
    /// quiet since it went out; anything else gets a fresh message.
    async fn deliver_summary(
        &self,
        report: &ScanReport,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ChannelError> {
        let snapshot = self.state.snapshot().await;
        let editable = snapshot
            .daily_summary
            .as_ref()
            .filter(|s| s.date == report.date && !snapshot.user_active_since_summary());

        if let Some(existing) = editable {
            match self
                .outbox
                .edit(&existing.message, OutgoingMessage::markdown(text))
                .await
            {
                Ok(()) => {
                    tracing::info!(date = %report.date, "summary updated in place");
                    let stamp = existing.message.clone();
                    self.record_summary(report, stamp, now).await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "summary edit failed, sending fresh");
                }
            }
        }

        let message = self.outbox.send(OutgoingMessage::markdown(text)).await?;
        tracing::info!(date = %report.date, "summary sent");
        self.record_summary(report, message, now).await;
        Ok(())
    }

    async fn record_summary(&self, report: &ScanReport, message: MessageRef, now: DateTime<Utc>) {
        let date = report.date;
        let result = self
            .state
            .mutate(move |s| {
                s.daily_summary = Some(DailySummaryState {
                    date,
                    message,
                    sent_at: now,
                });
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "summary state persist failed");
        }
    }

    /// Send each alert whose signature changed since the last cycle.
    /// Conditions that cleared drop out of the book, so a later
    /// recurrence announces again.
    async fn deliver_alerts(
        &self,
        report: &ScanReport,
        draft: &mut InteractionDraft,
        all_sent: &mut bool,
    ) {
        let previous = self.state.snapshot().await.alert_signatures;
        if report.alerts.is_empty() && previous.is_empty() {
            return;
        }
        let mut next: BTreeMap<String, String> = BTreeMap::new();

        for alert in &report.alerts {
            let key = alert.key();
            let signature = alert.signature();
            if previous.get(key) == Some(&signature) {
                draft.push_step(
                    "alert",
                    json!({ "signature": signature }),
                    "suppressed, unchanged since last cycle",
                    None,
                );
                next.insert(key.to_string(), signature);
                continue;
            }
            match self.outbox.send(OutgoingMessage::plain(alert.render())).await {
                Ok(_) => {
                    tracing::info!(signature = %signature, "alert sent");
                    draft.push_step("alert", json!({ "signature": signature }), "sent", None);
                    next.insert(key.to_string(), signature);
                }
                Err(e) => {
                    // No signature recorded: the next cycle retries.
                    tracing::warn!(error = %e, signature = %signature, "alert send failed");
                    draft.push_step(
                        "alert",
                        json!({ "signature": signature }),
                        "send failed",
                        Some(e.to_string()),
                    );
                    *all_sent = false;
                }
            }
        }

        let result = self.state.mutate(move |s| s.alert_signatures = next).await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "alert state persist failed");
        }
    }
}
