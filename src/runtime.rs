//! Event loop: one channel, one user, one assistant.
//!
//! Every incoming event lands here. Ordinary text goes through the
//! agent and the reply goes back out; slash commands are handled
//! locally without burning a model call; button presses are routed to
//! whichever subsystem minted the button. Each handled message ends as
//! exactly one interaction record, finished with the actual delivery
//! outcome.
//!
//! Handlers run as spawned tasks so the loop keeps consuming events
//! while the agent is mid-run. That is what lets a confirmation button
//! press arrive while the asking run is still parked on the gate.

use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use futures::StreamExt;

use crate::agent::{Agent, ConfirmationGate};
use crate::channels::channel::{
    ButtonPress, Channel, ChannelEvent, IncomingMessage, Outbox, OutgoingMessage,
};
use crate::cleanup::{self, CleanupService};
use crate::error::ChannelError;
use crate::journal::{InteractionRecord, Journal, RunMode};
use crate::sched::{CycleRunner, MANUAL_CYCLE_DEADLINE};
use crate::state::StateStore;

const DEFAULT_LOG_COUNT: usize = 10;
const LOG_COUNT_MAX: usize = 50;

const GREETING: &str = "Hello! Send me any note and I will file it in your task store, or \
     ask me about what is already there. I check with you before anything \
     destructive. /scan runs the daily sweep now; /logs shows recent runs.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Scan,
    Logs { errors_only: bool, count: usize },
}

impl Command {
    fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?;
        // Group chats suffix commands with the bot name.
        let head = head.split('@').next().unwrap_or(head);
        match head {
            "/start" => Some(Command::Start),
            "/scan" => Some(Command::Scan),
            "/logs" => {
                let mut errors_only = false;
                let mut count = DEFAULT_LOG_COUNT;
                for arg in parts {
                    if arg.eq_ignore_ascii_case("errors") {
                        errors_only = true;
                    } else if let Ok(n) = arg.parse::<usize>() {
                        count = n.clamp(1, LOG_COUNT_MAX);
                    }
                }
                Some(Command::Logs { errors_only, count })
            }
            _ => None,
        }
    }
}

pub struct Runtime {
    agent: Arc<Agent>,
    gate: Arc<ConfirmationGate>,
    cleanup: CleanupService,
    runner: Arc<CycleRunner>,
    outbox: Outbox,
    journal: Arc<Journal>,
    state: Arc<StateStore>,
    home_offset: FixedOffset,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Arc<Agent>,
        gate: Arc<ConfirmationGate>,
        cleanup: CleanupService,
        runner: Arc<CycleRunner>,
        outbox: Outbox,
        journal: Arc<Journal>,
        state: Arc<StateStore>,
        home_offset: FixedOffset,
    ) -> Self {
        Runtime {
            agent,
            gate,
            cleanup,
            runner,
            outbox,
            journal,
            state,
            home_offset,
        }
    }

    /// Consume the channel's event stream until it ends.
    pub async fn run(self: Arc<Self>, channel: Arc<dyn Channel>) -> Result<(), ChannelError> {
        let mut events = channel.start().await?;
        tracing::info!(channel = channel.name(), "event loop started");
        while let Some(event) = events.next().await {
            let rt = Arc::clone(&self);
            match event {
                ChannelEvent::Message(message) => {
                    tokio::spawn(async move { rt.on_message(message).await });
                }
                ChannelEvent::Button(press) => {
                    tokio::spawn(async move { rt.on_button(press).await });
                }
            }
        }
        tracing::warn!("event stream ended");
        Ok(())
    }

    async fn on_message(&self, message: IncomingMessage) {
        let text = message.text.trim();
        if text.is_empty() {
            return;
        }
        self.touch().await;

        if let Some(command) = Command::parse(text) {
            self.on_command(command).await;
            return;
        }

        let (reply, draft) = self.agent.run(text, RunMode::Chat).await;
        let sent = match self.outbox.send(OutgoingMessage::markdown(&reply)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, "reply send failed");
                false
            }
        };
        if let Err(e) = self.journal.append(&draft.finish(&reply, sent)).await {
            tracing::warn!(error = %e, "journal append failed");
        }
    }

    async fn on_command(&self, command: Command) {
        match command {
            Command::Start => {
                self.agent.reset_memory().await;
                self.say(GREETING).await;
            }
            Command::Scan => {
                self.say("Running the full cycle now…").await;
                if self.runner.manual(Utc::now()).await {
                    self.say("Cycle finished.").await;
                } else {
                    let secs = MANUAL_CYCLE_DEADLINE.as_secs();
                    self.say(&format!(
                        "The cycle did not finish within {secs}s and was cut off; /logs has the details."
                    ))
                    .await;
                }
            }
            Command::Logs { errors_only, count } => {
                match self.journal.tail(count, errors_only).await {
                    Ok(records) if records.is_empty() => {
                        self.say("No matching interactions logged.").await;
                    }
                    Ok(records) => {
                        self.say(&render_logs(&records, self.home_offset)).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "journal read failed");
                        self.say("Could not read the journal.").await;
                    }
                }
            }
        }
    }

    async fn on_button(&self, press: ButtonPress) {
        self.touch().await;

        if ConfirmationGate::handles(&press.data) {
            let live = self.gate.resolve(&press.data).await;
            if !live {
                tracing::debug!(data = %press.data, "stale confirmation button");
            }
            self.outbox.ack(&press, None).await;
            return;
        }

        if let Some((disposition, id)) = cleanup::parse_callback(&press.data) {
            match self.cleanup.resolve(id, disposition).await {
                Ok(resolution) => {
                    self.outbox.ack(&press, None).await;
                    if let Some(target) = &press.message {
                        let note = OutgoingMessage::plain(resolution.feedback());
                        if let Err(e) = self.outbox.edit(target, note).await {
                            tracing::warn!(error = %e, "cleanup outcome edit failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "cleanup resolution failed");
                    self.outbox
                        .ack(&press, Some("The store did not answer; press again."))
                        .await;
                }
            }
            return;
        }

        tracing::debug!(data = %press.data, "unrecognized button");
        self.outbox.ack(&press, None).await;
    }

    /// Any user activity ends the quiet window that allows in-place
    /// summary edits.
    async fn touch(&self) {
        let now = Utc::now();
        if let Err(e) = self.state.mutate(|s| s.last_user_interaction = Some(now)).await {
            tracing::warn!(error = %e, "state persist failed");
        }
    }

    async fn say(&self, text: &str) {
        if let Err(e) = self.outbox.send(OutgoingMessage::plain(text)).await {
            tracing::error!(error = %e, "send failed");
        }
    }
}

/// Compact, clipped rendering of interaction records, newest last.
pub fn render_logs(records: &[InteractionRecord], home_offset: FixedOffset) -> String {
    let mut out = String::with_capacity(records.len() * 96);
    for record in records {
        let local = record.ts.with_timezone(&home_offset);
        let mode = match record.mode {
            RunMode::Chat => "chat",
            RunMode::Proactive => "auto",
        };
        let outcome = if record.error.is_some() {
            "ERR"
        } else if record.response_sent {
            "ok"
        } else {
            "quiet"
        };
        out.push_str(&format!(
            "{} {mode} {outcome} {}st {}ms\n  {} → {}\n",
            local.format("%m-%d %H:%M"),
            record.steps.len(),
            record.duration_ms,
            clip(&record.input, 48),
            clip(&record.response, 48),
        ));
        if let Some(error) = &record.error {
            out.push_str(&format!("  ! {}\n", clip(error, 80)));
        }
    }
    out
}

/// Single line, hard cap, ellipsis past the cap.
fn clip(text: &str, max: usize) -> String {
    let flat: String = text
        .trim()
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max {
        flat
    } else {
        let mut cut: String = flat.chars().take(max.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, NaiveDate};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::agent::Dispatcher;
    use crate::channels::channel::MessageRef;
    use crate::config::PolicyConfig;
    use crate::journal::InteractionDraft;
    use crate::model::{FieldCatalog, TaskStatus};
    use crate::scan::{ScanEngine, SummaryPublisher};
    use crate::store::resilient::ResilientStore;
    use crate::testutil::{RecordingChannel, ScriptedClassifier, StubStore, make_task};

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    struct Harness {
        stub: Arc<StubStore>,
        classifier: Arc<ScriptedClassifier>,
        channel: Arc<RecordingChannel>,
        journal: Arc<Journal>,
        state: Arc<StateStore>,
        cleanup: CleanupService,
        agent: Arc<Agent>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let stub = Arc::new(StubStore::default());
        let store = ResilientStore::new(stub.clone());
        let channel = Arc::new(RecordingChannel::default());
        let outbox = Outbox::new(channel.clone());
        let state = Arc::new(
            StateStore::load(dir.path().join("state.json"))
                .await
                .unwrap(),
        );
        let journal = Arc::new(Journal::new(dir.path().join("interactions.jsonl")));
        let policy = PolicyConfig::default();
        let catalog = FieldCatalog::new(Vec::new());
        let classifier = Arc::new(ScriptedClassifier::default());
        let gate = Arc::new(ConfirmationGate::new(Duration::from_secs(90)));
        let dispatcher = Dispatcher::new(store.clone(), gate.clone(), outbox.clone(), catalog.clone());
        let agent = Arc::new(Agent::new(
            classifier.clone(),
            dispatcher,
            store.clone(),
            catalog,
            kst(),
        ));
        let cleanup = CleanupService::new(store.clone(), state.clone(), policy.clone());
        let runner = Arc::new(CycleRunner::new(
            ScanEngine::new(store.clone(), policy.clone(), kst()),
            SummaryPublisher::new(outbox.clone(), state.clone(), journal.clone()),
            cleanup.clone(),
            agent.clone(),
            outbox.clone(),
            journal.clone(),
            policy,
        ));
        let rt = Arc::new(Runtime::new(
            agent.clone(),
            gate,
            cleanup.clone(),
            runner,
            outbox,
            journal.clone(),
            state.clone(),
            kst(),
        ));
        let as_channel: Arc<dyn Channel> = channel.clone();
        tokio::spawn(rt.run(as_channel));
        // Let the loop reach start() before the test pushes events.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        Harness {
            stub,
            classifier,
            channel,
            journal,
            state,
            cleanup,
            agent,
            _dir: dir,
        }
    }

    fn message(text: &str) -> ChannelEvent {
        ChannelEvent::Message(IncomingMessage {
            id: "1".into(),
            text: text.into(),
            received_at: Utc::now(),
        })
    }

    fn button(data: &str, message: Option<&str>) -> ChannelEvent {
        ChannelEvent::Button(ButtonPress {
            callback_id: "cb1".into(),
            data: data.into(),
            message: message.map(|m| MessageRef(m.into())),
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    // ==================== command parsing ====================

    #[test]
    fn command_parsing() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/start@taskherd_bot"), Some(Command::Start));
        assert_eq!(Command::parse("/scan"), Some(Command::Scan));
        assert_eq!(
            Command::parse("/logs"),
            Some(Command::Logs {
                errors_only: false,
                count: 10
            })
        );
        assert_eq!(
            Command::parse("/logs errors 5"),
            Some(Command::Logs {
                errors_only: true,
                count: 5
            })
        );
        assert_eq!(
            Command::parse("/logs 99"),
            Some(Command::Logs {
                errors_only: false,
                count: 50
            })
        );
        assert_eq!(Command::parse("hello there"), None);
        assert_eq!(Command::parse("/unknown"), None);
    }

    // ==================== chat flow ====================

    #[tokio::test]
    async fn chat_message_is_answered_and_journaled() {
        let h = harness().await;
        h.classifier.push_text("Filed.");

        h.channel.push(message("remember milk")).await;
        wait_until(|| !h.channel.sent().is_empty()).await;

        assert_eq!(h.channel.sent()[0].text, "Filed.");
        let mut records = Vec::new();
        for _ in 0..400 {
            records = h.journal.tail(10, false).await.unwrap();
            if !records.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mode, RunMode::Chat);
        assert_eq!(records[0].input, "remember milk");
        assert!(records[0].response_sent);
        assert!(h.state.snapshot().await.last_user_interaction.is_some());
    }

    #[tokio::test]
    async fn blank_messages_are_dropped() {
        let h = harness().await;
        h.classifier.push_text("Filed.");

        h.channel.push(message("   ")).await;
        h.channel.push(message("real note")).await;
        wait_until(|| !h.channel.sent().is_empty()).await;

        // Only the real note produced a run.
        assert_eq!(h.classifier.calls_made(), 1);
        assert_eq!(h.channel.sent().len(), 1);
    }

    // ==================== commands ====================

    #[tokio::test]
    async fn start_greets_and_clears_memory() {
        let h = harness().await;
        h.agent.remember_exchange("earlier", "context").await;

        h.channel.push(message("/start")).await;
        wait_until(|| !h.channel.sent().is_empty()).await;
        assert!(h.channel.sent()[0].text.starts_with("Hello!"));

        h.classifier.push_text("fresh");
        h.channel.push(message("hi")).await;
        wait_until(|| h.channel.sent().len() >= 2).await;

        // No replayed history in the first model call.
        assert_eq!(h.classifier.requests()[0].turns.len(), 1);
    }

    #[tokio::test]
    async fn scan_command_runs_the_cycle_with_feedback() {
        let h = harness().await;
        let mut task = make_task("over", TaskStatus::Todo);
        task.target_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        h.stub.seed(task);

        h.channel.push(message("/scan")).await;
        wait_until(|| {
            h.channel
                .sent()
                .iter()
                .any(|m| m.text.contains("Cycle finished."))
        })
        .await;

        let sent = h.channel.sent();
        assert!(sent[0].text.starts_with("Running the full cycle"));
        assert!(sent.iter().any(|m| m.text.contains("Task scan for")));
    }

    #[tokio::test]
    async fn logs_command_renders_the_tail() {
        let h = harness().await;
        let good = InteractionDraft::new(RunMode::Chat, "first input").finish("filed it", true);
        h.journal.append(&good).await.unwrap();
        let mut bad = InteractionDraft::new(RunMode::Proactive, "hourly scan");
        bad.set_error("store unavailable: down");
        h.journal.append(&bad.finish("(nothing)", false)).await.unwrap();

        h.channel.push(message("/logs")).await;
        wait_until(|| !h.channel.sent().is_empty()).await;
        let text = h.channel.sent()[0].text.clone();
        assert!(text.contains("first input"));
        assert!(text.contains("ERR"));
        assert!(text.contains("store unavailable"));

        h.channel.push(message("/logs errors 5")).await;
        wait_until(|| h.channel.sent().len() >= 2).await;
        let text = h.channel.sent()[1].text.clone();
        assert!(!text.contains("first input"));
        assert!(text.contains("hourly scan"));
    }

    // ==================== buttons ====================

    #[tokio::test]
    async fn cleanup_button_resolves_and_marks_the_message() {
        let h = harness().await;
        let mut old = make_task("a", TaskStatus::Todo);
        old.created_at = Some(Utc::now() - chrono::Duration::days(400));
        old.edited_at = old.created_at;
        h.stub.seed(old);
        h.cleanup.refill(Utc::now()).await.unwrap();

        h.channel.push(button("cleanup:keep:a", Some("m7"))).await;
        wait_until(|| !h.channel.edits().is_empty()).await;

        let edits = h.channel.edits();
        assert_eq!(edits[0].0, MessageRef("m7".into()));
        assert_eq!(edits[0].1.text, "Kept.");
        assert_eq!(h.channel.acks(), vec![("cb1".into(), None)]);
        assert!(!h.state.snapshot().await.queue_contains("a"));
    }

    #[tokio::test]
    async fn stale_confirmation_button_is_acked_quietly() {
        let h = harness().await;
        let data = format!("confirm:yes:{}", Uuid::new_v4());

        h.channel.push(button(&data, None)).await;
        wait_until(|| !h.channel.acks().is_empty()).await;

        assert!(h.channel.sent().is_empty());
        assert!(h.channel.edits().is_empty());
    }

    // ==================== log rendering ====================

    #[test]
    fn log_lines_are_compact_and_clipped() {
        let ts = DateTime::parse_from_rfc3339("2025-04-15T03:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = InteractionRecord {
            ts,
            mode: RunMode::Chat,
            input: "a".repeat(100),
            steps: Vec::new(),
            response: "done\nwith newline".into(),
            response_sent: true,
            duration_ms: 42,
            error: None,
        };
        let out = render_logs(&[record], kst());
        // 03:00 UTC renders as 12:00 at home.
        assert!(out.contains("04-15 12:00 chat ok 0st 42ms"));
        assert!(out.contains('…'));
        assert!(out.contains("done with newline"));
    }

    #[test]
    fn clip_is_char_safe() {
        assert_eq!(clip("short", 10), "short");
        assert_eq!(clip("  padded  ", 10), "padded");
        let clipped = clip(&"é".repeat(50), 10);
        assert_eq!(clipped.chars().count(), 10);
        assert!(clipped.ends_with('…'));
    }
}
