//! Scheduled proactive cycles.
//!
//! Two cron schedules drive everything that happens without a user
//! message. The daily fire runs the full cycle: scan, summary, alerts,
//! then a cleanup pass. The hourly fires run an alerts-only scan, plus
//! an optional agent check-in when enabled. Fire times are computed in
//! the home offset, so "9 in the morning" means the user's morning.
//!
//! The same full cycle is reachable on demand from chat, bounded by
//! [`MANUAL_CYCLE_DEADLINE`] so a command cannot hang the conversation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};

use crate::agent::Agent;
use crate::channels::channel::{Outbox, OutgoingMessage};
use crate::classifier::SKIP_SENTINEL;
use crate::cleanup::CleanupService;
use crate::config::{PolicyConfig, ScheduleConfig};
use crate::journal::{Journal, RunMode};
use crate::scan::{ScanEngine, ScanReport, SummaryPublisher};

/// Upper bound on a chat-triggered full cycle.
pub const MANUAL_CYCLE_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Daily,
    Hourly,
}

impl Tick {
    fn as_str(&self) -> &'static str {
        match self {
            Tick::Daily => "daily",
            Tick::Hourly => "hourly",
        }
    }
}

/// One place that knows what a proactive cycle consists of.
pub struct CycleRunner {
    engine: ScanEngine,
    publisher: SummaryPublisher,
    cleanup: CleanupService,
    agent: Arc<Agent>,
    outbox: Outbox,
    journal: Arc<Journal>,
    policy: PolicyConfig,
}

impl CycleRunner {
    pub fn new(
        engine: ScanEngine,
        publisher: SummaryPublisher,
        cleanup: CleanupService,
        agent: Arc<Agent>,
        outbox: Outbox,
        journal: Arc<Journal>,
        policy: PolicyConfig,
    ) -> Self {
        CycleRunner {
            engine,
            publisher,
            cleanup,
            agent,
            outbox,
            journal,
            policy,
        }
    }

    /// Full morning cycle: scan with summary and alerts, then cleanup.
    pub async fn daily(&self, now: DateTime<Utc>) {
        tracing::info!("daily cycle starting");
        match self.engine.scan(now).await {
            Ok(report) => self.publisher.publish(&report, now, true, "daily scan").await,
            Err(e) => tracing::error!(error = %e, "daily scan failed"),
        }
        self.cleanup.run_cycle(&self.outbox, &self.journal, now).await;
    }

    /// Alerts-only scan, plus the opt-in agent check-in.
    pub async fn hourly(&self, now: DateTime<Utc>) {
        let report = match self.engine.scan(now).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "hourly scan failed");
                return;
            }
        };
        self.publisher.publish(&report, now, false, "hourly scan").await;
        if self.policy.checkin_enabled {
            self.checkin(&report).await;
        }
    }

    /// On-demand full cycle. Returns false if the deadline cut it off.
    pub async fn manual(&self, now: DateTime<Utc>) -> bool {
        tokio::time::timeout(MANUAL_CYCLE_DEADLINE, self.daily(now))
            .await
            .is_ok()
    }

    /// One agent run over the workspace snapshot. The reply is sent
    /// unless the agent says there is nothing worth interrupting for;
    /// only a delivered reply enters conversation memory.
    async fn checkin(&self, report: &ScanReport) {
        let input = checkin_input(report);
        let (reply, draft) = self.agent.run(&input, RunMode::Proactive).await;
        let reply = reply.trim();

        if reply.is_empty() || reply == SKIP_SENTINEL {
            tracing::debug!("check-in had nothing to say");
            self.append(draft.finish(SKIP_SENTINEL, false)).await;
            return;
        }

        let sent = match self.outbox.send(OutgoingMessage::markdown(reply)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "check-in send failed");
                false
            }
        };
        if sent {
            self.agent.remember_exchange(&input, reply).await;
        }
        self.append(draft.finish(reply, sent)).await;
    }

    async fn append(&self, record: crate::journal::InteractionRecord) {
        if let Err(e) = self.journal.append(&record).await {
            tracing::warn!(error = %e, "check-in journal append failed");
        }
    }
}

/// The check-in prompt input: a deterministic snapshot of the current
/// workload, so the model reacts to real state instead of guessing.
fn checkin_input(report: &ScanReport) -> String {
    let mut input = format!(
        "Scheduled check-in for {}. Workspace: {}.",
        report.date,
        report.tier_counts()
    );
    for (label, tier) in [("Overdue", &report.overdue), ("Due soon", &report.due_soon)] {
        if tier.is_empty() {
            continue;
        }
        let titles: Vec<&str> = tier.iter().take(5).map(|t| t.title.as_str()).collect();
        input.push_str(&format!("\n{label}: {}.", titles.join("; ")));
    }
    input
}

/// Fires cycles at their cron times, forever.
pub struct Scheduler {
    schedule: ScheduleConfig,
    home_offset: FixedOffset,
    runner: Arc<CycleRunner>,
}

impl Scheduler {
    pub fn new(schedule: ScheduleConfig, home_offset: FixedOffset, runner: Arc<CycleRunner>) -> Self {
        Scheduler {
            schedule,
            home_offset,
            runner,
        }
    }

    pub async fn run(&self) {
        tracing::info!("scheduler started");
        loop {
            let now_local = Utc::now().with_timezone(&self.home_offset);
            let Some((at, tick)) = next_tick(&self.schedule, &now_local) else {
                tracing::error!("no upcoming cron fire times, scheduler stopping");
                return;
            };
            let wait = (at - now_local).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(tick = tick.as_str(), at = %at, "next cycle scheduled");
            tokio::time::sleep(wait).await;

            let now = Utc::now();
            match tick {
                Tick::Daily => self.runner.daily(now).await,
                Tick::Hourly => self.runner.hourly(now).await,
            }
        }
    }
}

/// Spawn the scheduler loop as a background task.
pub fn spawn_scheduler(scheduler: Scheduler) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { scheduler.run().await })
}

fn next_tick(
    schedule: &ScheduleConfig,
    after: &DateTime<FixedOffset>,
) -> Option<(DateTime<FixedOffset>, Tick)> {
    let daily = schedule.daily.after(after).next();
    let hourly = schedule.hourly.after(after).next();
    match (daily, hourly) {
        (Some(d), Some(h)) if d <= h => Some((d, Tick::Daily)),
        (_, Some(h)) => Some((h, Tick::Hourly)),
        (Some(d), None) => Some((d, Tick::Daily)),
        (None, None) => None,
    }
}
