//! Scheduled store scan.
//!
//! One scan partitions the live workload into three disjoint tiers.
//! Overdue wins over due-soon wins over stale, so a task appears in at
//! most one tier no matter how many conditions it matches. On top of
//! the tiers the scan computes standalone alert conditions (overload,
//! severe overdue) that warrant more than a line in the summary.
//!
//! Pure read side: nothing here mutates the store or local state.
//! Delivery and dedup live in [`crate::scan::report`].

use std::collections::HashSet;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::config::PolicyConfig;
use crate::error::StoreError;
use crate::model::TaskRecord;
use crate::store::backend::TaskQuery;
use crate::store::resilient::{Deadline, ResilientStore};

/// A condition loud enough for its own message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertCondition {
    /// More open tasks than the configured comfort limit.
    Overload { open: usize, limit: usize },
    /// Overdue count at or past the configured floor.
    SevereOverdue { overdue: usize },
}

impl AlertCondition {
    /// Stable slot name; one alert of each kind can be live at a time.
    pub fn key(&self) -> &'static str {
        match self {
            AlertCondition::Overload { .. } => "overload",
            AlertCondition::SevereOverdue { .. } => "severe_overdue",
        }
    }

    /// Dedup signature. Unchanged signature means the situation is the
    /// same as last cycle and must not be re-announced.
    pub fn signature(&self) -> String {
        match self {
            AlertCondition::Overload { open, .. } => format!("overload:{open}"),
            AlertCondition::SevereOverdue { overdue } => format!("severe_overdue:{overdue}"),
        }
    }

    pub fn render(&self) -> String {
        match self {
            AlertCondition::Overload { open, limit } => format!(
                "⚠️ Workload check: {open} tasks are open, past the comfortable \
                 limit of {limit}. Worth closing or parking a few before adding more."
            ),
            AlertCondition::SevereOverdue { overdue } => format!(
                "🚨 {overdue} tasks are past their target date. Worth a triage pass."
            ),
        }
    }
}

/// What one scan found.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    /// Calendar date of the scan in the home timezone.
    pub date: NaiveDate,
    pub overdue: Vec<TaskRecord>,
    pub due_soon: Vec<TaskRecord>,
    pub stale: Vec<TaskRecord>,
    /// Open tasks counting toward the workload.
    pub open_count: usize,
    pub alerts: Vec<AlertCondition>,
}

impl ScanReport {
    /// Nothing worth a message this cycle.
    pub fn is_quiet(&self) -> bool {
        self.overdue.is_empty()
            && self.due_soon.is_empty()
            && self.stale.is_empty()
            && self.alerts.is_empty()
    }

    pub fn tier_counts(&self) -> String {
        format!(
            "overdue {}, due soon {}, stale {}, open {}",
            self.overdue.len(),
            self.due_soon.len(),
            self.stale.len(),
            self.open_count
        )
    }
}

pub struct ScanEngine {
    store: ResilientStore,
    policy: PolicyConfig,
    home_offset: FixedOffset,
}

impl ScanEngine {
    pub fn new(store: ResilientStore, policy: PolicyConfig, home_offset: FixedOffset) -> Self {
        ScanEngine {
            store,
            policy,
            home_offset,
        }
    }

    /// Run the four tier queries and assemble a report.
    ///
    /// `now` is passed in rather than read from the clock so scheduled
    /// and manual scans agree on what "today" means.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport, StoreError> {
        let today = now.with_timezone(&self.home_offset).date_naive();
        let horizon = today + Duration::days(i64::from(self.policy.due_soon_days));
        let stale_cutoff = now - Duration::days(i64::from(self.policy.stale_days));

        let overdue = self
            .store
            .query_tasks(&TaskQuery::overdue(today), Deadline::Bulk)
            .await?;
        let due_soon = self
            .store
            .query_tasks(&TaskQuery::due_between(today, horizon), Deadline::Bulk)
            .await?;
        let stale = self
            .store
            .query_tasks(&TaskQuery::stale(stale_cutoff), Deadline::Bulk)
            .await?;
        let open_count = self
            .store
            .query_tasks(&TaskQuery::active_tasks(), Deadline::Bulk)
            .await?
            .len();

        // Disjoint tiers by precedence.
        let mut seen: HashSet<String> = overdue.iter().map(|t| t.id.clone()).collect();
        let due_soon: Vec<TaskRecord> = due_soon
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .collect();
        let stale: Vec<TaskRecord> = stale
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .collect();

        let mut alerts = Vec::new();
        if open_count > self.policy.overload_threshold {
            alerts.push(AlertCondition::Overload {
                open: open_count,
                limit: self.policy.overload_threshold,
            });
        }
        if overdue.len() >= self.policy.severe_overdue_floor {
            alerts.push(AlertCondition::SevereOverdue {
                overdue: overdue.len(),
            });
        }

        let report = ScanReport {
            date: today,
            overdue,
            due_soon,
            stale,
            open_count,
            alerts,
        };
        tracing::info!(date = %report.date, counts = %report.tier_counts(), alerts = report.alerts.len(), "scan complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::TaskStatus;
    use crate::testutil::{StubStore, make_task};

    fn now() -> DateTime<Utc> {
        // 12:00 in UTC+9 on April 15th.
        Utc.with_ymd_and_hms(2025, 4, 15, 3, 0, 0).unwrap()
    }

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn seed(
        stub: &StubStore,
        id: &str,
        status: TaskStatus,
        target: Option<NaiveDate>,
        edited_days_ago: i64,
    ) {
        let mut task = make_task(id, status);
        task.target_date = target;
        task.edited_at = Some(now() - Duration::days(edited_days_ago));
        task.created_at = task.edited_at;
        stub.seed(task);
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn engine(stub: Arc<StubStore>) -> ScanEngine {
        ScanEngine::new(ResilientStore::new(stub), PolicyConfig::default(), kst())
    }

    fn ids(tasks: &[TaskRecord]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[tokio::test]
    async fn tiers_partition_the_workload() {
        let stub = Arc::new(StubStore::default());
        seed(&stub, "over", TaskStatus::Todo, Some(date(2025, 4, 14)), 0);
        seed(&stub, "soon", TaskStatus::InProgress, Some(date(2025, 4, 16)), 0);
        seed(&stub, "stale", TaskStatus::InProgress, None, 20);
        seed(&stub, "parked", TaskStatus::ToSchedule, None, 40);
        seed(&stub, "closed", TaskStatus::Done, Some(date(2025, 4, 1)), 0);
        seed(&stub, "fresh", TaskStatus::Todo, None, 1);

        let report = engine(stub).scan(now()).await.unwrap();
        assert_eq!(report.date, date(2025, 4, 15));
        assert_eq!(ids(&report.overdue), vec!["over"]);
        assert_eq!(ids(&report.due_soon), vec!["soon"]);
        assert_eq!(ids(&report.stale), vec!["stale"]);
        // Parked and closed tasks stay out of the workload count.
        assert_eq!(report.open_count, 4);
        assert!(report.alerts.is_empty());
    }

    #[tokio::test]
    async fn overdue_takes_precedence_over_other_tiers() {
        let stub = Arc::new(StubStore::default());
        // Overdue and untouched for three weeks: overdue wins.
        seed(&stub, "both", TaskStatus::Todo, Some(date(2025, 4, 1)), 21);
        // Due soon and stale: due soon wins.
        seed(&stub, "soonstale", TaskStatus::Pending, Some(date(2025, 4, 17)), 21);

        let report = engine(stub).scan(now()).await.unwrap();
        assert_eq!(ids(&report.overdue), vec!["both"]);
        assert_eq!(ids(&report.due_soon), vec!["soonstale"]);
        assert!(report.stale.is_empty());
    }

    #[tokio::test]
    async fn due_today_is_due_soon_not_overdue() {
        let stub = Arc::new(StubStore::default());
        seed(&stub, "today", TaskStatus::Todo, Some(date(2025, 4, 15)), 0);
        seed(&stub, "horizon", TaskStatus::Todo, Some(date(2025, 4, 18)), 0);
        seed(&stub, "beyond", TaskStatus::Todo, Some(date(2025, 4, 19)), 0);

        let report = engine(stub).scan(now()).await.unwrap();
        assert!(report.overdue.is_empty());
        assert_eq!(ids(&report.due_soon), vec!["today", "horizon"]);
    }

    #[tokio::test]
    async fn day_boundary_follows_the_home_offset() {
        let stub = Arc::new(StubStore::default());
        seed(&stub, "t", TaskStatus::Todo, Some(date(2025, 4, 14)), 0);

        // 16:00 UTC on the 14th is already the 15th at home.
        let late_utc = Utc.with_ymd_and_hms(2025, 4, 14, 16, 0, 0).unwrap();
        let report = engine(stub).scan(late_utc).await.unwrap();
        assert_eq!(report.date, date(2025, 4, 15));
        assert_eq!(ids(&report.overdue), vec!["t"]);
    }

    #[tokio::test]
    async fn alert_conditions_have_stable_signatures() {
        let stub = Arc::new(StubStore::default());
        for i in 0..26 {
            seed(&stub, &format!("open{i}"), TaskStatus::Todo, None, 0);
        }
        for i in 0..5 {
            seed(
                &stub,
                &format!("late{i}"),
                TaskStatus::InProgress,
                Some(date(2025, 4, 1)),
                0,
            );
        }

        let report = engine(stub).scan(now()).await.unwrap();
        assert_eq!(report.open_count, 31);
        assert_eq!(report.alerts.len(), 2);
        assert_eq!(report.alerts[0].signature(), "overload:31");
        assert_eq!(report.alerts[0].key(), "overload");
        assert_eq!(report.alerts[1].signature(), "severe_overdue:5");
        assert!(report.alerts[1].render().contains("5 tasks"));
    }

    #[tokio::test]
    async fn quiet_scan_reports_nothing() {
        let stub = Arc::new(StubStore::default());
        seed(&stub, "fresh", TaskStatus::Todo, None, 0);

        let report = engine(stub).scan(now()).await.unwrap();
        assert!(report.is_quiet());
        assert_eq!(report.open_count, 1);
    }
}
