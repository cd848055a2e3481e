//! Task store boundary.
//!
//! [`StoreBackend`] is the raw transport: one call, one request, typed
//! errors, no retries. Queries are built as a small filter AST so the
//! scan and cleanup subsystems can compose conditions without knowing
//! how the backend serializes them.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;
use crate::model::{Provenance, TaskDraft, TaskRecord, TaskStatus};

/// Default page size for store queries.
pub const QUERY_PAGE_SIZE: usize = 50;

/// Filter tree over task properties.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFilter {
    StatusIs(TaskStatus),
    StatusIsNot(TaskStatus),
    TargetDateBefore(NaiveDate),
    TargetDateOnOrAfter(NaiveDate),
    TargetDateOnOrBefore(NaiveDate),
    TitleContains(String),
    EditedBefore(DateTime<Utc>),
    CreatedBefore(DateTime<Utc>),
    And(Vec<TaskFilter>),
    Or(Vec<TaskFilter>),
}

impl TaskFilter {
    /// Status is neither Done nor Won't Do.
    pub fn open() -> Self {
        TaskFilter::And(vec![
            TaskFilter::StatusIsNot(TaskStatus::Done),
            TaskFilter::StatusIsNot(TaskStatus::WontDo),
        ])
    }

    /// Status counts toward the active workload.
    pub fn active() -> Self {
        TaskFilter::Or(vec![
            TaskFilter::StatusIs(TaskStatus::Todo),
            TaskFilter::StatusIs(TaskStatus::InProgress),
            TaskFilter::StatusIs(TaskStatus::Pending),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    TargetDate,
    CreatedTime,
    EditedTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSort {
    pub key: SortKey,
    pub dir: SortDir,
}

impl TaskSort {
    pub fn asc(key: SortKey) -> Self {
        TaskSort { key, dir: SortDir::Ascending }
    }

    pub fn desc(key: SortKey) -> Self {
        TaskSort { key, dir: SortDir::Descending }
    }
}

/// A complete query: filter, ordering, and a total-result cap.
/// `limit: None` means follow pagination to the end.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskQuery {
    pub filter: Option<TaskFilter>,
    pub sorts: Vec<TaskSort>,
    pub page_size: usize,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn new(filter: TaskFilter) -> Self {
        TaskQuery {
            filter: Some(filter),
            sorts: Vec::new(),
            page_size: QUERY_PAGE_SIZE,
            limit: Some(QUERY_PAGE_SIZE),
        }
    }

    pub fn sorted_by(mut self, sort: TaskSort) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Open tasks whose target date is strictly before `today`.
    pub fn overdue(today: NaiveDate) -> Self {
        TaskQuery::new(TaskFilter::And(vec![
            TaskFilter::TargetDateBefore(today),
            TaskFilter::open(),
        ]))
        .sorted_by(TaskSort::asc(SortKey::TargetDate))
        .sorted_by(TaskSort::asc(SortKey::EditedTime))
    }

    /// Open tasks with a target date in `today..=horizon`.
    pub fn due_between(today: NaiveDate, horizon: NaiveDate) -> Self {
        TaskQuery::new(TaskFilter::And(vec![
            TaskFilter::TargetDateOnOrAfter(today),
            TaskFilter::TargetDateOnOrBefore(horizon),
            TaskFilter::open(),
        ]))
        .sorted_by(TaskSort::asc(SortKey::TargetDate))
        .sorted_by(TaskSort::asc(SortKey::EditedTime))
    }

    /// Actively-held tasks not edited since `cutoff`. Parked tasks are
    /// deferred on purpose and do not count.
    pub fn stale(cutoff: DateTime<Utc>) -> Self {
        TaskQuery::new(TaskFilter::And(vec![
            TaskFilter::EditedBefore(cutoff),
            TaskFilter::active(),
        ]))
        .sorted_by(TaskSort::asc(SortKey::TargetDate))
        .sorted_by(TaskSort::asc(SortKey::EditedTime))
    }

    /// Tasks counting toward the workload, every page.
    pub fn active_tasks() -> Self {
        TaskQuery::new(TaskFilter::active())
            .with_limit(None)
    }

    /// Backlog entries (not started, or parked) created before `cutoff`,
    /// oldest first, every page.
    pub fn cleanup_candidates(cutoff: DateTime<Utc>) -> Self {
        TaskQuery::new(TaskFilter::And(vec![
            TaskFilter::CreatedBefore(cutoff),
            TaskFilter::Or(vec![
                TaskFilter::StatusIs(TaskStatus::Todo),
                TaskFilter::StatusIs(TaskStatus::ToSchedule),
            ]),
        ]))
        .sorted_by(TaskSort::asc(SortKey::CreatedTime))
        .with_limit(None)
    }

    /// Title substring search, most recently edited first.
    pub fn title_search(term: &str, limit: usize) -> Self {
        let mut q = TaskQuery::new(TaskFilter::TitleContains(term.to_string()))
            .sorted_by(TaskSort::desc(SortKey::EditedTime));
        q.page_size = limit.min(QUERY_PAGE_SIZE);
        q.limit = Some(limit);
        q
    }
}

/// Raw store transport. One attempt per call; resilience lives in
/// [`crate::store::ResilientStore`].
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Create a record from a draft. Absent draft fields are not sent.
    async fn create_task(
        &self,
        draft: &TaskDraft,
        provenance: Provenance,
    ) -> Result<TaskRecord, StoreError>;

    /// Set the status property. Writing the value a record already
    /// holds is a no-op at the store, not an error.
    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError>;

    async fn fetch_task(&self, id: &str) -> Result<TaskRecord, StoreError>;

    /// Page body flattened to plain text lines.
    async fn fetch_body(&self, id: &str) -> Result<String, StoreError>;

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError>;
}
