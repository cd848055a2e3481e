//! Task domain types.
//!
//! These mirror the property schema of the external store: a task is a
//! record with a title, a handful of enumerated selects, a tag set, an
//! optional target date and link, and bookkeeping timestamps. Enumerated
//! values are parsed leniently (the store is hand-edited too) but always
//! written back in one canonical spelling.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Longest title the store accepts in one rich-text fragment.
pub const TITLE_MAX: usize = 2000;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Todo,
    InProgress,
    Pending,
    ToSchedule,
    Done,
    WontDo,
}

impl TaskStatus {
    /// Canonical spelling used when writing to the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "To Do",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Pending => "Pending",
            TaskStatus::ToSchedule => "To Schedule",
            TaskStatus::Done => "Done",
            TaskStatus::WontDo => "Won't Do",
        }
    }

    /// Lenient parse. The store has seen "TODO", "To Do", "to-do" and
    /// friends; they all normalize to one variant.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "todo" => Some(TaskStatus::Todo),
            "inprogress" => Some(TaskStatus::InProgress),
            "pending" => Some(TaskStatus::Pending),
            "toschedule" => Some(TaskStatus::ToSchedule),
            "done" => Some(TaskStatus::Done),
            "wontdo" => Some(TaskStatus::WontDo),
            _ => None,
        }
    }

    /// Done and Won't Do are closed for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::WontDo)
    }

    /// Open but intentionally parked; excluded from staleness and
    /// overload accounting.
    pub fn is_parked(&self) -> bool {
        matches!(self, TaskStatus::ToSchedule)
    }

    /// Counts toward the active workload.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !self.is_parked()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Three-level scale shared by importance and urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Priority::High),
            "medium" | "mid" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Commitment category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    MustDo,
    NiceToHave,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::MustDo => "Must Do",
            Category::NiceToHave => "Nice to Have",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "mustdo" => Some(Category::MustDo),
            "nicetohave" => Some(Category::NiceToHave),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of entry a captured message turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Task,
    Memo,
    Idea,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Task => "Task",
            EntryKind::Memo => "Memo",
            EntryKind::Idea => "Idea",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "task" => Some(EntryKind::Task),
            "memo" => Some(EntryKind::Memo),
            "idea" => Some(EntryKind::Idea),
            _ => None,
        }
    }
}

/// Which subsystem wrote a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Created through the normal classification path.
    Agent,
    /// Created verbatim because classification failed.
    Fallback,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Agent => "agent",
            Provenance::Fallback => "fallback",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "agent" => Some(Provenance::Agent),
            "fallback" => Some(Provenance::Fallback),
            _ => None,
        }
    }
}

/// Fields a new task is created from. Everything except the title is
/// optional; absent fields are simply not written to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    pub kind: Option<EntryKind>,
    pub status: Option<TaskStatus>,
    pub importance: Option<Priority>,
    pub urgency: Option<Priority>,
    pub category: Option<Category>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub target_date: Option<NaiveDate>,
    pub link: Option<String>,
}

impl TaskDraft {
    /// Minimal draft used by the classification-failure fallback path:
    /// the raw message becomes the title, nothing else is guessed.
    pub fn raw_capture(text: &str) -> Self {
        let mut title: String = text.trim().chars().take(TITLE_MAX).collect();
        if title.is_empty() {
            title = "(empty message)".to_string();
        }
        TaskDraft {
            title,
            status: Some(TaskStatus::Todo),
            ..Default::default()
        }
    }
}

/// A task as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub status: Option<TaskStatus>,
    pub kind: Option<EntryKind>,
    pub importance: Option<Priority>,
    pub urgency: Option<Priority>,
    pub category: Option<Category>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub target_date: Option<NaiveDate>,
    pub link: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub provenance: Option<Provenance>,
}

/// Allowed values for free-set enumerations, injected into the
/// classifier prompt and enforced on every draft before it reaches the
/// store. Values not in the catalog are dropped, never written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldCatalog {
    pub tags: Vec<String>,
}

impl FieldCatalog {
    pub fn new(tags: Vec<String>) -> Self {
        FieldCatalog { tags }
    }

    /// Map a proposed tag onto its catalog spelling, if listed.
    pub fn canonical_tag(&self, raw: &str) -> Option<&str> {
        let want = raw.trim();
        self.tags
            .iter()
            .find(|t| t.eq_ignore_ascii_case(want))
            .map(|t| t.as_str())
    }

    /// Drop unknown tags from a draft, keeping catalog spelling for the
    /// ones that match.
    pub fn sanitize(&self, draft: &mut TaskDraft) {
        draft.tags = draft
            .tags
            .iter()
            .filter_map(|t| self.canonical_tag(t).map(str::to_string))
            .collect();
        draft.tags.dedup();
    }
}
