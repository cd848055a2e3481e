//! The closed tool set.
//!
//! Five operations, one enum. Parsing validates the model's arguments
//! against typed structs; dispatch (in [`crate::agent::dispatcher`]) is
//! an exhaustive match, so adding a tool is a compile-visible change,
//! not a registry entry.
//!
//! Enumerated argument values follow the allow-list rule: an unknown
//! select value is treated as absent, never written through. Structural
//! problems (missing title, malformed date) are invalid arguments and
//! go back to the model as an error result.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::classifier::provider::ToolDefinition;
use crate::error::DispatchError;
use crate::model::{Category, EntryKind, FieldCatalog, Priority, TaskDraft, TaskStatus};

/// Search result cap shown to the model.
pub const SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateTaskArgs {
    pub title: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub importance: Option<String>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub target_date: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl CreateTaskArgs {
    /// Validate into a draft. Unknown enum values become absent; a
    /// missing status defaults to To Do; a malformed date is an
    /// argument error the model can correct.
    pub fn into_draft(self, catalog: &FieldCatalog) -> Result<TaskDraft, DispatchError> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(DispatchError::InvalidArguments {
                tool: ToolInvocation::CREATE_TASK,
                reason: "title must not be empty".to_string(),
            });
        }
        let target_date = match &self.target_date {
            None => None,
            Some(raw) => Some(
                chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
                    DispatchError::InvalidArguments {
                        tool: ToolInvocation::CREATE_TASK,
                        reason: format!("target_date must be YYYY-MM-DD, got {raw:?}"),
                    }
                })?,
            ),
        };

        let mut draft = TaskDraft {
            title,
            kind: self.kind.as_deref().and_then(EntryKind::parse),
            status: self
                .status
                .as_deref()
                .and_then(TaskStatus::parse)
                .or(Some(TaskStatus::Todo)),
            importance: self.importance.as_deref().and_then(Priority::parse),
            urgency: self.urgency.as_deref().and_then(Priority::parse),
            category: self.category.as_deref().and_then(Category::parse),
            tags: self.tags,
            target_date,
            link: self.link.clone().filter(|l| !l.trim().is_empty()),
        };
        catalog.sanitize(&mut draft);
        Ok(draft)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchTasksArgs {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateStatusArgs {
    pub task_id: String,
    pub status: String,
}

impl UpdateStatusArgs {
    pub fn parsed_status(&self) -> Result<TaskStatus, DispatchError> {
        TaskStatus::parse(&self.status).ok_or_else(|| DispatchError::InvalidArguments {
            tool: ToolInvocation::UPDATE_TASK_STATUS,
            reason: format!("unknown status {:?}", self.status),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskDetailArgs {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfirmArgs {
    pub prompt: String,
}

/// A validated tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    CreateTask(CreateTaskArgs),
    SearchTasks(SearchTasksArgs),
    UpdateTaskStatus(UpdateStatusArgs),
    GetTaskDetail(TaskDetailArgs),
    RequestConfirmation(ConfirmArgs),
}

impl ToolInvocation {
    pub const CREATE_TASK: &'static str = "create_task";
    pub const SEARCH_TASKS: &'static str = "search_tasks";
    pub const UPDATE_TASK_STATUS: &'static str = "update_task_status";
    pub const GET_TASK_DETAIL: &'static str = "get_task_detail";
    pub const REQUEST_USER_CONFIRMATION: &'static str = "request_user_confirmation";

    pub fn parse(name: &str, arguments: Value) -> Result<Self, DispatchError> {
        fn args<T: serde::de::DeserializeOwned>(
            tool: &'static str,
            arguments: Value,
        ) -> Result<T, DispatchError> {
            serde_json::from_value(arguments).map_err(|e| DispatchError::InvalidArguments {
                tool,
                reason: e.to_string(),
            })
        }

        match name {
            Self::CREATE_TASK => Ok(Self::CreateTask(args(Self::CREATE_TASK, arguments)?)),
            Self::SEARCH_TASKS => Ok(Self::SearchTasks(args(Self::SEARCH_TASKS, arguments)?)),
            Self::UPDATE_TASK_STATUS => Ok(Self::UpdateTaskStatus(args(
                Self::UPDATE_TASK_STATUS,
                arguments,
            )?)),
            Self::GET_TASK_DETAIL => {
                Ok(Self::GetTaskDetail(args(Self::GET_TASK_DETAIL, arguments)?))
            }
            Self::REQUEST_USER_CONFIRMATION => Ok(Self::RequestConfirmation(args(
                Self::REQUEST_USER_CONFIRMATION,
                arguments,
            )?)),
            other => Err(DispatchError::UnknownTool {
                name: other.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTask(_) => Self::CREATE_TASK,
            Self::SearchTasks(_) => Self::SEARCH_TASKS,
            Self::UpdateTaskStatus(_) => Self::UPDATE_TASK_STATUS,
            Self::GetTaskDetail(_) => Self::GET_TASK_DETAIL,
            Self::RequestConfirmation(_) => Self::REQUEST_USER_CONFIRMATION,
        }
    }

    /// Schemas declared to the model. The tag enum is injected from the
    /// catalog so the model can only name listed values.
    pub fn definitions(catalog: &FieldCatalog) -> Vec<ToolDefinition> {
        let status_values: Vec<&str> = [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::Pending,
            TaskStatus::ToSchedule,
            TaskStatus::Done,
            TaskStatus::WontDo,
        ]
        .iter()
        .map(TaskStatus::as_str)
        .collect();
        let level_values = ["High", "Medium", "Low"];

        let mut tags_schema = json!({
            "type": "array",
            "items": { "type": "string" },
            "description": "Tags from the configured list only",
        });
        if !catalog.tags.is_empty() {
            tags_schema["items"]["enum"] = json!(catalog.tags);
        }

        vec![
            ToolDefinition {
                name: Self::CREATE_TASK,
                description: "File a new task record in the store. Only set fields \
                              the note actually supports."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string", "description": "Concise, verb-led title" },
                        "kind": { "type": "string", "enum": ["task", "memo", "idea"] },
                        "status": { "type": "string", "enum": status_values,
                                    "description": "Defaults to To Do" },
                        "importance": { "type": "string", "enum": level_values },
                        "urgency": { "type": "string", "enum": level_values },
                        "category": { "type": "string", "enum": ["Must Do", "Nice to Have"] },
                        "tags": tags_schema,
                        "target_date": { "type": "string", "description": "YYYY-MM-DD" },
                        "link": { "type": "string", "description": "URL carried from the note" },
                    },
                    "required": ["title"],
                }),
            },
            ToolDefinition {
                name: Self::SEARCH_TASKS,
                description: "Find tasks whose title contains the query, most recently \
                              edited first."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                    },
                    "required": ["query"],
                }),
            },
            ToolDefinition {
                name: Self::UPDATE_TASK_STATUS,
                description: "Set the status of an existing task.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                        "status": { "type": "string", "enum": status_values },
                    },
                    "required": ["task_id", "status"],
                }),
            },
            ToolDefinition {
                name: Self::GET_TASK_DETAIL,
                description: "Fetch one task with its full properties and page body."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                    },
                    "required": ["task_id"],
                }),
            },
            ToolDefinition {
                name: Self::REQUEST_USER_CONFIRMATION,
                description: "Ask the user a yes/no question with buttons and wait for \
                              the answer. Use before destructive bulk changes. No reply \
                              within the wait window counts as a decline."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "prompt": { "type": "string", "description": "What to confirm, with the tasks listed" },
                    },
                    "required": ["prompt"],
                }),
            },
        ]
    }
}

/// What a tool invocation produced: a payload for the model and a
/// bounded summary for the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReply {
    pub summary: String,
    pub payload: Value,
    pub is_error: bool,
}

impl ToolReply {
    pub fn ok(summary: impl Into<String>, payload: Value) -> Self {
        ToolReply {
            summary: summary.into(),
            payload,
            is_error: false,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        ToolReply {
            payload: json!({ "error": reason }),
            summary: reason,
            is_error: true,
        }
    }

    /// Compact payload text fed back into the transcript.
    pub fn content(&self) -> String {
        self.payload.to_string()
    }
}
