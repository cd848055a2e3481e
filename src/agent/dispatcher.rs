//! Exhaustive tool dispatch.
//!
//! One validated [`ToolInvocation`] in, one [`ToolReply`] out. Every
//! store call goes through the resilience layer at the interactive
//! deadline; failures become error replies for the model to explain,
//! never panics or silent drops.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::agent::confirm::ConfirmationGate;
use crate::agent::tools::{
    ConfirmArgs, CreateTaskArgs, SEARCH_LIMIT, SearchTasksArgs, TaskDetailArgs, ToolInvocation,
    ToolReply, UpdateStatusArgs,
};
use crate::channels::channel::Outbox;
use crate::error::DispatchError;
use crate::model::{FieldCatalog, Provenance, TaskRecord};
use crate::store::backend::TaskQuery;
use crate::store::resilient::{Deadline, ResilientStore};

/// Longest body excerpt included with a search result.
const SNIPPET_MAX: usize = 200;

pub struct Dispatcher {
    store: ResilientStore,
    gate: Arc<ConfirmationGate>,
    outbox: Outbox,
    catalog: FieldCatalog,
}

impl Dispatcher {
    pub fn new(
        store: ResilientStore,
        gate: Arc<ConfirmationGate>,
        outbox: Outbox,
        catalog: FieldCatalog,
    ) -> Self {
        Dispatcher {
            store,
            gate,
            outbox,
            catalog,
        }
    }

    /// Run one invocation to a reply. Errors are folded into a failed
    /// reply so the transcript stays well formed either way.
    pub async fn dispatch(&self, invocation: ToolInvocation) -> ToolReply {
        let tool = invocation.name();
        match self.run(invocation).await {
            Ok(reply) => {
                tracing::debug!(tool, summary = %reply.summary, "tool ok");
                reply
            }
            Err(e) => {
                tracing::warn!(tool, error = %e, "tool failed");
                ToolReply::fail(e.to_string())
            }
        }
    }

    async fn run(&self, invocation: ToolInvocation) -> Result<ToolReply, DispatchError> {
        match invocation {
            ToolInvocation::CreateTask(args) => self.create(args).await,
            ToolInvocation::SearchTasks(args) => self.search(args).await,
            ToolInvocation::UpdateTaskStatus(args) => self.update(args).await,
            ToolInvocation::GetTaskDetail(args) => self.detail(args).await,
            ToolInvocation::RequestConfirmation(args) => self.confirm(args).await,
        }
    }

    async fn create(&self, args: CreateTaskArgs) -> Result<ToolReply, DispatchError> {
        let draft = args.into_draft(&self.catalog)?;
        let record = self
            .store
            .create_task(&draft, Provenance::Agent, Deadline::Interactive)
            .await?;
        Ok(ToolReply::ok(
            format!("created {:?} ({})", record.title, record.id),
            task_json(&record),
        ))
    }

    async fn search(&self, args: SearchTasksArgs) -> Result<ToolReply, DispatchError> {
        let term = args.query.trim();
        if term.is_empty() {
            return Err(DispatchError::InvalidArguments {
                tool: ToolInvocation::SEARCH_TASKS,
                reason: "query must not be empty".to_string(),
            });
        }
        let found = self
            .store
            .query_tasks(&TaskQuery::title_search(term, SEARCH_LIMIT), Deadline::Interactive)
            .await?;
        let bodies = self.store.fetch_bodies(&found).await;

        let results: Vec<Value> = found
            .iter()
            .map(|task| {
                let mut entry = json!({ "id": task.id, "title": task.title });
                if let Some(status) = task.status {
                    entry["status"] = json!(status.as_str());
                }
                if let Some(date) = task.target_date {
                    entry["target_date"] = json!(date.to_string());
                }
                if let Some(body) = bodies.get(&task.id) {
                    entry["snippet"] = json!(snippet(body));
                }
                entry
            })
            .collect();

        Ok(ToolReply::ok(
            format!("{} result(s) for {term:?}", found.len()),
            json!({ "count": found.len(), "results": results }),
        ))
    }

    async fn update(&self, args: UpdateStatusArgs) -> Result<ToolReply, DispatchError> {
        let status = args.parsed_status()?;
        self.store
            .update_status(&args.task_id, status, Deadline::Interactive)
            .await?;
        Ok(ToolReply::ok(
            format!("set {} to {status}", args.task_id),
            json!({ "id": args.task_id, "status": status.as_str() }),
        ))
    }

    async fn detail(&self, args: TaskDetailArgs) -> Result<ToolReply, DispatchError> {
        let record = self
            .store
            .fetch_task(&args.task_id, Deadline::Interactive)
            .await?;
        let mut payload = task_json(&record);
        // Body hydration is best effort; the properties alone are a
        // useful answer.
        match self.store.fetch_body(&record.id, Deadline::Interactive).await {
            Ok(body) if !body.trim().is_empty() => payload["body"] = json!(body),
            Ok(_) => {}
            Err(e) => tracing::debug!(id = %record.id, error = %e, "detail body skipped"),
        }
        Ok(ToolReply::ok(format!("fetched {}", record.id), payload))
    }

    async fn confirm(&self, args: ConfirmArgs) -> Result<ToolReply, DispatchError> {
        let prompt = args.prompt.trim();
        if prompt.is_empty() {
            return Err(DispatchError::InvalidArguments {
                tool: ToolInvocation::REQUEST_USER_CONFIRMATION,
                reason: "prompt must not be empty".to_string(),
            });
        }
        let decision = self.gate.ask(&self.outbox, prompt).await?;
        Ok(ToolReply::ok(
            format!("user {}", decision.as_str()),
            json!({
                "approved": decision.approved(),
                "decision": decision.as_str(),
            }),
        ))
    }
}

/// Compact JSON view of a record; absent fields stay absent.
fn task_json(record: &TaskRecord) -> Value {
    let mut v = json!({ "id": record.id, "title": record.title });
    if let Some(status) = record.status {
        v["status"] = json!(status.as_str());
    }
    if let Some(kind) = record.kind {
        v["kind"] = json!(kind.as_str());
    }
    if let Some(importance) = record.importance {
        v["importance"] = json!(importance.as_str());
    }
    if let Some(urgency) = record.urgency {
        v["urgency"] = json!(urgency.as_str());
    }
    if let Some(category) = record.category {
        v["category"] = json!(category.as_str());
    }
    if !record.tags.is_empty() {
        v["tags"] = json!(record.tags);
    }
    if let Some(date) = record.target_date {
        v["target_date"] = json!(date.to_string());
    }
    if let Some(link) = &record.link {
        v["link"] = json!(link);
    }
    if let Some(url) = &record.url {
        v["url"] = json!(url);
    }
    v
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= SNIPPET_MAX {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(SNIPPET_MAX - 1).collect();
    cut.push('…');
    cut
}
