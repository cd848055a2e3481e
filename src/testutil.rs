//! Shared test doubles: an in-memory store backend with a real filter
//! evaluator, a scripted classifier, and a recording channel.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use crate::channels::channel::{
    ButtonPress, Channel, ChannelEvent, EventStream, MessageRef, OutgoingMessage, TextFormat,
};
use crate::classifier::provider::{
    Classifier, StopReason, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};
use crate::error::{ChannelError, ClassifierError, StoreError};
use crate::model::{Provenance, TaskDraft, TaskRecord, TaskStatus};
use crate::store::backend::{SortDir, SortKey, StoreBackend, TaskFilter, TaskQuery, TaskSort};

/// Minimal live record for seeding the stub store.
pub fn make_task(id: &str, status: TaskStatus) -> TaskRecord {
    TaskRecord {
        id: id.to_string(),
        title: format!("task {id}"),
        status: Some(status),
        kind: None,
        importance: None,
        urgency: None,
        category: None,
        tags: Vec::new(),
        target_date: None,
        link: None,
        url: Some(format!("https://store.example/{id}")),
        created_at: Some(Utc::now()),
        edited_at: Some(Utc::now()),
        provenance: None,
    }
}

// ==================== store ====================

#[derive(Default)]
pub struct StubStore {
    tasks: Mutex<Vec<TaskRecord>>,
    bodies: Mutex<HashMap<String, String>>,
    created: Mutex<Vec<(TaskDraft, Provenance)>>,
    fail_create: Mutex<VecDeque<StoreError>>,
    fail_update: Mutex<VecDeque<StoreError>>,
    fail_fetch: Mutex<VecDeque<StoreError>>,
    fail_body: Mutex<VecDeque<StoreError>>,
    fail_query: Mutex<VecDeque<StoreError>>,
    update_calls: AtomicU64,
    query_calls: AtomicU64,
    next_id: AtomicU64,
}

impl StubStore {
    pub fn seed(&self, task: TaskRecord) {
        self.tasks.lock().unwrap().push(task);
    }

    pub fn seed_task(&self, id: &str, status: TaskStatus) {
        self.seed(make_task(id, status));
    }

    pub fn set_body(&self, id: &str, body: &str) {
        self.bodies.lock().unwrap().insert(id.to_string(), body.to_string());
    }

    pub fn push_create_failure(&self, err: StoreError) {
        self.fail_create.lock().unwrap().push_back(err);
    }

    pub fn push_update_failure(&self, err: StoreError) {
        self.fail_update.lock().unwrap().push_back(err);
    }

    pub fn push_fetch_failure(&self, err: StoreError) {
        self.fail_fetch.lock().unwrap().push_back(err);
    }

    pub fn push_body_failure(&self, err: StoreError) {
        self.fail_body.lock().unwrap().push_back(err);
    }

    pub fn push_query_failure(&self, err: StoreError) {
        self.fail_query.lock().unwrap().push_back(err);
    }

    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .and_then(|t| t.status)
    }

    /// Flip a stored record directly, as an out-of-band edit would.
    /// Does not count as an update call.
    pub fn set_status(&self, id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.lock().unwrap().iter_mut().find(|t| t.id == id) {
            task.status = Some(status);
        }
    }

    pub fn created(&self) -> Vec<(TaskDraft, Provenance)> {
        self.created.lock().unwrap().clone()
    }
}

fn pop(queue: &Mutex<VecDeque<StoreError>>) -> Option<StoreError> {
    queue.lock().unwrap().pop_front()
}

#[async_trait]
impl StoreBackend for StubStore {
    async fn create_task(
        &self,
        draft: &TaskDraft,
        provenance: Provenance,
    ) -> Result<TaskRecord, StoreError> {
        if let Some(err) = pop(&self.fail_create) {
            return Err(err);
        }
        let n = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let mut record = make_task(&format!("gen-{n}"), TaskStatus::Todo);
        record.title = draft.title.clone();
        record.status = draft.status;
        record.kind = draft.kind;
        record.importance = draft.importance;
        record.urgency = draft.urgency;
        record.category = draft.category;
        record.tags = draft.tags.clone();
        record.target_date = draft.target_date;
        record.link = draft.link.clone();
        record.provenance = Some(provenance);
        self.created.lock().unwrap().push((draft.clone(), provenance));
        self.tasks.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(err) = pop(&self.fail_update) {
            return Err(err);
        }
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        task.status = Some(status);
        task.edited_at = Some(Utc::now());
        Ok(())
    }

    async fn fetch_task(&self, id: &str) -> Result<TaskRecord, StoreError> {
        if let Some(err) = pop(&self.fail_fetch) {
            return Err(err);
        }
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn fetch_body(&self, id: &str) -> Result<String, StoreError> {
        if let Some(err) = pop(&self.fail_body) {
            return Err(err);
        }
        Ok(self.bodies.lock().unwrap().get(id).cloned().unwrap_or_default())
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError> {
        self.query_calls.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(err) = pop(&self.fail_query) {
            return Err(err);
        }
        let mut results: Vec<TaskRecord> = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| query.filter.as_ref().map_or(true, |f| matches(f, t)))
            .cloned()
            .collect();
        results.sort_by(|a, b| compare_all(a, b, &query.sorts));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }
}

fn matches(filter: &TaskFilter, task: &TaskRecord) -> bool {
    match filter {
        TaskFilter::StatusIs(s) => task.status == Some(*s),
        TaskFilter::StatusIsNot(s) => task.status != Some(*s),
        TaskFilter::TargetDateBefore(d) => task.target_date.is_some_and(|t| t < *d),
        TaskFilter::TargetDateOnOrAfter(d) => task.target_date.is_some_and(|t| t >= *d),
        TaskFilter::TargetDateOnOrBefore(d) => task.target_date.is_some_and(|t| t <= *d),
        TaskFilter::TitleContains(s) => {
            task.title.to_lowercase().contains(&s.to_lowercase())
        }
        TaskFilter::EditedBefore(ts) => task.edited_at.is_some_and(|t| t < *ts),
        TaskFilter::CreatedBefore(ts) => task.created_at.is_some_and(|t| t < *ts),
        TaskFilter::And(parts) => parts.iter().all(|f| matches(f, task)),
        TaskFilter::Or(parts) => parts.iter().any(|f| matches(f, task)),
    }
}

fn compare_all(a: &TaskRecord, b: &TaskRecord, sorts: &[TaskSort]) -> Ordering {
    for sort in sorts {
        let ord = match sort.key {
            SortKey::TargetDate => cmp_opt(&a.target_date, &b.target_date),
            SortKey::CreatedTime => cmp_opt(&a.created_at, &b.created_at),
            SortKey::EditedTime => cmp_opt(&a.edited_at, &b.edited_at),
        };
        let ord = match sort.dir {
            SortDir::Ascending => ord,
            SortDir::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

// Empty values sort last, matching the store.
fn cmp_opt<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// ==================== classifier ====================

#[derive(Default)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<ToolCompletionResponse, ClassifierError>>>,
    requests: Mutex<Vec<ToolCompletionRequest>>,
    delay: Mutex<Option<Duration>>,
    next_call: AtomicU64,
}

impl ScriptedClassifier {
    pub fn push_text(&self, text: &str) {
        self.script.lock().unwrap().push_back(Ok(ToolCompletionResponse {
            text: Some(text.to_string()),
            tool_call: None,
            stop: StopReason::EndTurn,
        }));
    }

    pub fn push_tool_call(&self, name: &str, arguments: Value) {
        let n = self.next_call.fetch_add(1, AtomicOrdering::SeqCst);
        self.script.lock().unwrap().push_back(Ok(ToolCompletionResponse {
            text: None,
            tool_call: Some(ToolCall {
                id: format!("call-{n}"),
                name: name.to_string(),
                arguments,
            }),
            stop: StopReason::ToolUse,
        }));
    }

    pub fn push_error(&self, err: ClassifierError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Make every subsequent call hang this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<ToolCompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls_made(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, ClassifierError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ClassifierError::InvalidResponse {
                    reason: "script exhausted".to_string(),
                })
            })
    }
}

// ==================== channel ====================

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<OutgoingMessage>>,
    edits: Mutex<Vec<(MessageRef, OutgoingMessage)>>,
    acks: Mutex<Vec<(String, Option<String>)>>,
    fail_send: Mutex<VecDeque<ChannelError>>,
    fail_edit: Mutex<VecDeque<ChannelError>>,
    reject_markdown: AtomicBool,
    next_id: AtomicU64,
    events: Mutex<Option<tokio::sync::mpsc::Sender<ChannelEvent>>>,
}

impl RecordingChannel {
    /// Reject every markdown-formatted message, as a transport with a
    /// strict parser would.
    pub fn reject_markdown(&self) {
        self.reject_markdown.store(true, AtomicOrdering::SeqCst);
    }

    pub fn fail_next_send(&self, err: ChannelError) {
        self.fail_send.lock().unwrap().push_back(err);
    }

    pub fn fail_next_edit(&self, err: ChannelError) {
        self.fail_edit.lock().unwrap().push_back(err);
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<(MessageRef, OutgoingMessage)> {
        self.edits.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<(String, Option<String>)> {
        self.acks.lock().unwrap().clone()
    }

    pub fn last_sent(&self) -> Option<OutgoingMessage> {
        self.sent.lock().unwrap().last().cloned()
    }

    /// Inject an inbound event, as if the transport delivered it.
    pub async fn push(&self, event: ChannelEvent) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn start(&self) -> Result<EventStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        *self.events.lock().unwrap() = Some(tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn send(&self, message: OutgoingMessage) -> Result<MessageRef, ChannelError> {
        if let Some(err) = self.fail_send.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.reject_markdown.load(AtomicOrdering::SeqCst)
            && message.format == TextFormat::Markdown
        {
            return Err(ChannelError::RenderRejected {
                reason: "can't parse entities".to_string(),
            });
        }
        self.sent.lock().unwrap().push(message);
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(MessageRef(format!("m{id}")))
    }

    async fn edit(
        &self,
        target: &MessageRef,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError> {
        if let Some(err) = self.fail_edit.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.reject_markdown.load(AtomicOrdering::SeqCst)
            && message.format == TextFormat::Markdown
        {
            return Err(ChannelError::RenderRejected {
                reason: "can't parse entities".to_string(),
            });
        }
        self.edits.lock().unwrap().push((target.clone(), message));
        Ok(())
    }

    async fn ack_button(
        &self,
        press: &ButtonPress,
        note: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.acks
            .lock()
            .unwrap()
            .push((press.callback_id.clone(), note.map(str::to_string)));
        Ok(())
    }
}
