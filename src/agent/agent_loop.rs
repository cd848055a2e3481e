//! The bounded tool-calling loop.
//!
//! One run takes one input message through at most [`TURN_BUDGET`]
//! model rounds. Each round either ends the conversation with plain
//! text or asks for exactly one tool invocation, which is dispatched
//! and fed back as a tool result. The loop never raises past its
//! boundary: a dead or slow model degrades to a verbatim fallback
//! capture, an exhausted budget to a fixed reply, and everything that
//! happened is recorded on the interaction draft either way.

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use tokio::sync::Mutex;

use crate::agent::dispatcher::Dispatcher;
use crate::agent::history::ConversationMemory;
use crate::agent::tools::{ToolInvocation, ToolReply};
use crate::classifier::prompt::{
    PromptContext, SKIP_SENTINEL, chat_system_prompt, checkin_system_prompt,
};
use crate::classifier::provider::{
    ChatTurn, Classifier, ToolCompletionRequest, ToolResultMsg,
};
use crate::error::ClassifierError;
use crate::journal::{InteractionDraft, RunMode};
use crate::model::{FieldCatalog, Provenance, TaskDraft};
use crate::store::resilient::{Deadline, ResilientStore};

/// Model rounds allowed per run.
pub const TURN_BUDGET: usize = 5;
/// Per-round deadline on the classifier call.
pub const CLASSIFIER_DEADLINE: Duration = Duration::from_secs(30);

const FALLBACK_TIMEOUT_REPLY: &str =
    "That took too long to classify, so I filed your message word for word as a new task.";
const FALLBACK_FAILURE_REPLY: &str =
    "I could not reach the classifier, so I filed your message word for word as a new task.";
const FALLBACK_LOST_REPLY: &str =
    "I could not reach the classifier, and saving your message failed too. \
     Please send it again in a little while.";
const BUDGET_EXHAUSTED_REPLY: &str =
    "I could not finish that within my tool budget. The store may hold partial \
     progress; tell me what to do next.";

pub struct Agent {
    classifier: Arc<dyn Classifier>,
    dispatcher: Dispatcher,
    store: ResilientStore,
    catalog: FieldCatalog,
    home_offset: FixedOffset,
    memory: Mutex<ConversationMemory>,
}

impl Agent {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        dispatcher: Dispatcher,
        store: ResilientStore,
        catalog: FieldCatalog,
        home_offset: FixedOffset,
    ) -> Self {
        Agent {
            classifier,
            dispatcher,
            store,
            catalog,
            home_offset,
            memory: Mutex::new(ConversationMemory::default()),
        }
    }

    /// Drop the conversation window, as on an explicit restart command.
    pub async fn reset_memory(&self) {
        self.memory.lock().await.clear();
    }

    /// Record an exchange delivered outside the chat path, such as a
    /// sent check-in, so follow-up chat has it as context.
    pub async fn remember_exchange(&self, input: &str, reply: &str) {
        self.memory.lock().await.record(input, reply);
    }

    /// Run one input to a reply.
    ///
    /// Always returns a non-empty reply and the draft of exactly one
    /// interaction record; the caller delivers the reply and finishes
    /// the draft with the actual delivery outcome.
    pub async fn run(&self, input: &str, mode: RunMode) -> (String, InteractionDraft) {
        let mut draft = InteractionDraft::new(mode, input);
        let ctx = PromptContext {
            catalog: &self.catalog,
            home_offset: self.home_offset,
            now: Utc::now(),
        };
        let system = match mode {
            RunMode::Chat => chat_system_prompt(&ctx),
            RunMode::Proactive => checkin_system_prompt(&ctx),
        };
        let tools = ToolInvocation::definitions(&self.catalog);

        let mut turns: Vec<ChatTurn> = match mode {
            RunMode::Chat => self.memory.lock().await.replay(),
            RunMode::Proactive => Vec::new(),
        };
        turns.push(ChatTurn::user(input));

        for round in 0..TURN_BUDGET {
            let request = ToolCompletionRequest {
                system: system.clone(),
                turns: turns.clone(),
                tools: tools.clone(),
            };
            let response = match tokio::time::timeout(
                CLASSIFIER_DEADLINE,
                self.classifier.complete(request),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return self.classification_failed(input, mode, draft, e).await,
                Err(_) => {
                    let e = ClassifierError::Timeout(CLASSIFIER_DEADLINE);
                    return self.classification_failed(input, mode, draft, e).await;
                }
            };

            // A tool call wins over any accompanying text; the text is
            // kept on the transcript so the model sees its own words.
            if let Some(call) = response.tool_call.clone() {
                tracing::debug!(round, tool = %call.name, "model asked for a tool");
                let reply = match ToolInvocation::parse(&call.name, call.arguments.clone()) {
                    Ok(invocation) => self.dispatcher.dispatch(invocation).await,
                    Err(e) => {
                        tracing::warn!(tool = %call.name, error = %e, "rejected tool call");
                        ToolReply::fail(e.to_string())
                    }
                };
                draft.push_step(
                    &call.name,
                    call.arguments.clone(),
                    &reply.summary,
                    reply.is_error.then(|| reply.summary.clone()),
                );
                turns.push(ChatTurn::Assistant {
                    text: response.text.clone(),
                    tool_call: Some(call.clone()),
                });
                turns.push(ChatTurn::ToolResult(ToolResultMsg {
                    call_id: call.id,
                    content: reply.content(),
                    is_error: reply.is_error,
                }));
                continue;
            }

            if let Some(text) = response.final_text() {
                let text = text.to_string();
                self.remember(mode, input, &text).await;
                return (text, draft);
            }

            // Neither text nor a tool call; nothing to act on.
            let e = ClassifierError::InvalidResponse {
                reason: "response carried neither text nor a tool call".to_string(),
            };
            return self.classification_failed(input, mode, draft, e).await;
        }

        tracing::warn!(steps = draft.step_count(), "turn budget exhausted");
        draft.set_error("turn budget exhausted without a final reply");
        self.remember(mode, input, BUDGET_EXHAUSTED_REPLY).await;
        (BUDGET_EXHAUSTED_REPLY.to_string(), draft)
    }

    /// The degraded path: the model is unreachable or spoke garbage.
    ///
    /// Chat input is too valuable to drop, so it is captured verbatim
    /// as a fallback-provenance task. A failed check-in has no user
    /// input to save and resolves to the skip sentinel instead.
    async fn classification_failed(
        &self,
        input: &str,
        mode: RunMode,
        mut draft: InteractionDraft,
        error: ClassifierError,
    ) -> (String, InteractionDraft) {
        tracing::warn!(error = %error, ?mode, "classification failed");
        draft.set_error(error.to_string());
        if mode == RunMode::Proactive {
            return (SKIP_SENTINEL.to_string(), draft);
        }

        let timed_out = matches!(error, ClassifierError::Timeout(_));
        let capture = TaskDraft::raw_capture(input);
        let reply = match self
            .store
            .create_task(&capture, Provenance::Fallback, Deadline::Interactive)
            .await
        {
            Ok(record) => {
                draft.push_step(
                    ToolInvocation::CREATE_TASK,
                    serde_json::json!({ "title": capture.title }),
                    &format!("fallback capture ({})", record.id),
                    None,
                );
                if timed_out {
                    FALLBACK_TIMEOUT_REPLY
                } else {
                    FALLBACK_FAILURE_REPLY
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "fallback capture failed, input not saved");
                draft.set_error(format!("{error}; fallback capture failed: {e}"));
                FALLBACK_LOST_REPLY
            }
        };
        self.remember(mode, input, reply).await;
        (reply.to_string(), draft)
    }

    async fn remember(&self, mode: RunMode, input: &str, reply: &str) {
        if mode == RunMode::Chat {
            self.memory.lock().await.record(input, reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::agent::confirm::ConfirmationGate;
    use crate::channels::channel::Outbox;
    use crate::error::StoreError;
    use crate::model::TaskStatus;
    use crate::testutil::{RecordingChannel, ScriptedClassifier, StubStore};

    struct Harness {
        agent: Agent,
        classifier: Arc<ScriptedClassifier>,
        stub: Arc<StubStore>,
    }

    fn harness() -> Harness {
        let classifier = Arc::new(ScriptedClassifier::default());
        let stub = Arc::new(StubStore::default());
        let store = ResilientStore::new(stub.clone());
        let catalog = FieldCatalog::new(vec!["Docs".into()]);
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(ConfirmationGate::new(Duration::from_millis(50))),
            Outbox::new(Arc::new(RecordingChannel::default())),
            catalog.clone(),
        );
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        Harness {
            agent: Agent::new(classifier.clone(), dispatcher, store, catalog, offset),
            classifier,
            stub,
        }
    }

    // ==================== plain conversation ====================

    #[tokio::test]
    async fn text_reply_ends_the_run() {
        let h = harness();
        h.classifier.push_text("You have nothing due today.");

        let (reply, draft) = h.agent.run("anything due?", RunMode::Chat).await;
        assert_eq!(reply, "You have nothing due today.");
        assert_eq!(draft.step_count(), 0);
        assert_eq!(draft.error(), None);
        assert_eq!(h.classifier.calls_made(), 1);
    }

    #[tokio::test]
    async fn chat_memory_is_replayed_on_the_next_run() {
        let h = harness();
        h.classifier.push_text("Noted.");
        h.classifier.push_text("Done.");

        h.agent.run("remember the milk", RunMode::Chat).await;
        h.agent.run("and the eggs", RunMode::Chat).await;

        let second = &h.classifier.requests()[1];
        assert_eq!(second.turns.len(), 3);
        assert_eq!(second.turns[0], ChatTurn::user("remember the milk"));
        assert_eq!(second.turns[1], ChatTurn::assistant_text("Noted."));
        assert_eq!(second.turns[2], ChatTurn::user("and the eggs"));
    }

    // ==================== tool rounds ====================

    #[tokio::test]
    async fn tool_round_feeds_the_result_back() {
        let h = harness();
        h.classifier
            .push_tool_call("create_task", json!({ "title": "Buy milk" }));
        h.classifier.push_text("Filed it.");

        let (reply, draft) = h.agent.run("buy milk tomorrow", RunMode::Chat).await;
        assert_eq!(reply, "Filed it.");
        assert_eq!(draft.step_count(), 1);
        assert_eq!(h.stub.created().len(), 1);

        // The second round saw the assistant turn and the tool result.
        let followup = &h.classifier.requests()[1];
        let n = followup.turns.len();
        assert!(matches!(
            &followup.turns[n - 2],
            ChatTurn::Assistant { tool_call: Some(call), .. } if call.name == "create_task"
        ));
        assert!(matches!(
            &followup.turns[n - 1],
            ChatTurn::ToolResult(result) if !result.is_error
        ));
    }

    #[tokio::test]
    async fn tool_rounds_run_strictly_in_order() {
        let h = harness();
        h.stub.seed_task("t1", TaskStatus::Todo);
        h.classifier.push_tool_call(
            "update_task_status",
            json!({ "task_id": "t1", "status": "Done" }),
        );
        h.classifier
            .push_tool_call("get_task_detail", json!({ "task_id": "t1" }));
        h.classifier.push_text("Closed and verified.");

        let (reply, draft) = h.agent.run("close t1 and double-check", RunMode::Chat).await;
        assert_eq!(reply, "Closed and verified.");
        assert_eq!(draft.step_count(), 2);

        // The detail fetch observed the update made one round earlier.
        let third = &h.classifier.requests()[2];
        let detail_result = third
            .turns
            .iter()
            .filter_map(|t| match t {
                ChatTurn::ToolResult(r) => Some(r),
                _ => None,
            })
            .next_back()
            .unwrap();
        assert!(detail_result.content.contains("\"status\":\"Done\""));
    }

    #[tokio::test]
    async fn invalid_arguments_are_fed_back_not_fatal() {
        let h = harness();
        h.classifier.push_tool_call("create_task", json!({}));
        h.classifier.push_text("I need a title first; what should it be?");

        let (reply, draft) = h.agent.run("make a task", RunMode::Chat).await;
        assert_eq!(reply, "I need a title first; what should it be?");
        assert_eq!(draft.step_count(), 1);
        assert_eq!(draft.error(), None);

        let followup = &h.classifier.requests()[1];
        assert!(matches!(
            followup.turns.last(),
            Some(ChatTurn::ToolResult(result)) if result.is_error
        ));
        // Nothing was created off the malformed call.
        assert!(h.stub.created().is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_is_fed_back_not_fatal() {
        let h = harness();
        h.classifier.push_tool_call("drop_database", json!({}));
        h.classifier.push_text("Sorry, I cannot do that.");

        let (reply, draft) = h.agent.run("clear everything", RunMode::Chat).await;
        assert_eq!(reply, "Sorry, I cannot do that.");
        let record = draft.finish(&reply, true);
        assert_eq!(record.steps.len(), 1);
        assert!(
            record.steps[0]
                .error
                .as_deref()
                .unwrap()
                .contains("unknown tool")
        );
    }

    // ==================== budget ====================

    #[tokio::test]
    async fn budget_exhaustion_returns_the_fixed_reply() {
        let h = harness();
        for i in 0..TURN_BUDGET {
            h.classifier
                .push_tool_call("search_tasks", json!({ "query": format!("q{i}") }));
        }
        // One extra scripted answer that must never be requested.
        h.classifier.push_text("too late");

        let (reply, draft) = h.agent.run("find everything", RunMode::Chat).await;
        assert_eq!(reply, BUDGET_EXHAUSTED_REPLY);
        assert_eq!(draft.step_count(), TURN_BUDGET);
        assert!(draft.error().unwrap().contains("budget"));
        assert_eq!(h.classifier.calls_made(), TURN_BUDGET);
    }

    // ==================== degraded paths ====================

    #[tokio::test]
    async fn classifier_error_captures_the_input_verbatim() {
        let h = harness();
        h.classifier.push_error(ClassifierError::RequestFailed {
            reason: "boom".into(),
        });

        let input = "dentist appointment friday 3pm";
        let (reply, draft) = h.agent.run(input, RunMode::Chat).await;
        assert_eq!(reply, FALLBACK_FAILURE_REPLY);
        assert!(draft.error().unwrap().contains("boom"));

        let created = h.stub.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0.title, input);
        assert_eq!(created[0].0.status, Some(TaskStatus::Todo));
        assert_eq!(created[0].1, Provenance::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_deadline_takes_the_timeout_fallback() {
        let h = harness();
        h.classifier.set_delay(CLASSIFIER_DEADLINE + Duration::from_secs(10));
        h.classifier.push_text("never delivered");

        let (reply, draft) = h.agent.run("slow day", RunMode::Chat).await;
        assert_eq!(reply, FALLBACK_TIMEOUT_REPLY);
        assert!(draft.error().unwrap().contains("timed out"));
        // The hung call was abandoned, not answered.
        assert_eq!(h.classifier.calls_made(), 0);

        let created = h.stub.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0.title, "slow day");
        assert_eq!(created[0].1, Provenance::Fallback);
    }

    #[tokio::test]
    async fn fallback_capture_failure_is_reported_not_dropped() {
        let h = harness();
        h.classifier.push_error(ClassifierError::RequestFailed {
            reason: "down".into(),
        });
        h.stub.push_create_failure(StoreError::Rejected {
            status: 400,
            reason: "archived database".into(),
        });

        let (reply, draft) = h.agent.run("save me", RunMode::Chat).await;
        assert_eq!(reply, FALLBACK_LOST_REPLY);
        let error = draft.error().unwrap();
        assert!(error.contains("down"), "{error}");
        assert!(error.contains("archived database"), "{error}");
    }

    #[tokio::test]
    async fn proactive_failure_skips_instead_of_filing_garbage() {
        let h = harness();
        h.classifier.push_error(ClassifierError::RequestFailed {
            reason: "down".into(),
        });

        let (reply, draft) = h.agent.run("check-in snapshot", RunMode::Proactive).await;
        assert_eq!(reply, SKIP_SENTINEL);
        assert!(draft.error().is_some());
        assert!(h.stub.created().is_empty());
    }

    #[tokio::test]
    async fn empty_response_is_a_classification_failure() {
        let h = harness();
        h.classifier.push_text("   ");

        let (reply, _draft) = h.agent.run("hello", RunMode::Chat).await;
        assert_eq!(reply, FALLBACK_FAILURE_REPLY);
        assert_eq!(h.stub.created().len(), 1);
    }
}
