//! Anthropic Messages API classifier.
//!
//! Native tool use with parallel calls disabled, temperature pinned to
//! zero. The wire transcript is rebuilt from [`ChatTurn`]s on every
//! call; only the first tool-use block of a response is surfaced, so
//! the replayed exchange always pairs one call with one result.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::config::ClassifierConfig;
use crate::error::ClassifierError;
use crate::classifier::provider::{
    ChatTurn, Classifier, StopReason, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};

const API_VERSION: &str = "2023-06-01";
/// Slightly above the loop's own 30s round deadline.
const HTTP_TIMEOUT: Duration = Duration::from_secs(35);

pub struct AnthropicClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
}

impl AnthropicClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        AnthropicClassifier {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    fn build_body(&self, request: &ToolCompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.0,
            "system": request.system,
            "messages": build_messages(&request.turns),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.input_schema,
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = json!({ "type": "auto", "disable_parallel_tool_use": true });
        }
        body
    }
}

#[async_trait]
impl Classifier for AnthropicClassifier {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, ClassifierError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(&request);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(HTTP_TIMEOUT)
                } else {
                    ClassifierError::RequestFailed {
                        reason: format!("transport error: {e}"),
                    }
                }
            })?;

        let status = response.status();
        tracing::debug!(%status, "classifier response");

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(Duration::from_secs_f64);
            return Err(ClassifierError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ClassifierError::AuthFailed);
        }

        let text = response
            .text()
            .await
            .map_err(|e| ClassifierError::InvalidResponse {
                reason: format!("body read failed: {e}"),
            })?;

        if !status.is_success() {
            let reason = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| format!("status {status}"));
            return Err(ClassifierError::RequestFailed { reason });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| ClassifierError::InvalidResponse {
                reason: format!("json parse failed: {e}"),
            })?;
        parse_response(&parsed)
    }
}

fn build_messages(turns: &[ChatTurn]) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| match turn {
            ChatTurn::User(text) => json!({ "role": "user", "content": text }),
            ChatTurn::Assistant { text, tool_call } => {
                let mut blocks = Vec::new();
                if let Some(text) = text {
                    if !text.is_empty() {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                }
                if let Some(call) = tool_call {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                json!({ "role": "assistant", "content": blocks })
            }
            ChatTurn::ToolResult(result) => json!({
                "role": "user",
                "content": [ {
                    "type": "tool_result",
                    "tool_use_id": result.call_id,
                    "content": result.content,
                    "is_error": result.is_error,
                } ],
            }),
        })
        .collect()
}

fn parse_response(body: &Value) -> Result<ToolCompletionResponse, ClassifierError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| ClassifierError::InvalidResponse {
            reason: "missing content array".to_string(),
        })?;

    let mut texts: Vec<&str> = Vec::new();
    let mut tool_call: Option<ToolCall> = None;
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    texts.push(t);
                }
            }
            Some("tool_use") => {
                if tool_call.is_some() {
                    tracing::warn!("model returned more than one tool call, keeping the first");
                    continue;
                }
                tool_call = Some(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].clone(),
                });
            }
            _ => {}
        }
    }

    let stop = match body["stop_reason"].as_str() {
        Some("end_turn") => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::Other,
    };

    let text = if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    };
    Ok(ToolCompletionResponse { text, tool_call, stop })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::classifier::provider::ToolResultMsg;

    #[test]
    fn messages_replay_tool_exchange() {
        let turns = vec![
            ChatTurn::user("file this: buy stamps"),
            ChatTurn::Assistant {
                text: None,
                tool_call: Some(ToolCall {
                    id: "tu_1".into(),
                    name: "create_task".into(),
                    arguments: json!({ "title": "Buy stamps" }),
                }),
            },
            ChatTurn::ToolResult(ToolResultMsg {
                call_id: "tu_1".into(),
                content: "created".into(),
                is_error: false,
            }),
        ];
        let messages = build_messages(&turns);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "tu_1");
        assert_eq!(messages[2]["content"][0]["is_error"], false);
    }

    #[test]
    fn parse_response_with_tool_call() {
        let body = json!({
            "content": [
                { "type": "text", "text": "filing it" },
                { "type": "tool_use", "id": "tu_9", "name": "create_task",
                  "input": { "title": "Buy stamps" } },
            ],
            "stop_reason": "tool_use",
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.text.as_deref(), Some("filing it"));
        let call = resp.tool_call.unwrap();
        assert_eq!(call.name, "create_task");
        assert_eq!(call.arguments["title"], "Buy stamps");
        assert_eq!(resp.stop, StopReason::ToolUse);
    }

    #[test]
    fn parse_response_keeps_only_first_tool_call() {
        let body = json!({
            "content": [
                { "type": "tool_use", "id": "a", "name": "one", "input": {} },
                { "type": "tool_use", "id": "b", "name": "two", "input": {} },
            ],
            "stop_reason": "tool_use",
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.tool_call.unwrap().name, "one");
    }

    #[test]
    fn parse_response_without_content_is_invalid() {
        let err = parse_response(&json!({ "stop_reason": "end_turn" })).unwrap_err();
        assert!(matches!(err, ClassifierError::InvalidResponse { .. }));
    }
}
