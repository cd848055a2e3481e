//! Telegram Bot API channel.
//!
//! Long-polls `getUpdates` on a spawned task and feeds a unified event
//! stream. Serves exactly one chat: updates from anywhere else are
//! dropped at the door. The bot token is part of every request URL, so
//! URLs never appear in logs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;

use crate::channels::channel::{
    ButtonPress, Channel, ChannelEvent, EventStream, IncomingMessage, MessageRef, OutgoingMessage,
    TextFormat,
};
use crate::config::TelegramConfig;
use crate::error::ChannelError;

/// Server-side long-poll hold.
const POLL_HOLD_SECS: u32 = 50;
/// Client-side cap for one getUpdates round trip.
const POLL_TIMEOUT: Duration = Duration::from_secs(65);
/// Cap for ordinary API calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause after a failed poll before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 64;

pub struct TelegramChannel {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
    chat_id: i64,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig) -> Self {
        // No client-wide timeout: the long poll outlives any sane one.
        // Every request sets its own.
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        TelegramChannel {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            chat_id: config.chat_id,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token.expose_secret(), method)
    }

    async fn call(&self, method: &str, body: Value, timeout: Duration) -> Result<Value, ChannelError> {
        let response = self
            .client
            .post(self.api_url(method))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                reason: format!("{method}: transport error: {e}"),
            })?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(|e| ChannelError::SendFailed {
            reason: format!("{method}: body read failed: {e}"),
        })?;

        if payload["ok"].as_bool() == Some(true) {
            return Ok(payload["result"].clone());
        }

        let description = payload["description"]
            .as_str()
            .unwrap_or("no description")
            .to_string();
        tracing::debug!(method, %status, description, "telegram call rejected");

        // Formatting problems come back as entity-parse complaints; the
        // outbox retries those as plain text.
        if description.contains("can't parse entities") {
            return Err(ChannelError::RenderRejected { reason: description });
        }
        Err(ChannelError::SendFailed {
            reason: format!("{method}: {description}"),
        })
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<EventStream, ChannelError> {
        // Fail fast on a bad token before spawning the poller.
        self.call("getMe", json!({}), CALL_TIMEOUT)
            .await
            .map_err(|e| ChannelError::StartupFailed {
                reason: format!("getMe failed: {e}"),
            })?;

        let (tx, rx) = tokio::sync::mpsc::channel::<ChannelEvent>(EVENT_BUFFER);
        let poller = TelegramChannel {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            chat_id: self.chat_id,
        };

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            loop {
                let body = json!({
                    "timeout": POLL_HOLD_SECS,
                    "offset": offset,
                    "allowed_updates": ["message", "callback_query"],
                });
                match poller.call("getUpdates", body, POLL_TIMEOUT).await {
                    Ok(result) => {
                        for update in result.as_array().into_iter().flatten() {
                            if let Some(id) = update["update_id"].as_i64() {
                                offset = offset.max(id + 1);
                            }
                            let Some(event) = parse_update(update, poller.chat_id) else {
                                continue;
                            };
                            if tx.send(event).await.is_err() {
                                tracing::debug!("event stream dropped, stopping poller");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "getUpdates failed, backing off");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn send(&self, message: OutgoingMessage) -> Result<MessageRef, ChannelError> {
        let body = build_send_body(self.chat_id, &message, None);
        let result = self.call("sendMessage", body, CALL_TIMEOUT).await?;
        let id = result["message_id"]
            .as_i64()
            .ok_or_else(|| ChannelError::SendFailed {
                reason: "sendMessage result without message_id".to_string(),
            })?;
        Ok(MessageRef(id.to_string()))
    }

    async fn edit(
        &self,
        target: &MessageRef,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError> {
        let message_id: i64 = target.0.parse().map_err(|_| ChannelError::EditFailed {
            reason: format!("bad message ref: {}", target.0),
        })?;
        let body = build_send_body(self.chat_id, &message, Some(message_id));
        match self.call("editMessageText", body, CALL_TIMEOUT).await {
            Ok(_) => Ok(()),
            // Re-sending identical text is not a failure.
            Err(ChannelError::SendFailed { reason })
                if reason.contains("message is not modified") =>
            {
                Ok(())
            }
            Err(ChannelError::RenderRejected { reason }) => {
                Err(ChannelError::RenderRejected { reason })
            }
            Err(ChannelError::SendFailed { reason }) => Err(ChannelError::EditFailed { reason }),
            Err(e) => Err(e),
        }
    }

    async fn ack_button(
        &self,
        press: &ButtonPress,
        note: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({ "callback_query_id": press.callback_id });
        if let Some(note) = note {
            body["text"] = json!(note);
        }
        self.call("answerCallbackQuery", body, CALL_TIMEOUT).await?;
        Ok(())
    }
}

fn build_send_body(chat_id: i64, message: &OutgoingMessage, edit_of: Option<i64>) -> Value {
    let mut body = json!({
        "chat_id": chat_id,
        "text": message.text,
    });
    if let Some(message_id) = edit_of {
        body["message_id"] = json!(message_id);
    }
    if message.format == TextFormat::Markdown {
        body["parse_mode"] = json!("Markdown");
    }
    if !message.buttons.is_empty() {
        let keyboard: Vec<Vec<Value>> = message
            .buttons
            .iter()
            .map(|row| {
                row.iter()
                    .map(|c| json!({ "text": c.label, "callback_data": c.data }))
                    .collect()
            })
            .collect();
        body["reply_markup"] = json!({ "inline_keyboard": keyboard });
    }
    body
}

fn parse_update(update: &Value, chat_id: i64) -> Option<ChannelEvent> {
    if let Some(message) = update.get("message").filter(|m| !m.is_null()) {
        if message["chat"]["id"].as_i64() != Some(chat_id) {
            tracing::debug!("ignoring message from foreign chat");
            return None;
        }
        let text = message["text"].as_str()?;
        return Some(ChannelEvent::Message(IncomingMessage {
            id: message["message_id"].as_i64().unwrap_or_default().to_string(),
            text: text.to_string(),
            received_at: Utc::now(),
        }));
    }

    if let Some(query) = update.get("callback_query").filter(|q| !q.is_null()) {
        if query["message"]["chat"]["id"].as_i64() != Some(chat_id) {
            tracing::debug!("ignoring callback from foreign chat");
            return None;
        }
        return Some(ChannelEvent::Button(ButtonPress {
            callback_id: query["id"].as_str().unwrap_or_default().to_string(),
            data: query["data"].as_str().unwrap_or_default().to_string(),
            message: query["message"]["message_id"]
                .as_i64()
                .map(|id| MessageRef(id.to_string())),
        }));
    }

    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::channels::channel::Choice;

    const CHAT: i64 = 777;

    #[test]
    fn parse_update_accepts_own_chat_text() {
        let update = json!({
            "update_id": 5,
            "message": {
                "message_id": 42,
                "chat": { "id": CHAT },
                "text": "remember the milk",
            },
        });
        let Some(ChannelEvent::Message(msg)) = parse_update(&update, CHAT) else {
            panic!("expected message event");
        };
        assert_eq!(msg.id, "42");
        assert_eq!(msg.text, "remember the milk");
    }

    #[test]
    fn parse_update_drops_foreign_chats_and_non_text() {
        let foreign = json!({
            "message": { "message_id": 1, "chat": { "id": 1234 }, "text": "hi" },
        });
        assert_eq!(parse_update(&foreign, CHAT), None);

        let sticker = json!({
            "message": { "message_id": 2, "chat": { "id": CHAT }, "sticker": {} },
        });
        assert_eq!(parse_update(&sticker, CHAT), None);
    }

    #[test]
    fn parse_update_maps_callbacks() {
        let update = json!({
            "callback_query": {
                "id": "cb-1",
                "data": "confirm:yes:token",
                "message": { "message_id": 9, "chat": { "id": CHAT } },
            },
        });
        let Some(ChannelEvent::Button(press)) = parse_update(&update, CHAT) else {
            panic!("expected button event");
        };
        assert_eq!(press.callback_id, "cb-1");
        assert_eq!(press.data, "confirm:yes:token");
        assert_eq!(press.message, Some(MessageRef("9".to_string())));
    }

    #[test]
    fn send_body_shapes() {
        let msg = OutgoingMessage::markdown("*hello*").with_buttons(vec![vec![
            Choice::new("Keep", "cleanup:keep:1"),
            Choice::new("Retire", "cleanup:retire:1"),
        ]]);
        let body = build_send_body(CHAT, &msg, None);
        assert_eq!(body["chat_id"], CHAT);
        assert_eq!(body["parse_mode"], "Markdown");
        let row = &body["reply_markup"]["inline_keyboard"][0];
        assert_eq!(row[0]["callback_data"], "cleanup:keep:1");
        assert!(body.get("message_id").is_none());

        let plain = OutgoingMessage::plain("x");
        let edit = build_send_body(CHAT, &plain, Some(9));
        assert_eq!(edit["message_id"], 9);
        assert!(edit.get("parse_mode").is_none());
        assert!(edit.get("reply_markup").is_none());
    }
}
