//! Chat transport boundary.
//!
//! One [`Channel`] carries everything: inbound text, button presses,
//! outbound sends and in-place edits. The [`Outbox`] wrapper applies
//! message hygiene on the way out; components above it never deal with
//! length caps or formatting rejections.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Longest message the transport will accept.
pub const MESSAGE_MAX: usize = 4000;

/// Inbound free-text message.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    /// Transport-assigned message id.
    pub id: String,
    /// Message content.
    pub text: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

/// A press on an inline button attached to an earlier message.
#[derive(Debug, Clone, PartialEq)]
pub struct ButtonPress {
    /// Transport receipt to acknowledge.
    pub callback_id: String,
    /// The `data` of the [`Choice`] that was pressed.
    pub data: String,
    /// The message the button lived on, when the transport reports it.
    pub message: Option<MessageRef>,
}

/// Everything a channel can hand us.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(IncomingMessage),
    Button(ButtonPress),
}

/// Handle to a delivered message; lets us edit it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Markdown,
}

/// One inline button.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub label: String,
    pub data: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Choice {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// An outbound message: text, formatting, optional button rows.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub text: String,
    pub format: TextFormat,
    /// Button rows; empty means a plain message.
    pub buttons: Vec<Vec<Choice>>,
}

impl OutgoingMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        OutgoingMessage {
            text: text.into(),
            format: TextFormat::Plain,
            buttons: Vec::new(),
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        OutgoingMessage {
            text: text.into(),
            format: TextFormat::Markdown,
            buttons: Vec::new(),
        }
    }

    /// Attach button rows.
    pub fn with_buttons(mut self, rows: Vec<Vec<Choice>>) -> Self {
        self.buttons = rows;
        self
    }

    fn into_plain(mut self) -> Self {
        self.format = TextFormat::Plain;
        self
    }
}

/// Stream of channel events.
pub type EventStream = Pin<Box<dyn Stream<Item = ChannelEvent> + Send>>;

/// Trait for chat transports.
///
/// A channel receives user input as a unified event stream and delivers
/// replies, in-place edits, and button acknowledgements.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Transport name (e.g., "telegram").
    fn name(&self) -> &str;

    /// Start listening.
    ///
    /// Returns the event stream. The channel keeps its own polling
    /// machinery alive for as long as the stream is held.
    async fn start(&self) -> Result<EventStream, ChannelError>;

    /// Deliver a message; the returned handle supports later edits.
    async fn send(&self, message: OutgoingMessage) -> Result<MessageRef, ChannelError>;

    /// Replace the text (and buttons) of an already delivered message.
    async fn edit(
        &self,
        target: &MessageRef,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError>;

    /// Acknowledge a button press so the client stops its spinner.
    async fn ack_button(
        &self,
        press: &ButtonPress,
        note: Option<&str>,
    ) -> Result<(), ChannelError>;
}

/// Outbound hygiene: length cap, and a plain-text second attempt when
/// the transport rejects the formatting. A send is only reported failed
/// after both attempts are gone.
#[derive(Clone)]
pub struct Outbox {
    channel: Arc<dyn Channel>,
}

impl Outbox {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Outbox { channel }
    }

    pub async fn send(&self, message: OutgoingMessage) -> Result<MessageRef, ChannelError> {
        let message = truncate(message);
        match self.channel.send(message.clone()).await {
            Err(ChannelError::RenderRejected { reason })
                if message.format == TextFormat::Markdown =>
            {
                tracing::warn!(reason, "markdown rejected, resending as plain text");
                self.channel.send(message.into_plain()).await
            }
            other => other,
        }
    }

    pub async fn edit(
        &self,
        target: &MessageRef,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError> {
        let message = truncate(message);
        match self.channel.edit(target, message.clone()).await {
            Err(ChannelError::RenderRejected { reason })
                if message.format == TextFormat::Markdown =>
            {
                tracing::warn!(reason, "markdown rejected, editing as plain text");
                self.channel.edit(target, message.into_plain()).await
            }
            other => other,
        }
    }

    /// Best effort; a missed ack only leaves a client spinner.
    pub async fn ack(&self, press: &ButtonPress, note: Option<&str>) {
        if let Err(e) = self.channel.ack_button(press, note).await {
            tracing::debug!(error = %e, "button ack failed");
        }
    }
}

fn truncate(mut message: OutgoingMessage) -> OutgoingMessage {
    if message.text.chars().count() > MESSAGE_MAX {
        let mut text: String = message.text.chars().take(MESSAGE_MAX - 1).collect();
        text.push('…');
        message.text = text;
    }
    message
}
