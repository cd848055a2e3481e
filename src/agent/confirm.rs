//! Two-phase user confirmation.
//!
//! Phase one sends the question with Yes/No buttons and parks a pending
//! token. Phase two is the button press, routed in from the event loop
//! by token. No press within the wait window resolves as a timeout,
//! which callers treat exactly like a decline. At most one confirmation
//! is outstanding at a time; a second ask while one is pending fails
//! fast instead of stacking questions.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

use crate::channels::channel::{Choice, Outbox, OutgoingMessage};
use crate::error::DispatchError;

/// Callback data prefix for confirmation buttons.
pub const CALLBACK_PREFIX: &str = "confirm";

/// How a confirmation request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirmed,
    Declined,
    /// The wait window elapsed without a press. Same effect as a
    /// decline, kept distinct so the transcript says what happened.
    TimedOut,
}

impl Decision {
    pub fn approved(&self) -> bool {
        matches!(self, Decision::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Confirmed => "confirmed",
            Decision::Declined => "declined",
            Decision::TimedOut => "timed_out",
        }
    }
}

pub struct ConfirmationGate {
    wait: Duration,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<bool>>>,
}

impl ConfirmationGate {
    pub fn new(wait: Duration) -> Self {
        ConfirmationGate {
            wait,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Put the question to the user and wait for an answer.
    ///
    /// Blocks up to the configured wait. After resolution the prompt
    /// message is edited to show the outcome, so its buttons stop
    /// inviting presses that can no longer do anything.
    pub async fn ask(&self, outbox: &Outbox, prompt: &str) -> Result<Decision, DispatchError> {
        let token = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if !pending.is_empty() {
                return Err(DispatchError::ConfirmationBusy);
            }
            pending.insert(token, tx);
        }

        let message = OutgoingMessage::plain(prompt).with_buttons(vec![vec![
            Choice::new("Yes", format!("{CALLBACK_PREFIX}:yes:{token}")),
            Choice::new("No", format!("{CALLBACK_PREFIX}:no:{token}")),
        ]]);
        let sent = match outbox.send(message).await {
            Ok(sent) => sent,
            Err(e) => {
                self.pending.lock().await.remove(&token);
                return Err(e.into());
            }
        };
        tracing::debug!(%token, "confirmation sent, waiting");

        let decision = match tokio::time::timeout(self.wait, rx).await {
            Ok(Ok(true)) => Decision::Confirmed,
            Ok(Ok(false)) => Decision::Declined,
            // The sender half vanished without a verdict; fail closed.
            Ok(Err(_)) => Decision::Declined,
            Err(_) => Decision::TimedOut,
        };
        self.pending.lock().await.remove(&token);
        tracing::info!(%token, decision = decision.as_str(), "confirmation resolved");

        let note = match decision {
            Decision::Confirmed => "✅ Confirmed.",
            Decision::Declined => "❌ Declined.",
            Decision::TimedOut => "⏳ No reply in time; treated as declined.",
        };
        if let Err(e) = outbox
            .edit(&sent, OutgoingMessage::plain(format!("{prompt}\n\n{note}")))
            .await
        {
            tracing::debug!(error = %e, "could not close out confirmation prompt");
        }

        Ok(decision)
    }

    /// Route a button press back to the waiting ask.
    ///
    /// Returns false for anything that does not match a live token, so
    /// stale presses (after resolution, or from before a restart) fall
    /// through harmlessly.
    pub async fn resolve(&self, data: &str) -> bool {
        let Some((approved, token)) = parse_callback(data) else {
            return false;
        };
        let Some(tx) = self.pending.lock().await.remove(&token) else {
            tracing::debug!(%token, "press for unknown confirmation token");
            return false;
        };
        tx.send(approved).is_ok()
    }

    pub fn handles(data: &str) -> bool {
        data.starts_with(CALLBACK_PREFIX) && parse_callback(data).is_some()
    }
}

fn parse_callback(data: &str) -> Option<(bool, Uuid)> {
    let rest = data.strip_prefix(CALLBACK_PREFIX)?.strip_prefix(':')?;
    let (verdict, token) = rest.split_once(':')?;
    let approved = match verdict {
        "yes" => true,
        "no" => false,
        _ => return None,
    };
    Some((approved, Uuid::parse_str(token).ok()?))
}
