//! Error types shared across the crate.
//!
//! Each subsystem gets its own enum so callers can match on exactly the
//! failures they can handle. Transient conditions (rate limits, timeouts)
//! are distinct variants; wrappers that exhaust their retry policy fold
//! them into terminal ones.

use std::time::Duration;

use thiserror::Error;

/// Errors from the task store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store asked us to slow down. Retryable up to the policy ceiling.
    #[error("store rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// The operation deadline elapsed, including any retry backoff.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Retries exhausted or the transport failed in a way we do not retry.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The store rejected the request (4xx other than 429).
    #[error("store rejected request ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// The store answered but the payload did not parse.
    #[error("unexpected store response: {reason}")]
    InvalidResponse { reason: String },

    /// No record with the given identifier.
    #[error("no task with id {id}")]
    NotFound { id: String },

    /// Credentials were refused.
    #[error("store authentication failed")]
    AuthFailed,
}

impl StoreError {
    /// Whether a single quick retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::Unavailable { .. } | StoreError::InvalidResponse { .. }
        )
    }
}

/// Errors from the classification model boundary.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier call timed out after {0:?}")]
    Timeout(Duration),

    #[error("classifier rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("classifier request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("classifier response malformed: {reason}")]
    InvalidResponse { reason: String },

    #[error("classifier authentication failed")]
    AuthFailed,
}

/// Errors from the chat transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel startup failed: {reason}")]
    StartupFailed { reason: String },

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    /// The transport rejected the message formatting. The outbox retries
    /// these as plain text before giving up.
    #[error("message rejected by transport: {reason}")]
    RenderRejected { reason: String },

    #[error("edit failed: {reason}")]
    EditFailed { reason: String },
}

/// Errors raised while assembling configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {name}")]
    MissingVar { name: &'static str },

    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },
}

/// Errors from the local operational state file.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file corrupt: {reason}")]
    Corrupt { reason: String },
}

/// Failures produced while validating or executing a tool invocation.
///
/// These are never fatal to a run; the dispatcher renders them into an
/// error tool-result the model sees on the next round.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: &'static str, reason: String },

    /// A second confirmation requested while one is still outstanding.
    #[error("a confirmation prompt is already outstanding for this run")]
    ConfirmationBusy,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("could not reach the user: {0}")]
    Channel(#[from] ChannelError),
}
