//! taskherd: a chat-driven task assistant.
//!
//! One user, one chat channel, one task store. Free-form notes become
//! structured records through a small tool-calling loop; scheduled
//! scans keep the workload honest; a durable cleanup queue walks the
//! oldest backlog past the user a few items at a time.
//!
//! Layering, bottom up:
//! - [`model`], [`error`], [`config`]: domain types and settings.
//! - [`store`]: the external task store behind a resilience wrapper.
//! - [`classifier`]: the tool-calling model behind a trait.
//! - [`channels`]: the chat transport behind a trait.
//! - [`state`], [`journal`]: local durable state and the append-only
//!   interaction log.
//! - [`agent`], [`scan`], [`cleanup`]: the three things the assistant
//!   actually does.
//! - [`sched`], [`runtime`]: cron ticks and the channel event loop.

pub mod agent;
pub mod channels;
pub mod classifier;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod journal;
pub mod model;
pub mod runtime;
pub mod scan;
pub mod sched;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;
