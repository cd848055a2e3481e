//! The interactive agent.
//!
//! One inbound message becomes one bounded tool-calling run: the
//! classifier proposes, the dispatcher executes against the store, and
//! the confirmation gate pulls the user in before anything sweeping.

pub mod agent_loop;
pub mod confirm;
pub mod dispatcher;
pub mod history;
pub mod tools;

pub use agent_loop::{Agent, CLASSIFIER_DEADLINE, TURN_BUDGET};
pub use confirm::{ConfirmationGate, Decision};
pub use dispatcher::Dispatcher;
pub use history::ConversationMemory;
pub use tools::{ToolInvocation, ToolReply};
