//! Short conversation memory.

use std::collections::VecDeque;

use crate::classifier::provider::ChatTurn;

/// How many user/assistant exchanges to keep.
pub const HISTORY_PAIRS: usize = 4;

/// Rolling window of recent exchanges, replayed ahead of each new
/// message so follow-ups like "push that one to Friday" keep their
/// referent. Tool traffic is not kept; only what the user saw.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    pairs: VecDeque<(String, String)>,
}

impl ConversationMemory {
    pub fn record(&mut self, user: &str, assistant: &str) {
        self.pairs
            .push_back((user.to_string(), assistant.to_string()));
        while self.pairs.len() > HISTORY_PAIRS {
            self.pairs.pop_front();
        }
    }

    /// Transcript prefix for the next run, oldest first.
    pub fn replay(&self) -> Vec<ChatTurn> {
        self.pairs
            .iter()
            .flat_map(|(user, assistant)| {
                [ChatTurn::user(user), ChatTurn::assistant_text(assistant)]
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
