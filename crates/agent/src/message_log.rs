//! The append-only conversation timeline of one execution.

use mcpagent_core::Message;
use std::collections::HashSet;

/// Ordered, append-only sequence of messages.
///
/// Appending is idempotent by message id: a message already in the log is
/// not appended twice, so replaying a graph update after a restart cannot
/// duplicate context.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message unless it is already present. Returns whether it
    /// was appended.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Append several messages in order, skipping ones already present.
    /// Returns how many were appended.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut appended = 0;
        for message in messages {
            if self.append(message) {
                appended += 1;
            }
        }
        appended
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl FromIterator<Message> for MessageLog {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        let mut log = Self::new();
        log.extend(iter);
        log
    }
}
