//! The core models for managing a stateful chat with an LLM.
use crate::openai::{Message, Role};

/// The turns of a conversation in the order they happened. The system
/// prompt and examples are not part of it.
#[derive(Clone, Debug, Default)]
pub struct History(Vec<Message>);

impl History {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn new_with_messages(messages: Vec<Message>) -> Self {
        Self(messages)
    }

    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    pub fn push(&mut self, msg: Message) {
        self.0.push(msg)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }

    /// Total cost of every message in the history.
    pub fn cost(&self, cost: &dyn Fn(&str) -> usize) -> usize {
        self.0.iter().map(|m| cost(m.content())).sum()
    }

    /// Drops the oldest messages until `fixed_cost` plus the cost of
    /// what remains fits within `budget`. Returns how many messages
    /// were removed.
    ///
    /// The newest message is never removed, so a single message over
    /// budget is kept as is. When anything was removed, assistant
    /// replies left at the front without the prompt that produced
    /// them are dropped too.
    pub fn trim(&mut self, budget: usize, fixed_cost: usize, cost: &dyn Fn(&str) -> usize) -> usize {
        let costs: Vec<usize> = self.0.iter().map(|m| cost(m.content())).collect();
        let mut total = fixed_cost + costs.iter().sum::<usize>();
        let mut removed = 0;

        while total > budget && self.0.len() - removed > 1 {
            total -= costs[removed];
            removed += 1;
        }

        if removed > 0 {
            while self.0.len() - removed > 1 && self.0[removed].role() == Role::Assistant {
                removed += 1;
            }
        }

        self.0.drain(..removed);
        removed
    }
}
