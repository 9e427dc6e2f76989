//! Rolling display buffer for chat clients.

use crate::codec::Message;
use std::collections::VecDeque;

pub const DEFAULT_MAX_MESSAGES: usize = 50;

/// Ordered, capped list of formatted chat lines; the oldest line is dropped
/// once `max_messages` is exceeded.
#[derive(Debug, Clone)]
pub struct ChatLog {
    lines: VecDeque<String>,
    max_messages: usize,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl ChatLog {
    pub fn new(max_messages: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_messages),
            max_messages: max_messages.max(1),
        }
    }

    pub fn push_chat(&mut self, sender: &str, body: &str) {
        self.push(format!("{sender}: {body}"));
    }

    pub fn push_system(&mut self, text: &str) {
        self.push(format!("[System] {text}"));
    }

    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_messages {
            self.lines.pop_front();
        }
    }

    /// Formats a message received from the relay. Returns false for message
    /// kinds that have no chat representation.
    pub fn apply(&mut self, message: &Message) -> bool {
        match message {
            Message::Chat { sender, body } => self.push_chat(sender, body),
            Message::System(text) => self.push_system(text),
            Message::Connect(name) => self.push_system(&format!("{name} joined the chat")),
            Message::Disconnect(name) => self.push_system(&format!("{name} left the chat")),
            _ => return false,
        }
        true
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}
