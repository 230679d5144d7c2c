#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::Message;

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    owner: String,
    title: Option<String>,
    messages: Vec<Message>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// State of a session with respect to its last message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Empty,
    Committed,
    Streaming,
    CommittedWithError,
}

impl Session {
    pub fn new(owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            title: None,
            messages: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_created_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.created_at = timestamp;
        if self.updated_at < timestamp {
            self.updated_at = timestamp;
        }
        self
    }

    pub fn with_updated_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.updated_at = timestamp;
        self
    }

    /// Messages are kept ordered by their index, which is the conversation
    /// order.
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self.messages.sort_by_key(|m| m.message_idx());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn next_message_idx(&self) -> usize {
        self.messages.last().map(|m| m.message_idx()).unwrap_or(0) + 1
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Committed state derived from the stored messages. In-flight
    /// generation is tracked by the engine, not here.
    pub fn committed_state(&self) -> SessionState {
        match self.last_message() {
            None => SessionState::Empty,
            Some(msg) if msg.is_failed() => SessionState::CommittedWithError,
            Some(_) => SessionState::Committed,
        }
    }
}

/// Title derived from the content of the first message.
pub fn derive_title(content: &str, max_chars: usize) -> String {
    let content = content.trim();
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let truncated: String = content.chars().take(max_chars).collect();
    format!("{}...", truncated.trim_end())
}

/// Returns a timestamp strictly after `prev`. Storage keeps millisecond
/// precision, so two mutations inside the same millisecond still move
/// `updated_at` forward.
pub fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = prev + Duration::milliseconds(1);
    if now < floor { floor } else { now }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Empty => write!(f, "empty"),
            SessionState::Committed => write!(f, "committed"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::CommittedWithError => write!(f, "committed_with_error"),
        }
    }
}
