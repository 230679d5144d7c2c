use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Message, Session};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub title: Option<String>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageSnapshot {
    pub session_id: String,
    pub message_idx: usize,
    pub content: String,
    pub model_id: String,
    pub answer: Option<String>,
    pub failed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id().to_string(),
            title: session.title().map(str::to_string),
            message_count: session.len(),
            created_at: session.created_at(),
            updated_at: session.updated_at(),
        }
    }
}

impl MessageSnapshot {
    pub fn new(session_id: &str, message: &Message) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_idx: message.message_idx(),
            content: message.content().to_string(),
            model_id: message.model_id().to_string(),
            answer: message.answer().map(str::to_string),
            failed: message.is_failed(),
            created_at: message.created_at(),
            updated_at: message.updated_at(),
        }
    }
}
