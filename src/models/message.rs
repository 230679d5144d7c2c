use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Committed,
    /// Generation failed; the answer holds the failure sentinel
    Failed,
}

/// One user turn together with its generated answer.
#[derive(Debug, Clone)]
pub struct Message {
    message_idx: usize,
    content: String,
    model_id: String,
    answer: Option<String>,
    status: MessageStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(message_idx: usize, content: impl Into<String>, model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            message_idx,
            content: content.into(),
            model_id: model_id.into(),
            answer: None,
            status: MessageStatus::Committed,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
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

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    pub fn set_model_id(&mut self, model_id: impl Into<String>) {
        self.model_id = model_id.into();
    }

    pub fn set_answer(&mut self, answer: Option<String>) {
        self.answer = answer;
    }

    pub fn set_status(&mut self, status: MessageStatus) {
        self.status = status;
    }

    pub fn set_updated_at(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
    }

    pub fn message_idx(&self) -> usize {
        self.message_idx
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn is_failed(&self) -> bool {
        self.status == MessageStatus::Failed
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
