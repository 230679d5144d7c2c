use chrono::{DateTime, Utc};

use crate::models::Session;

#[derive(Debug, Clone, Default)]
pub struct FilterSession {
    id: Option<String>,
    owner: Option<String>,
    title: Option<String>,
    message_contains: Option<String>,
    updated_at_from: Option<DateTime<Utc>>,
    updated_at_to: Option<DateTime<Utc>>,
}

impl FilterSession {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_message_contains(mut self, message_contains: impl Into<String>) -> Self {
        self.message_contains = Some(message_contains.into());
        self
    }

    pub fn with_updated_at_from(mut self, from: DateTime<Utc>) -> Self {
        self.updated_at_from = Some(from);
        self
    }

    pub fn with_updated_at_to(mut self, to: DateTime<Utc>) -> Self {
        self.updated_at_to = Some(to);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn message_contains(&self) -> Option<&str> {
        self.message_contains.as_deref()
    }

    pub fn updated_at_from(&self) -> Option<DateTime<Utc>> {
        self.updated_at_from
    }

    pub fn updated_at_to(&self) -> Option<DateTime<Utc>> {
        self.updated_at_to
    }

    pub fn matches(&self, session: &Session) -> bool {
        if let Some(id) = &self.id {
            if session.id() != id {
                return false;
            }
        }

        if let Some(owner) = &self.owner {
            if !session.is_owned_by(owner) {
                return false;
            }
        }

        if let Some(title) = &self.title {
            if !session.title().is_some_and(|t| t.contains(title.as_str())) {
                return false;
            }
        }

        if let Some(needle) = &self.message_contains {
            if !session
                .messages()
                .iter()
                .any(|msg| msg.content().contains(needle.as_str()))
            {
                return false;
            }
        }

        if let Some(from) = self.updated_at_from {
            if session.updated_at() < from {
                return false;
            }
        }

        if let Some(to) = self.updated_at_to {
            if session.updated_at() > to {
                return false;
            }
        }

        true
    }
}
