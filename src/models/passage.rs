use serde::{Deserialize, Serialize};

/// A ranked passage returned by the retrieval collaborator.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Passage {
    pub content: String,
    /// Similarity to the query, higher is more relevant
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub source: Option<String>,
}

impl Passage {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}
