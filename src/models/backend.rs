use crate::models::Segment;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Catalog entry for a model the engine accepts as `model_id`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    /// Model name on the vendor side; falls back to `id` when empty
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub description: String,
    /// Prompt ceiling in characters
    #[serde(default, skip_serializing)]
    pub context_budget: Option<usize>,
    /// Augment prompts for this model with retrieved passages
    #[serde(default, skip_serializing)]
    pub retrieval: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BackendUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Fully assembled model input.
#[derive(Debug, Clone)]
pub struct BackendPrompt {
    model: String,
    segments: Vec<Segment>,
}

impl BackendPrompt {
    pub fn new(model: impl Into<String>) -> BackendPrompt {
        BackendPrompt {
            model: model.into(),
            segments: vec![],
        }
    }

    pub fn with_segments(mut self, segments: Vec<Segment>) -> Self {
        self.segments = segments;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Size of the prompt in budget units (characters).
    pub fn size(&self) -> usize {
        self.segments.iter().map(|s| s.size()).sum()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BackendConnection {
    #[serde(default)]
    enabled: bool,
    kind: BackendKind,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    models: Vec<ModelInfo>,

    #[serde(default)]
    max_output_tokens: Option<usize>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
}

impl BackendConnection {
    pub fn new(kind: BackendKind, endpoint: impl Into<String>) -> Self {
        Self {
            enabled: false,
            kind,
            alias: None,
            endpoint: endpoint.into(),
            api_key: None,
            timeout_secs: None,
            models: Vec::new(),
            max_output_tokens: None,
            temperature: None,
            top_p: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    pub fn add_model(mut self, model: ModelInfo) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn kind(&self) -> &BackendKind {
        &self.kind
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_output_tokens(&self) -> Option<usize> {
        self.max_output_tokens
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            vendor: String::new(),
            model: String::new(),
            description: String::new(),
            context_budget: None,
            retrieval: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_context_budget(mut self, budget: usize) -> Self {
        self.context_budget = Some(budget);
        self
    }

    pub fn with_retrieval(mut self, retrieval: bool) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name the vendor API expects.
    pub fn vendor_model(&self) -> &str {
        if self.model.is_empty() {
            &self.id
        } else {
            &self.model
        }
    }
}

#[derive(Hash, PartialEq, Eq, Deserialize, Serialize, Debug, Clone)]
pub enum BackendKind {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "llama")]
    Llama,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::OpenAI => write!(f, "openai"),
            BackendKind::Llama => write!(f, "llama"),
        }
    }
}

impl Display for BackendUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Prompt Tokens: {}, Completion Token: {}, Total: {}",
            self.prompt_tokens, self.completion_tokens, self.total_tokens
        )
    }
}

impl Display for ModelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({})",
            self.id,
            if self.vendor.is_empty() {
                "unknown"
            } else {
                &self.vendor
            }
        )
    }
}
