#[cfg(test)]
#[path = "openai_test.rs"]
mod tests;

use crate::backend::utils::{SseEvent, SseReader, request_error, send};
use crate::backend::{ArcBackend, Backend, find_model};
use crate::config::user_agent;
use crate::models::{
    ArcEventTx, BackendConnection, BackendError, BackendPrompt, BackendUsage, Event, ModelInfo,
    Role, Segment,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::{fmt::Display, time};
use thiserror::Error;

/// Remote backend speaking the OpenAI chat completions protocol.
pub struct OpenAI {
    alias: String,
    endpoint: String,
    api_key: Option<String>,
    timeout: Option<time::Duration>,
    client: reqwest::Client,

    models: Vec<ModelInfo>,

    max_output_tokens: Option<usize>,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

#[async_trait]
impl Backend for OpenAI {
    fn name(&self) -> &str {
        &self.alias
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn supports(&self, model_id: &str) -> bool {
        find_model(&self.models, model_id).is_some()
    }

    fn context_budget(&self, model_id: &str) -> Option<usize> {
        find_model(&self.models, model_id)?.context_budget
    }

    async fn generate(
        &self,
        prompt: BackendPrompt,
        event_tx: ArcEventTx,
    ) -> Result<(), BackendError> {
        let model = match find_model(&self.models, prompt.model()) {
            Some(model) => model.vendor_model().to_string(),
            None => {
                return Err(BackendError::Generation(format!(
                    "model {} is not served by {}",
                    prompt.model(),
                    self.alias
                )));
            }
        };

        let messages = prompt
            .segments()
            .iter()
            .map(MessageRequest::from)
            .collect::<Vec<_>>();

        self.chat_completion(&model, messages, event_tx).await
    }
}

impl From<OpenAI> for ArcBackend {
    fn from(value: OpenAI) -> Self {
        Arc::new(value)
    }
}

impl From<&BackendConnection> for OpenAI {
    fn from(value: &BackendConnection) -> Self {
        let mut openai = OpenAI::default().with_endpoint(value.endpoint());

        if let Some(api_key) = value.api_key() {
            openai = openai.with_api_key(api_key);
        }

        if let Some(timeout) = value.timeout_secs() {
            openai = openai.with_timeout(time::Duration::from_secs(timeout));
        }

        if let Some(alias) = value.alias() {
            openai.alias = alias.to_string();
        }

        openai.max_output_tokens = value.max_output_tokens();
        openai.temperature = value.temperature();
        openai.top_p = value.top_p();
        openai.with_models(value.models().to_vec())
    }
}

impl OpenAI {
    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn chat_completion(
        &self,
        model: &str,
        messages: Vec<MessageRequest>,
        event_tx: ArcEventTx,
    ) -> Result<(), BackendError> {
        let completion_req = CompletionRequest {
            model: model.to_string(),
            messages,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            max_completion_tokens: self.max_output_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        };

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .header("Content-Type", "application/json")
            .header("User-Agent", user_agent());

        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        if let Some(token) = &self.api_key {
            req = req.bearer_auth(token);
        }

        log::trace!("Sending completion request: {:?}", completion_req);

        let res = req
            .json(&completion_req)
            .send()
            .await
            .map_err(request_error)?;

        if !res.status().is_success() {
            let http_code = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            log::error!("Error response ({}): {}", http_code, body);
            return Err(match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(resp) => {
                    let mut err = resp.error;
                    err.http_code = http_code;
                    err.into()
                }
                Err(_) => BackendError::Generation(format!("HTTP {}: {}", http_code, body)),
            });
        }

        let mut reader = SseReader::new(res);
        let mut finished = false;

        while let Some(event) = reader.next_event().await? {
            let data = match event {
                SseEvent::Data(data) => data,
                SseEvent::Error(payload) => {
                    return Err(BackendError::Generation(format!("stream error: {}", payload)));
                }
            };
            if data == "[DONE]" {
                finished = true;
                break;
            }

            let chunk = serde_json::from_str::<CompletionResponse>(&data).map_err(|e| {
                BackendError::Generation(format!("parsing completion chunk {}: {}", data, e))
            })?;

            if let Some(err) = chunk.error {
                return Err(err.into());
            }

            if let Some(usage) = chunk.usage {
                send(
                    &event_tx,
                    Event::Usage(BackendUsage {
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        total_tokens: usage.total_tokens,
                    }),
                )
                .await?;
            }

            for choice in chunk.choices {
                if let Some(text) = choice.delta.content {
                    if !text.is_empty() {
                        send(&event_tx, Event::Fragment(text)).await?;
                    }
                }
                if choice.finish_reason.is_some() {
                    finished = true;
                }
            }
        }

        if !finished {
            return Err(BackendError::Generation(
                "stream closed before completion".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for OpenAI {
    fn default() -> Self {
        Self {
            alias: "OpenAI".to_string(),
            endpoint: "https://api.openai.com".to_string(),
            api_key: None,
            timeout: None,
            client: reqwest::Client::new(),
            models: vec![],
            max_output_tokens: None,
            temperature: None,
            top_p: None,
        }
    }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
struct MessageRequest {
    role: String,
    content: String,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<MessageRequest>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionDeltaResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionChoiceResponse {
    #[serde(default)]
    delta: CompletionDeltaResponse,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoiceResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<CompletionUsageResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<OpenAIError>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionUsageResponse {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: OpenAIError,
}

#[derive(Default, Error, Debug, Serialize, Deserialize)]
pub struct OpenAIError {
    #[serde(skip)]
    pub http_code: u16,
    pub message: String,
    #[serde(rename = "type", default)]
    pub err_type: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl OpenAIError {
    fn is_context_overflow(&self) -> bool {
        self.code.as_deref() == Some("context_length_exceeded")
    }
}

impl Display for OpenAIError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpenAI error ({}): {}", self.http_code, self.message)
    }
}

impl From<OpenAIError> for BackendError {
    fn from(err: OpenAIError) -> Self {
        if err.is_context_overflow() {
            BackendError::ContextOverflow(err.to_string())
        } else {
            BackendError::Generation(err.to_string())
        }
    }
}

impl From<&Segment> for MessageRequest {
    fn from(segment: &Segment) -> Self {
        let (role, content) = match segment.role() {
            Role::System => ("system", segment.text().to_string()),
            Role::Reference => ("system", format!("Reference material:\n{}", segment.text())),
            Role::User => ("user", segment.text().to_string()),
            Role::Assistant => ("assistant", segment.text().to_string()),
        };
        Self {
            role: role.to_string(),
            content,
        }
    }
}
