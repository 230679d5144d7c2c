#[cfg(test)]
#[path = "llama_test.rs"]
mod tests;

use crate::backend::utils::{SseEvent, SseReader, request_error, send};
use crate::backend::{ArcBackend, Backend, find_model};
use crate::config::constants::{DEFAULT_TEMPERATURE, DEFAULT_TOP_P, MAX_OUTPUT_TOKENS};
use crate::config::user_agent;
use crate::models::{
    ArcEventTx, BackendConnection, BackendError, BackendPrompt, BackendUsage, Event, ModelInfo,
    Role, Segment,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time;

const BEGIN_OF_TEXT: &str = "<|begin_of_text|>";
const END_OF_TURN: &str = "<|eot_id|>";

/// Local backend: a quantized model served by a co-located llama.cpp
/// server on the same GPU host.
pub struct Llama {
    alias: String,
    endpoint: String,
    api_key: Option<String>,
    timeout: Option<time::Duration>,
    client: reqwest::Client,

    models: Vec<ModelInfo>,

    max_output_tokens: usize,
    temperature: f32,
    top_p: f32,
}

#[async_trait]
impl Backend for Llama {
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
        if !self.supports(prompt.model()) {
            return Err(BackendError::Generation(format!(
                "model {} is not served by {}",
                prompt.model(),
                self.alias
            )));
        }

        let req = CompletionRequest {
            prompt: render_prompt(prompt.segments()),
            n_predict: self.max_output_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            stop: vec![END_OF_TURN.to_string()],
            stream: true,
            cache_prompt: true,
        };
        self.completion(req, event_tx).await
    }
}

impl From<Llama> for ArcBackend {
    fn from(value: Llama) -> Self {
        Arc::new(value)
    }
}

impl From<&BackendConnection> for Llama {
    fn from(value: &BackendConnection) -> Self {
        let mut llama = Llama::default().with_endpoint(value.endpoint());

        if let Some(api_key) = value.api_key() {
            llama.api_key = Some(api_key.to_string());
        }

        if let Some(timeout) = value.timeout_secs() {
            llama = llama.with_timeout(time::Duration::from_secs(timeout));
        }

        if let Some(alias) = value.alias() {
            llama.alias = alias.to_string();
        }

        if let Some(max_output_tokens) = value.max_output_tokens() {
            llama.max_output_tokens = max_output_tokens;
        }
        if let Some(temperature) = value.temperature() {
            llama.temperature = temperature;
        }
        if let Some(top_p) = value.top_p() {
            llama.top_p = top_p;
        }

        llama.with_models(value.models().to_vec())
    }
}

impl Llama {
    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn completion(
        &self,
        completion_req: CompletionRequest,
        event_tx: ArcEventTx,
    ) -> Result<(), BackendError> {
        let mut req = self
            .client
            .post(format!("{}/completion", self.endpoint))
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
                Ok(resp) => resp.error.into(),
                Err(_) => BackendError::Generation(format!("HTTP {}: {}", http_code, body)),
            });
        }

        let mut reader = SseReader::new(res);
        while let Some(event) = reader.next_event().await? {
            let data = match event {
                SseEvent::Data(data) => data,
                SseEvent::Error(payload) => return Err(stream_error(&payload)),
            };
            let chunk = serde_json::from_str::<CompletionChunk>(&data).map_err(|e| {
                BackendError::Generation(format!("parsing completion chunk {}: {}", data, e))
            })?;

            if let Some(err) = chunk.error {
                return Err(err.into());
            }

            if !chunk.content.is_empty() {
                send(&event_tx, Event::Fragment(chunk.content)).await?;
            }

            if chunk.stop {
                let prompt_tokens = chunk.tokens_evaluated.unwrap_or_default();
                let completion_tokens = chunk.tokens_predicted.unwrap_or_default();
                send(
                    &event_tx,
                    Event::Usage(BackendUsage {
                        prompt_tokens,
                        completion_tokens,
                        total_tokens: prompt_tokens + completion_tokens,
                    }),
                )
                .await?;
                return Ok(());
            }
        }

        Err(BackendError::Generation(
            "stream closed before completion".to_string(),
        ))
    }
}

impl Default for Llama {
    fn default() -> Self {
        Self {
            alias: "Llama".to_string(),
            endpoint: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            timeout: None,
            client: reqwest::Client::new(),
            models: vec![],
            max_output_tokens: MAX_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
        }
    }
}

/// Renders segments with the Llama 3 chat template. Reference segments are
/// folded into the system header.
pub(crate) fn render_prompt(segments: &[Segment]) -> String {
    let mut system = segments
        .iter()
        .filter(|s| s.role() == Role::System)
        .map(|s| s.text())
        .collect::<Vec<_>>()
        .join("\n\n");

    let references = segments
        .iter()
        .filter(|s| s.role() == Role::Reference)
        .map(|s| s.text())
        .collect::<Vec<_>>();
    if !references.is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str("Reference material:\n");
        system.push_str(&references.join("\n\n"));
    }

    let mut prompt = String::from(BEGIN_OF_TEXT);
    if !system.is_empty() {
        push_turn(&mut prompt, "system", &system);
    }
    for segment in segments {
        match segment.role() {
            Role::User => push_turn(&mut prompt, "user", segment.text()),
            Role::Assistant => push_turn(&mut prompt, "assistant", segment.text()),
            Role::System | Role::Reference => {}
        }
    }
    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    prompt
}

fn push_turn(prompt: &mut String, role: &str, text: &str) {
    prompt.push_str("<|start_header_id|>");
    prompt.push_str(role);
    prompt.push_str("<|end_header_id|>\n\n");
    prompt.push_str(text.trim());
    prompt.push_str(END_OF_TURN);
}

#[derive(Debug, Serialize, Deserialize)]
struct CompletionRequest {
    prompt: String,
    n_predict: usize,
    temperature: f32,
    top_p: f32,
    stop: Vec<String>,
    stream: bool,
    cache_prompt: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tokens_predicted: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tokens_evaluated: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<LlamaError>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: LlamaError,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct LlamaError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(rename = "type", default)]
    err_type: String,
}

/// Folds the payload of an `error:` event into a backend error.
fn stream_error(payload: &str) -> BackendError {
    match serde_json::from_str::<LlamaError>(payload) {
        Ok(err) => err.into(),
        Err(_) => BackendError::Generation(format!("llama.cpp error: {}", payload)),
    }
}

impl From<LlamaError> for BackendError {
    fn from(err: LlamaError) -> Self {
        let msg = format!("llama.cpp error ({}): {}", err.code, err.message);
        if err.err_type == "exceed_context_size_error" {
            BackendError::ContextOverflow(msg)
        } else {
            BackendError::Generation(msg)
        }
    }
}
