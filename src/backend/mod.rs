pub mod llama;
pub mod openai;
pub mod registry;
pub(crate) mod utils;

pub use llama::Llama;
pub use openai::OpenAI;
pub use registry::Registry;

#[cfg(test)]
use mockall::{automock, predicate::*};

use crate::{
    config::BackendConfig,
    models::{ArcEventTx, BackendError, BackendKind, BackendPrompt, ModelInfo},
};
use async_trait::async_trait;
use eyre::{Context, Result};
use std::sync::Arc;

/// A model provider adapter.
///
/// `generate` pushes fragments through `event_tx` as they are produced and
/// resolves once generation ends. An `Err` may arrive after fragments have
/// already been pushed; everything pushed before it is all the backend
/// produced.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend {
    fn name(&self) -> &str;
    fn models(&self) -> Vec<ModelInfo>;
    fn supports(&self, model_id: &str) -> bool;
    fn context_budget(&self, model_id: &str) -> Option<usize>;
    async fn generate(
        &self,
        prompt: BackendPrompt,
        event_tx: ArcEventTx,
    ) -> Result<(), BackendError>;
}

pub type ArcBackend = Arc<dyn Backend + Send + Sync>;

pub fn new_registry(config: &BackendConfig) -> Result<ArcBackend> {
    let connections = config
        .connections
        .iter()
        .filter(|c| c.enabled())
        .collect::<Vec<_>>();
    if connections.is_empty() {
        eyre::bail!("No backend connections configured");
    }

    let mut registry = Registry::default();
    for connection in connections {
        let mut connection = connection.clone();
        if connection.timeout_secs().is_none() {
            if let Some(timeout) = config.timeout_secs {
                connection = connection.with_timeout_secs(timeout);
            }
        }

        let backend: ArcBackend = match connection.kind() {
            BackendKind::OpenAI => Arc::new(OpenAI::from(&connection)),
            BackendKind::Llama => Arc::new(Llama::from(&connection)),
        };

        let name = backend.name().to_string();
        registry
            .add_connection(backend)
            .wrap_err(format!("adding backend connection {}", name))?;
        log::debug!("Added backend connection: {}", name);
    }

    Ok(Arc::new(registry))
}

pub(crate) fn find_model<'a>(models: &'a [ModelInfo], model_id: &str) -> Option<&'a ModelInfo> {
    models.iter().find(|m| m.id == model_id)
}
