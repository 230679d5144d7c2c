#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;

use crate::backend::{ArcBackend, Backend};
use crate::models::{ArcEventTx, BackendError, BackendPrompt, ModelInfo};
use async_trait::async_trait;
use eyre::{Result, bail};
use std::collections::HashMap;

/// Dispatch table from model id to the backend serving it, built once at
/// startup.
#[derive(Default)]
pub struct Registry {
    connections: HashMap<String, ArcBackend>, /* Alias - Backend */
    models: HashMap<String, String>,          /* Model ID - Alias  */
    catalog: Vec<ModelInfo>,
}

impl Registry {
    pub fn add_connection(&mut self, connection: ArcBackend) -> Result<()> {
        let alias = connection.name().to_string();

        if self.connections.contains_key(&alias) {
            bail!("connection {} already exists", alias)
        }

        let models = connection.models();
        if models.is_empty() {
            bail!("connection {} serves no models", alias)
        }

        if let Some(dup) = models.iter().find(|m| self.models.contains_key(&m.id)) {
            bail!(
                "model {} of connection {} is already served by {}",
                dup.id,
                alias,
                self.models[&dup.id]
            )
        }

        for model in models {
            self.models.insert(model.id.clone(), alias.clone());
            self.catalog.push(model);
        }

        self.connections.insert(alias, connection);
        Ok(())
    }

    pub fn get_connection(&self, model_id: &str) -> Option<&ArcBackend> {
        let alias = self.models.get(model_id)?;
        self.connections.get(alias)
    }
}

#[async_trait]
impl Backend for Registry {
    fn name(&self) -> &str {
        "Registry"
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.catalog.clone()
    }

    fn supports(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    fn context_budget(&self, model_id: &str) -> Option<usize> {
        self.get_connection(model_id)?.context_budget(model_id)
    }

    async fn generate(
        &self,
        prompt: BackendPrompt,
        event_tx: ArcEventTx,
    ) -> Result<(), BackendError> {
        let connection = match self.get_connection(prompt.model()) {
            Some(connection) => connection,
            None => {
                return Err(BackendError::Generation(format!(
                    "model {} is not available",
                    prompt.model()
                )));
            }
        };
        log::debug!(
            "Dispatching model {} to backend {}",
            prompt.model(),
            connection.name()
        );
        connection.generate(prompt, event_tx).await
    }
}
