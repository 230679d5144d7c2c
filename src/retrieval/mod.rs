#[cfg(test)]
#[path = "retrieval_test.rs"]
mod tests;

#[cfg(test)]
use mockall::{automock, predicate::*};

use crate::config::{RetrievalConfig, user_agent};
use crate::models::Passage;
use async_trait::async_trait;
use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time;

/// Source of ranked passages relevant to a user query.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Retriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>>;
}

pub type ArcRetriever = Arc<dyn Retriever + Send + Sync>;

/// Retriever for deployments without a vector store.
#[derive(Default)]
pub struct NoopRetriever;

#[async_trait]
impl Retriever for NoopRetriever {
    async fn retrieve(&self, _query: &str) -> Result<Vec<Passage>> {
        Ok(vec![])
    }
}

/// Queries a vector-search service over HTTP.
///
/// The service answers `POST {endpoint}/retrieve` with the `top_k` passages
/// closest to the query, best first.
pub struct HttpRetriever {
    endpoint: String,
    top_k: usize,
    timeout: Option<time::Duration>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    query: &'a str,
    n_results: usize,
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    passages: Vec<Passage>,
}

impl HttpRetriever {
    pub fn new(endpoint: &str, top_k: usize) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            top_k,
            timeout: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>> {
        let mut req = self
            .client
            .post(format!("{}/retrieve", self.endpoint))
            .header("Content-Type", "application/json")
            .header("User-Agent", user_agent())
            .json(&RetrieveRequest {
                query,
                n_results: self.top_k,
            });

        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        let res = req.send().await.wrap_err("sending retrieve request")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("retrieve request failed ({}): {}", status, body);
        }

        let mut passages = res
            .json::<RetrieveResponse>()
            .await
            .wrap_err("parsing retrieve response")?
            .passages;
        passages.sort_by(|a, b| b.score.total_cmp(&a.score));
        passages.truncate(self.top_k);
        Ok(passages)
    }
}

pub fn new_retriever(config: &RetrievalConfig) -> Result<ArcRetriever> {
    if !config.enabled {
        return Ok(Arc::new(NoopRetriever));
    }
    if config.endpoint.is_empty() {
        bail!("retrieval is enabled but no endpoint is configured");
    }

    let mut retriever = HttpRetriever::new(&config.endpoint, config.top_k);
    if let Some(timeout) = config.timeout_secs {
        retriever = retriever.with_timeout(time::Duration::from_secs(timeout));
    }
    log::debug!("Using retrieval service at {}", config.endpoint);
    Ok(Arc::new(retriever))
}
