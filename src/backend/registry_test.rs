use std::sync::Arc;

use tokio::sync::mpsc;

use super::*;
use crate::backend::MockBackend;
use crate::config::BackendConfig;
use crate::models::{BackendConnection, BackendKind, Event};

fn mock_backend(alias: &str, models: &[&str]) -> MockBackend {
    let mut backend = MockBackend::new();
    backend.expect_name().return_const(alias.to_string());
    let models = models
        .iter()
        .map(|id| ModelInfo::new(*id).with_context_budget(1000))
        .collect::<Vec<_>>();
    backend.expect_models().returning(move || models.clone());
    backend
}

#[test]
fn test_add_connection() {
    let mut registry = Registry::default();
    registry
        .add_connection(Arc::new(mock_backend("remote", &["gpt-4o", "gpt-4o-mini"])))
        .expect("Failed to add connection");
    registry
        .add_connection(Arc::new(mock_backend("local", &["llama-3-8b"])))
        .expect("Failed to add connection");

    let ids = registry
        .models()
        .iter()
        .map(|m| m.id.clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["gpt-4o", "gpt-4o-mini", "llama-3-8b"]);
    assert!(registry.supports("llama-3-8b"));
    assert!(!registry.supports("gpt-5"));
    assert_eq!(
        registry.get_connection("gpt-4o").map(|c| c.name().to_string()),
        Some("remote".to_string())
    );
}

#[test]
fn test_add_connection_duplicate_model() {
    let mut registry = Registry::default();
    registry
        .add_connection(Arc::new(mock_backend("remote", &["shared"])))
        .expect("Failed to add connection");

    let err = registry
        .add_connection(Arc::new(mock_backend("local", &["shared"])))
        .expect_err("duplicate model id must be refused");
    assert!(err.to_string().contains("already served by remote"));
    assert!(registry.get_connection("shared").is_some());
}

#[test]
fn test_add_connection_duplicate_alias() {
    let mut registry = Registry::default();
    registry
        .add_connection(Arc::new(mock_backend("remote", &["a"])))
        .expect("Failed to add connection");
    assert!(
        registry
            .add_connection(Arc::new(mock_backend("remote", &["b"])))
            .is_err()
    );
    assert!(!registry.supports("b"));
}

#[test]
fn test_add_connection_without_models() {
    let mut registry = Registry::default();
    assert!(
        registry
            .add_connection(Arc::new(mock_backend("empty", &[])))
            .is_err()
    );
    assert!(registry.models().is_empty());
}

#[tokio::test]
async fn test_generate_dispatch() {
    let mut local = mock_backend("local", &["llama-3-8b"]);
    local
        .expect_generate()
        .withf(|prompt, _| prompt.model() == "llama-3-8b")
        .times(1)
        .returning(|_, _| Ok(()));
    local
        .expect_context_budget()
        .returning(|_| Some(1000));

    let mut remote = mock_backend("remote", &["gpt-4o"]);
    remote.expect_generate().never();

    let mut registry = Registry::default();
    registry.add_connection(Arc::new(local)).unwrap();
    registry.add_connection(Arc::new(remote)).unwrap();

    let (tx, _rx) = mpsc::unbounded_channel::<Event>();
    registry
        .generate(BackendPrompt::new("llama-3-8b"), Arc::new(tx))
        .await
        .expect("Failed to generate");
    assert_eq!(registry.context_budget("llama-3-8b"), Some(1000));
}

#[tokio::test]
async fn test_generate_unknown_model() {
    let mut registry = Registry::default();
    registry
        .add_connection(Arc::new(mock_backend("remote", &["gpt-4o"])))
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel::<Event>();
    let err = registry
        .generate(BackendPrompt::new("gpt-5"), Arc::new(tx))
        .await
        .expect_err("unknown model must fail");
    assert_eq!(
        err,
        BackendError::Generation("model gpt-5 is not available".to_string())
    );
}

#[test]
fn test_new_registry_rejects_duplicate_model() {
    let config = BackendConfig {
        connections: vec![
            BackendConnection::new(BackendKind::OpenAI, "https://api.openai.com")
                .with_alias("remote")
                .add_model(ModelInfo::new("shared")),
            BackendConnection::new(BackendKind::Llama, "http://127.0.0.1:8080")
                .with_alias("local")
                .add_model(ModelInfo::new("shared")),
        ],
        ..Default::default()
    };

    let err = crate::backend::new_registry(&config)
        .err()
        .expect("duplicate model should fail");
    assert!(format!("{:?}", err).contains("already served by remote"));
}

#[test]
fn test_new_registry_skips_disabled() {
    let config = BackendConfig {
        connections: vec![
            BackendConnection::new(BackendKind::OpenAI, "https://api.openai.com")
                .with_alias("remote")
                .add_model(ModelInfo::new("shared")),
            BackendConnection::new(BackendKind::Llama, "http://127.0.0.1:8080")
                .with_alias("local")
                .with_enabled(false)
                .add_model(ModelInfo::new("shared")),
        ],
        ..Default::default()
    };

    let registry = crate::backend::new_registry(&config).expect("Failed to build registry");
    assert!(registry.supports("shared"));
    assert_eq!(registry.models().len(), 1);
}
