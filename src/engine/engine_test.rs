use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::*;
use crate::backend::Backend;
use crate::models::{ArcEventTx, Role};
use crate::retrieval::NoopRetriever;
use crate::storage::sqlite::Sqlite;

#[derive(Clone, Default)]
struct Script {
    fragments: Vec<String>,
    failure: Option<BackendError>,
    /// Held open after the fragments until notified
    gate: Option<Arc<Notify>>,
    delay: Option<time::Duration>,
}

impl Script {
    fn fragments(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    fn with_failure(mut self, failure: BackendError) -> Self {
        self.failure = Some(failure);
        self
    }

    fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn with_delay(mut self, delay: time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Plays queued scripts in order; answers "re: <content>" once the queue is
/// empty.
struct ScriptedBackend {
    models: Vec<ModelInfo>,
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<BackendPrompt>>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self {
            models: vec![
                ModelInfo::new("m1").with_vendor("local"),
                ModelInfo::new("m2").with_vendor("remote"),
                ModelInfo::new("tiny").with_context_budget(10),
            ],
            scripts: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(vec![]),
        }
    }

    fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    fn last_prompt(&self) -> BackendPrompt {
        self.prompts.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn supports(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.id == model_id)
    }

    fn context_budget(&self, model_id: &str) -> Option<usize> {
        self.models
            .iter()
            .find(|m| m.id == model_id)?
            .context_budget
    }

    async fn generate(
        &self,
        prompt: BackendPrompt,
        event_tx: ArcEventTx,
    ) -> Result<(), BackendError> {
        let content = prompt
            .segments()
            .last()
            .map(|s| s.text().to_string())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt);

        let script = self.scripts.lock().unwrap().pop_front();
        let script = script.unwrap_or_else(|| Script {
            fragments: vec!["re: ".to_string(), content],
            ..Default::default()
        });

        for fragment in script.fragments {
            event_tx
                .send(Event::Fragment(fragment))
                .await
                .map_err(|e| BackendError::Generation(e.to_string()))?;
        }
        if let Some(gate) = script.gate {
            gate.notified().await;
        }
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        match script.failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Fixture {
    engine: Engine,
    backend: Arc<ScriptedBackend>,
}

async fn setup() -> Fixture {
    setup_with(Configuration::default()).await
}

async fn setup_with(config: Configuration) -> Fixture {
    let backend = Arc::new(ScriptedBackend::new());
    let storage = Arc::new(Sqlite::new(None).await.unwrap());
    let engine = Engine::new(&config, backend.clone(), storage, Arc::new(NoopRetriever));
    Fixture { engine, backend }
}

const OWNER: &str = "alice";

async fn send(engine: &Engine, session_id: &str, content: &str) -> (Vec<String>, CommitResult) {
    engine
        .append_message(session_id, OWNER, content, "m1")
        .await
        .expect("Failed to append")
        .finish()
        .await
}

#[tokio::test]
async fn test_append_then_edit() {
    let Fixture { engine, .. } = setup().await;
    let session = engine.create_session(OWNER).await.unwrap();
    let id = session.session_id.as_str();
    assert_eq!(session.message_count, 0);
    assert_eq!(
        engine.session_state(id, OWNER).await.unwrap(),
        SessionState::Empty
    );

    let (fragments, commit) = send(&engine, id, "a").await;
    assert_eq!(fragments, vec!["re: ", "a"]);
    let first = commit.expect("Failed to commit");
    assert_eq!(first.message_idx, 1);
    assert_eq!(first.answer.as_deref(), Some("re: a"));
    assert!(!first.failed);

    let snapshot = engine.get_session(id, OWNER).await.unwrap();
    assert_eq!(snapshot.title.as_deref(), Some("a"));
    assert_eq!(snapshot.message_count, 1);

    let stored = engine.list_messages(id, OWNER).await.unwrap().remove(0);
    let (fragments, commit) = engine
        .edit_last_message(id, OWNER, 1, "b", "m1")
        .await
        .expect("Failed to edit")
        .finish()
        .await;
    assert_eq!(fragments, vec!["re: ", "b"]);
    commit.expect("Failed to commit");

    let messages = engine.list_messages(id, OWNER).await.unwrap();
    assert_eq!(messages.len(), 1);
    let edited = &messages[0];
    assert_eq!(edited.message_idx, 1);
    assert_eq!(edited.content, "b");
    assert_eq!(edited.answer.as_deref(), Some("re: b"));
    assert_eq!(edited.created_at, stored.created_at);
    assert!(edited.updated_at > stored.updated_at);

    let after = engine.get_session(id, OWNER).await.unwrap();
    assert_eq!(after.title.as_deref(), Some("a"));
    assert!(after.updated_at > snapshot.updated_at);
    assert_eq!(
        engine.session_state(id, OWNER).await.unwrap(),
        SessionState::Committed
    );
}

#[tokio::test]
async fn test_regenerate_with_other_model() {
    let Fixture { engine, backend } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;
    send(&engine, &id, "first").await.1.unwrap();
    send(&engine, &id, "second").await.1.unwrap();
    let before = engine.list_messages(&id, OWNER).await.unwrap();

    backend.push(Script::fragments(&["fresh"]));
    let (fragments, commit) = engine
        .regenerate_last_message(&id, OWNER, "m2")
        .await
        .expect("Failed to regenerate")
        .finish()
        .await;
    assert_eq!(fragments, vec!["fresh"]);
    commit.unwrap();

    let after = engine.list_messages(&id, OWNER).await.unwrap();
    assert_eq!(after.len(), 2);
    assert_eq!(after[0], before[0]);
    assert_eq!(after[1].message_idx, 2);
    assert_eq!(after[1].content, "second");
    assert_eq!(after[1].model_id, "m2");
    assert_eq!(after[1].answer.as_deref(), Some("fresh"));
    assert_eq!(after[1].created_at, before[1].created_at);
    assert!(after[1].updated_at > before[1].updated_at);

    // the regenerated turn sees only the first one as history
    let prompt = backend.last_prompt();
    let roles = prompt
        .segments()
        .iter()
        .map(|s| (s.role(), s.text().to_string()))
        .collect::<Vec<_>>();
    assert_eq!(&roles[1..], &[
        (Role::User, "first".to_string()),
        (Role::Assistant, "re: first".to_string()),
        (Role::User, "second".to_string()),
    ]);
}

#[tokio::test]
async fn test_delete_last_message() {
    let Fixture { engine, .. } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;
    send(&engine, &id, "one").await.1.unwrap();
    send(&engine, &id, "two").await.1.unwrap();
    let first = engine.list_messages(&id, OWNER).await.unwrap().remove(0);

    let deleted = engine.delete_last_message(&id, OWNER).await.unwrap();
    assert_eq!(deleted.message_idx, 2);
    let messages = engine.list_messages(&id, OWNER).await.unwrap();
    assert_eq!(messages, vec![first]);

    engine.delete_last_message(&id, OWNER).await.unwrap();
    let session = engine.get_session(&id, OWNER).await.unwrap();
    assert_eq!(session.message_count, 0);
    assert_eq!(session.title.as_deref(), Some("one"));

    let err = engine.delete_last_message(&id, OWNER).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    // indices restart contiguously and the title survives
    let (_, commit) = send(&engine, &id, "three").await;
    assert_eq!(commit.unwrap().message_idx, 1);
    let session = engine.get_session(&id, OWNER).await.unwrap();
    assert_eq!(session.title.as_deref(), Some("one"));
}

#[tokio::test]
async fn test_failure_mid_stream() {
    let Fixture { engine, backend } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    backend.push(
        Script::fragments(&["one ", "two ", "three "])
            .with_failure(BackendError::Generation("connection reset".to_string())),
    );
    let (fragments, commit) = send(&engine, &id, "count").await;

    assert_eq!(fragments.len(), 4);
    assert_eq!(&fragments[..3], &["one ", "two ", "three "]);
    assert!(is_error_fragment(&fragments[3]));
    assert!(fragments[3].contains("connection reset"));

    let committed = commit.expect("failed turns are still committed");
    assert!(committed.failed);

    let stored = engine.list_messages(&id, OWNER).await.unwrap().remove(0);
    assert_eq!(
        stored.answer.as_deref(),
        Some(Configuration::default().general.failure_answer.as_str())
    );
    assert!(stored.failed);
    assert_eq!(
        engine.session_state(&id, OWNER).await.unwrap(),
        SessionState::CommittedWithError
    );

    // a failed turn can be regenerated
    let (_, commit) = engine
        .regenerate_last_message(&id, OWNER, "m1")
        .await
        .unwrap()
        .finish()
        .await;
    assert!(!commit.unwrap().failed);
    assert_eq!(
        engine.session_state(&id, OWNER).await.unwrap(),
        SessionState::Committed
    );
}

#[tokio::test]
async fn test_failure_before_first_fragment() {
    let Fixture { engine, backend } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    backend.push(
        Script::default().with_failure(BackendError::ContextOverflow("too long".to_string())),
    );
    let (fragments, commit) = send(&engine, &id, "hello").await;

    assert_eq!(fragments.len(), 1);
    assert!(fragments[0].starts_with(ERROR_MARKER));
    assert!(commit.unwrap().failed);
    let session = engine.get_session(&id, OWNER).await.unwrap();
    assert_eq!(session.title.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_generation_timeout() {
    let mut config = Configuration::default();
    config.backend.generation_timeout_secs = 1;
    let Fixture { engine, backend } = setup_with(config).await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    backend.push(Script::fragments(&["slow"]).with_delay(time::Duration::from_secs(30)));
    let (fragments, commit) = send(&engine, &id, "hello").await;

    assert_eq!(fragments[0], "slow");
    assert!(fragments[1].contains("timed out"));
    assert!(commit.unwrap().failed);
}

#[tokio::test]
async fn test_regenerate_empty_session() {
    let Fixture { engine, backend } = setup().await;
    let created = engine.create_session(OWNER).await.unwrap();
    let session = engine.get_session(&created.session_id, OWNER).await.unwrap();

    let err = engine
        .regenerate_last_message(&session.session_id, OWNER, "m1")
        .await
        .err()
        .expect("regenerate must fail");
    assert!(matches!(err, EngineError::NotFound(_)));
    assert_eq!(err.status(), 404);

    let err = engine
        .edit_last_message(&session.session_id, OWNER, 1, "x", "m1")
        .await
        .err()
        .expect("edit must fail");
    assert!(matches!(err, EngineError::NotFound(_)));

    assert_eq!(engine.get_session(&session.session_id, OWNER).await.unwrap(), session);
    assert!(backend.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_validation() {
    let Fixture { engine, .. } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    let err = engine.append_message(&id, OWNER, "  ", "m1").await.err().unwrap();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(err.body().status, 400);

    let err = engine.append_message(&id, OWNER, "hi", "nope").await.err().unwrap();
    assert!(matches!(err, EngineError::Validation(_)));

    send(&engine, &id, "one").await.1.unwrap();
    send(&engine, &id, "two").await.1.unwrap();

    let err = engine.edit_last_message(&id, OWNER, 1, "x", "m1").await.err().unwrap();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = engine.edit_last_message(&id, OWNER, 3, "x", "m1").await.err().unwrap();
    assert!(matches!(err, EngineError::NotFound(_)));

    assert!(engine.create_session("").await.is_err());
}

#[tokio::test]
async fn test_ownership() {
    let Fixture { engine, .. } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;
    send(&engine, &id, "secret").await.1.unwrap();

    let mallory = "mallory";
    assert!(matches!(
        engine.get_session(&id, mallory).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.list_messages(&id, mallory).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.append_message(&id, mallory, "hi", "m1").await.err(),
        Some(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete_last_message(&id, mallory).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete_session(&id, mallory).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.get_session("missing", OWNER).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.list_sessions(mallory).await.unwrap().is_empty());
    assert_eq!(engine.list_messages(&id, OWNER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_mutation_conflict() {
    let Fixture { engine, backend } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;
    let other = engine.create_session(OWNER).await.unwrap().session_id;

    let gate = Arc::new(Notify::new());
    backend.push(Script::fragments(&["partial"]).with_gate(gate.clone()));
    let mut stream = engine.append_message(&id, OWNER, "first", "m1").await.unwrap();
    assert_eq!(stream.next_fragment().await.as_deref(), Some("partial"));

    assert_eq!(
        engine.session_state(&id, OWNER).await.unwrap(),
        SessionState::Streaming
    );
    let err = engine.append_message(&id, OWNER, "second", "m1").await.err().unwrap();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(err.status(), 409);
    assert!(matches!(
        engine.delete_last_message(&id, OWNER).await,
        Err(EngineError::Conflict(_))
    ));

    // reads observe the pre-mutation state
    assert!(engine.list_messages(&id, OWNER).await.unwrap().is_empty());
    assert_eq!(engine.get_session(&id, OWNER).await.unwrap().title, None);

    // other sessions proceed in parallel
    send(&engine, &other, "elsewhere").await.1.unwrap();

    gate.notify_one();
    let (rest, commit) = stream.finish().await;
    assert!(rest.is_empty());
    assert_eq!(commit.unwrap().answer.as_deref(), Some("partial"));

    let (_, commit) = send(&engine, &id, "second").await;
    assert_eq!(commit.unwrap().message_idx, 2);
}

#[tokio::test]
async fn test_concurrent_appends_one_wins() {
    let Fixture { engine, backend } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    let gate = Arc::new(Notify::new());
    backend.push(Script::fragments(&["x"]).with_gate(gate.clone()));

    let (a, b) = tokio::join!(
        engine.append_message(&id, OWNER, "a", "m1"),
        engine.append_message(&id, OWNER, "b", "m1"),
    );
    let (winner, loser) = match (a, b) {
        (Ok(stream), Err(err)) | (Err(err), Ok(stream)) => (stream, err),
        _ => panic!("exactly one append must succeed"),
    };
    assert!(matches!(loser, EngineError::Conflict(_)));

    gate.notify_one();
    winner.finish().await.1.unwrap();
    let messages = engine.list_messages(&id, OWNER).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_idx, 1);
}

#[tokio::test]
async fn test_delete_session_mid_stream() {
    let Fixture { engine, backend } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    let gate = Arc::new(Notify::new());
    backend.push(Script::fragments(&["doomed"]).with_gate(gate.clone()));
    let mut stream = engine.append_message(&id, OWNER, "hello", "m1").await.unwrap();
    assert_eq!(stream.next_fragment().await.as_deref(), Some("doomed"));

    engine.delete_session(&id, OWNER).await.unwrap();
    gate.notify_one();

    let (rest, commit) = stream.finish().await;
    assert_eq!(rest.len(), 1);
    assert!(is_error_fragment(&rest[0]));
    assert!(matches!(commit, Err(EngineError::NotFound(_))));
    assert!(matches!(
        engine.get_session(&id, OWNER).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_disconnect_still_commits() {
    let Fixture { engine, backend } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    let gate = Arc::new(Notify::new());
    backend.push(Script::fragments(&["all ", "of ", "it"]).with_gate(gate.clone()));
    let mut stream = engine.append_message(&id, OWNER, "hello", "m1").await.unwrap();
    assert_eq!(stream.next_fragment().await.as_deref(), Some("all "));

    let commit = stream.into_commit();
    gate.notify_one();
    let committed = commit.wait().await.unwrap();
    assert_eq!(committed.answer.as_deref(), Some("all of it"));

    let stored = engine.list_messages(&id, OWNER).await.unwrap();
    assert_eq!(stored[0].answer.as_deref(), Some("all of it"));
}

#[tokio::test]
async fn test_context_overflow_is_synchronous() {
    let Fixture { engine, backend } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    let err = engine
        .append_message(&id, OWNER, "this will never fit", "tiny")
        .await
        .err()
        .expect("prompt must overflow");
    assert!(matches!(err, EngineError::ContextOverflow(_)));
    assert!(backend.prompts.lock().unwrap().is_empty());

    let session = engine.get_session(&id, OWNER).await.unwrap();
    assert_eq!(session.message_count, 0);
    assert_eq!(session.title, None);

    // the token was released
    send(&engine, &id, "fits").await.1.unwrap();
}

#[tokio::test]
async fn test_list_sessions_order() {
    let Fixture { engine, .. } = setup().await;
    let first = engine.create_session(OWNER).await.unwrap().session_id;
    let second = engine.create_session(OWNER).await.unwrap().session_id;
    engine.create_session("bob").await.unwrap();

    tokio::time::sleep(time::Duration::from_millis(5)).await;
    send(&engine, &first, "bump").await.1.unwrap();

    let sessions = engine.list_sessions(OWNER).await.unwrap();
    let ids = sessions.iter().map(|s| s.session_id.clone()).collect::<Vec<_>>();
    assert_eq!(ids, vec![first.clone(), second]);

    let found = engine
        .search_sessions(OWNER, FilterSession::default().with_title("bump"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].session_id, first);
}

#[tokio::test]
async fn test_message_idx_contiguous() {
    let Fixture { engine, .. } = setup().await;
    let id = engine.create_session(OWNER).await.unwrap().session_id;

    for content in ["a", "b", "c"] {
        send(&engine, &id, content).await.1.unwrap();
    }
    engine.delete_last_message(&id, OWNER).await.unwrap();
    send(&engine, &id, "d").await.1.unwrap();
    engine
        .edit_last_message(&id, OWNER, 3, "e", "m2")
        .await
        .unwrap()
        .finish()
        .await
        .1
        .unwrap();

    let messages = engine.list_messages(&id, OWNER).await.unwrap();
    let indices = messages.iter().map(|m| m.message_idx).collect::<Vec<_>>();
    assert_eq!(indices, vec![1, 2, 3]);
    let contents = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
    assert_eq!(contents, vec!["a", "b", "e"]);
    assert_eq!(
        engine.get_session(&id, OWNER).await.unwrap().title.as_deref(),
        Some("a")
    );
}

#[tokio::test]
async fn test_list_models() {
    let Fixture { engine, .. } = setup().await;
    let ids = engine
        .list_models()
        .iter()
        .map(|m| m.id.clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["m1", "m2", "tiny"]);
}
