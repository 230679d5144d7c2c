use std::sync::Arc;

use chrono::TimeZone;

use super::*;
use crate::models::{MessageStatus, Role};
use crate::retrieval::{MockRetriever, NoopRetriever};

fn context(keep_recent_turns: usize) -> ContextConfig {
    ContextConfig {
        keep_recent_turns,
        passage_max_chars: 20,
        ..Default::default()
    }
}

fn history(n: usize) -> Vec<Message> {
    (1..=n)
        .map(|i| {
            Message::new(i, format!("question {}", i), "m1").with_answer(format!("answer {}", i))
        })
        .collect()
}

fn texts(prompt: &BackendPrompt) -> Vec<(Role, String)> {
    prompt
        .segments()
        .iter()
        .map(|s| (s.role(), s.text().to_string()))
        .collect()
}

fn request<'a>(history: &'a [Message], content: &'a str, budget: usize) -> PromptRequest<'a> {
    PromptRequest {
        model_id: "m1",
        history,
        content,
        budget,
        retrieval: true,
    }
}

#[test]
fn test_render_system_prompt() {
    let now = Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
    assert_eq!(
        render_system_prompt("Now: {current_time}.", now),
        "Now: 2024-05-01 09:30:00."
    );
    assert_eq!(render_system_prompt("static", now), "static");
}

#[test]
fn test_render_passage() {
    let passage = Passage::new("  가나다라마바사아자차카타파하 and more text  ", 0.87654);
    assert_eq!(
        render_passage(2, &passage, 14),
        "[Document 2] (similarity: 0.877)\n가나다라마바사아자차카타파하"
    );
    assert_eq!(
        render_passage(1, &Passage::new("short", 0.5), 500),
        "[Document 1] (similarity: 0.500)\nshort"
    );
}

#[tokio::test]
async fn test_assemble_order() {
    let mut retriever = MockRetriever::new();
    retriever
        .expect_retrieve()
        .withf(|query| query.to_string() == "new question")
        .times(1)
        .returning(|_| {
            Ok(vec![
                Passage::new("best passage", 0.9),
                Passage::new("other passage", 0.4),
            ])
        });

    let assembler = Assembler::new(Arc::new(retriever), "SYSTEM", &context(4));
    let history = history(2);
    let prompt = assembler
        .assemble(request(&history, "new question", 10_000))
        .await
        .expect("Failed to assemble");

    assert_eq!(prompt.model(), "m1");
    assert_eq!(
        texts(&prompt),
        vec![
            (Role::System, "SYSTEM".to_string()),
            (
                Role::Reference,
                "[Document 1] (similarity: 0.900)\nbest passage".to_string()
            ),
            (
                Role::Reference,
                "[Document 2] (similarity: 0.400)\nother passage".to_string()
            ),
            (Role::User, "question 1".to_string()),
            (Role::Assistant, "answer 1".to_string()),
            (Role::User, "question 2".to_string()),
            (Role::Assistant, "answer 2".to_string()),
            (Role::User, "new question".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_assemble_without_retrieval() {
    let mut retriever = MockRetriever::new();
    retriever.expect_retrieve().never();

    let assembler = Assembler::new(Arc::new(retriever), "SYSTEM", &context(4));
    let prompt = assembler
        .assemble(PromptRequest {
            retrieval: false,
            ..request(&[], "hi", 10_000)
        })
        .await
        .expect("Failed to assemble");
    assert_eq!(prompt.segments().len(), 2);
}

#[tokio::test]
async fn test_assemble_retrieval_failure() {
    let mut retriever = MockRetriever::new();
    retriever
        .expect_retrieve()
        .returning(|_| Err(eyre::eyre!("vector store down")));

    let assembler = Assembler::new(Arc::new(retriever), "SYSTEM", &context(4));
    let prompt = assembler
        .assemble(request(&[], "hi", 10_000))
        .await
        .expect("Failed to assemble");
    assert!(prompt.segments().iter().all(|s| s.role() != Role::Reference));
}

#[test]
fn test_failed_turns_excluded() {
    let assembler = Assembler::new(Arc::new(NoopRetriever), "SYSTEM", &context(4));
    let mut history = history(2);
    history[1] = Message::new(2, "question 2", "m1")
        .with_answer("Sorry")
        .with_status(MessageStatus::Failed);

    let prompt = assembler
        .build(&request(&history, "q3", 10_000), &[], Local::now())
        .expect("Failed to build");
    let users = prompt
        .segments()
        .iter()
        .filter(|s| s.role() == Role::User)
        .map(|s| s.text().to_string())
        .collect::<Vec<_>>();
    assert_eq!(users, vec!["question 1", "q3"]);
}

#[test]
fn test_truncate_passages_before_history() {
    let assembler = Assembler::new(Arc::new(NoopRetriever), "S", &context(1));
    let history = history(2);
    let passages = vec![Passage::new("aaaa", 0.9), Passage::new("bbbb", 0.8)];

    // S(1) + turns(10+8 + 10+8) + new(2) = 39, first passage adds 37
    let prompt = assembler
        .build(&request(&history, "q3", 76), &passages, Local::now())
        .expect("Failed to build");
    let refs = prompt
        .segments()
        .iter()
        .filter(|s| s.role() == Role::Reference)
        .count();
    assert_eq!(refs, 1);
    assert_eq!(prompt.size(), 76);

    let prompt = assembler
        .build(&request(&history, "q3", 39), &passages, Local::now())
        .expect("Failed to build");
    assert_eq!(prompt.segments().len(), 6);
}

#[test]
fn test_truncate_oldest_history() {
    let assembler = Assembler::new(Arc::new(NoopRetriever), "S", &context(1));
    let history = history(3);

    let prompt = assembler
        .build(&request(&history, "q4", 21), &[], Local::now())
        .expect("Failed to build");
    assert_eq!(
        texts(&prompt),
        vec![
            (Role::System, "S".to_string()),
            (Role::User, "question 3".to_string()),
            (Role::Assistant, "answer 3".to_string()),
            (Role::User, "q4".to_string()),
        ]
    );
}

#[test]
fn test_context_overflow() {
    let assembler = Assembler::new(Arc::new(NoopRetriever), "S", &context(2));
    let history = history(3);

    // the two most recent turns alone need 1 + 36 + 2 characters
    let err = assembler
        .build(&request(&history, "q4", 38), &[], Local::now())
        .expect_err("prompt must not fit");
    assert!(matches!(err, EngineError::ContextOverflow(_)));
    assert_eq!(err.status(), 413);
}
