use super::*;
use crate::models::MessageStatus;

#[test]
fn test_derive_title() {
    assert_eq!(derive_title("My dog keeps sneezing", 50), "My dog keeps sneezing");
    assert_eq!(derive_title("  padded  ", 50), "padded");

    let long = "a".repeat(60);
    let title = derive_title(&long, 50);
    assert_eq!(title, format!("{}...", "a".repeat(50)));

    // counts characters, not bytes
    let title = derive_title("강아지가 갑자기 토하고 설사를 해요", 8);
    assert_eq!(title, "강아지가 갑자기...");
}

#[test]
fn test_next_timestamp_is_strictly_increasing() {
    let future = Utc::now() + Duration::seconds(10);
    let next = next_timestamp(future);
    assert_eq!(next, future + Duration::milliseconds(1));

    let past = Utc::now() - Duration::seconds(10);
    let next = next_timestamp(past);
    assert!(next > past + Duration::milliseconds(1));
}

#[test]
fn test_messages_sorted_by_index() {
    let session = Session::new("alice").with_messages(vec![
        Message::new(2, "second", "m1").with_answer("b"),
        Message::new(1, "first", "m1").with_answer("a"),
    ]);

    assert_eq!(session.len(), 2);
    assert_eq!(session.messages()[0].content(), "first");
    assert_eq!(session.last_message().map(|m| m.message_idx()), Some(2));
    assert_eq!(session.next_message_idx(), 3);
}

#[test]
fn test_committed_state() {
    let session = Session::new("alice");
    assert_eq!(session.committed_state(), SessionState::Empty);
    assert_eq!(session.next_message_idx(), 1);

    let session = session.with_messages(vec![Message::new(1, "hi", "m1").with_answer("hello")]);
    assert_eq!(session.committed_state(), SessionState::Committed);

    let session = session.with_messages(vec![
        Message::new(1, "hi", "m1").with_answer("hello"),
        Message::new(2, "again", "m1")
            .with_answer("sorry")
            .with_status(MessageStatus::Failed),
    ]);
    assert_eq!(session.committed_state(), SessionState::CommittedWithError);
}

#[test]
fn test_ownership() {
    let session = Session::new("alice");
    assert!(session.is_owned_by("alice"));
    assert!(!session.is_owned_by("bob"));
    assert!(session.title().is_none());
}
