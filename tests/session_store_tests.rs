//! Integration coverage for the Session Store: save/load round-tripping,
//! checkpoint rollback, branching, and guarded deletion.

use penguin::penguin::message::{Category, Message, Role};
use penguin::penguin::session::{CheckpointType, Session, SessionStore};

#[test]
fn save_then_load_round_trips_a_session_with_several_messages() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path()).unwrap();

    let mut session = Session::new("agent-1");
    session.append(Message::new(Role::System, "you are helpful", Category::System, "agent-1"));
    session.append(Message::new(Role::User, "hello", Category::Dialog, "agent-1"));
    session.append(Message::new(Role::Assistant, "hi there", Category::Dialog, "agent-1"));
    store.save(&session).unwrap();

    let loaded = store.load(&session.id).unwrap();
    assert_eq!(loaded.id, session.id);
    assert_eq!(loaded.messages.len(), 3);
    assert_eq!(loaded.messages[1].as_text(), "hello");
}

#[test]
fn checkpoint_then_mutate_then_rollback_restores_the_checkpointed_state() {
    let mut session = Session::new("agent-1");
    for i in 0..5 {
        session.append(Message::new(Role::User, format!("msg-{i}"), Category::Dialog, "agent-1"));
    }
    let cp = session.create_checkpoint(CheckpointType::Manual, Some("cp1".into()));
    let state_at_checkpoint: Vec<String> = session.messages.iter().map(Message::as_text).collect();

    session.append(Message::new(Role::User, "msg-5", Category::Dialog, "agent-1"));
    session.append(Message::new(Role::User, "msg-6", Category::Dialog, "agent-1"));
    assert_eq!(session.messages.len(), 7);

    assert!(session.rollback_to_checkpoint(&cp));
    let state_after_rollback: Vec<String> = session.messages.iter().map(Message::as_text).collect();
    assert_eq!(state_after_rollback, state_at_checkpoint);
}

#[test]
fn branch_from_checkpoint_has_exactly_the_first_k_messages_and_diverges_independently() {
    let mut original = Session::new("agent-1");
    for i in 0..5 {
        original.append(Message::new(Role::User, format!("msg-{i}"), Category::Dialog, "agent-1"));
    }
    let cp = original.create_checkpoint(CheckpointType::Manual, Some("cp1".into()));
    original.append(Message::new(Role::User, "original-only", Category::Dialog, "agent-1"));

    let mut branch = original.branch_from_checkpoint(&cp).unwrap();
    assert_eq!(branch.messages.len(), 5);
    assert_eq!(branch.parent_session_id.as_deref(), Some(original.id.as_str()));

    branch.append(Message::new(Role::User, "branch-only", Category::Dialog, "agent-1"));

    assert_ne!(
        original.messages.last().unwrap().as_text(),
        branch.messages.last().unwrap().as_text()
    );
    assert_eq!(original.messages.len(), 6);
    assert_eq!(branch.messages.len(), 6);
}

#[test]
fn loading_falls_back_to_the_backup_copy_when_the_primary_file_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path()).unwrap();

    let mut session = Session::new("agent-1");
    session.append(Message::new(Role::User, "first save", Category::Dialog, "agent-1"));
    store.save(&session).unwrap();

    // A second save creates the `.bak` backup of the first save's contents.
    session.append(Message::new(Role::User, "second save", Category::Dialog, "agent-1"));
    store.save(&session).unwrap();

    let primary_path = dir.path().join(format!("{}.jsonl.json", session.id));
    std::fs::remove_file(&primary_path).unwrap();

    let loaded = store.load(&session.id).unwrap();
    assert_eq!(loaded.messages.len(), 1);
}

#[test]
fn delete_without_force_refuses_a_session_with_dependents_but_force_overrides_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path()).unwrap();

    let parent = Session::new("agent-1");
    store.save(&parent).unwrap();

    let mut child = Session::new("agent-1");
    child.parent_session_id = Some(parent.id.clone());
    store.save(&child).unwrap();

    let refused = store.delete_session(&parent.id, false);
    assert!(refused.is_err());

    store.delete_session(&parent.id, true).unwrap();
    assert!(store.load(&parent.id).is_err());
}
