//! Session persistence across process restarts

use kiln_store::{DEFAULT_SESSION_TITLE, SessionManager, Store};
use kiln_types::{Message, Role, TokenUsage, ToolCall, ToolResult};
use tempfile::TempDir;

#[test]
fn conversation_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("kiln.db");

    let session_id = {
        let mut sessions = SessionManager::new(Store::open(&db_path).unwrap());
        let session = sessions.current().unwrap();
        assert_eq!(session.title, DEFAULT_SESSION_TITLE);

        let id = session.id.clone();
        sessions
            .add_message(&Message::user(id.clone(), "what is in here?"))
            .unwrap();
        sessions
            .add_message(
                &Message::assistant(
                    id.clone(),
                    "",
                    vec![ToolCall::new("call_1", "ls", "{}")],
                )
                .with_usage(TokenUsage::new(100, 20)),
            )
            .unwrap();
        sessions
            .add_message(&Message::tool_turn(
                id.clone(),
                vec![ToolResult::success("call_1", "ls", "Cargo.toml\nsrc/")],
            ))
            .unwrap();
        sessions
            .add_message(
                &Message::assistant(id.clone(), "A Rust crate.", Vec::new())
                    .with_usage(TokenUsage::new(150, 10)),
            )
            .unwrap();
        id
    };

    let mut sessions = SessionManager::new(Store::open(&db_path).unwrap());
    let listed = sessions.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, session_id);

    sessions.switch(&session_id).unwrap();
    let messages = sessions.messages().unwrap();
    let roles: Vec<Role> = messages.iter().map(Message::role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(messages[1].tool_calls()[0].name, "ls");
    assert_eq!(messages[2].tool_results()[0].output, "Cargo.toml\nsrc/");
    assert_eq!(messages[3].content(), "A Rust crate.");
    assert_eq!(sessions.message_count().unwrap(), 4);
    assert_eq!(sessions.token_total().unwrap(), 280);
}

#[test]
fn deleting_current_session_clears_selection() {
    let dir = TempDir::new().unwrap();
    let mut sessions = SessionManager::new(Store::open(dir.path().join("kiln.db")).unwrap());

    let first = sessions.create("first").unwrap();
    sessions
        .add_message(&Message::user(first.id.clone(), "hello"))
        .unwrap();
    sessions.delete(&first.id).unwrap();

    assert!(sessions.current_id().is_none());
    assert!(sessions.messages().unwrap().is_empty());
    assert!(sessions.list().unwrap().is_empty());
}
