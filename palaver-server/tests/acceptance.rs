//! End-to-end acceptance tests driven through the public API:
//! invitation-gated registration, login, broadcast, moderation, and
//! the single-session and bounded-invitation properties.

use std::sync::Arc;

use palaver_server::config::ServerConfig;
use palaver_server::connection::{self, hash_password};
use palaver_server::db::RegisterOutcome;
use palaver_server::plugin::PluginManager;
use palaver_server::proto::{ClientEvent, ServerEvent};
use palaver_server::server::{ModerationError, SharedState};
use tokio::sync::mpsc;

/// A fake connected client: an outbound queue registered with the
/// server, read synchronously.
struct TestClient {
    conn_id: u64,
    rx: mpsc::Receiver<String>,
}

impl TestClient {
    fn connect(state: &Arc<SharedState>) -> Self {
        let (conn_id, rx) = state.register_connection();
        Self { conn_id, rx }
    }

    fn next(&mut self) -> ServerEvent {
        let line = self.rx.try_recv().expect("expected a queued event");
        serde_json::from_str(&line).expect("server event parses")
    }

    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

fn test_state() -> Arc<SharedState> {
    SharedState::new(ServerConfig::default(), PluginManager::empty()).unwrap()
}

#[tokio::test]
async fn full_scenario_register_login_chat_mute() {
    let state = test_state();

    // Admin creates a single-use invitation code.
    state
        .with_db(|db| db.create_invitation_code("INVITE1", 1))
        .unwrap();

    // First registration succeeds, second finds the code exhausted.
    let hash = hash_password("pw").unwrap();
    assert!(matches!(
        state
            .with_db(|db| db.register_user("newbie", &hash, "INVITE1"))
            .unwrap(),
        RegisterOutcome::Registered(_)
    ));
    assert_eq!(
        state
            .with_db(|db| db.register_user("other", &hash, "INVITE1"))
            .unwrap(),
        RegisterOutcome::InvalidCode
    );

    // Login yields a token.
    let mut client = TestClient::connect(&state);
    let mut observer = TestClient::connect(&state);
    connection::handle_login(&state, client.conn_id, "newbie", "pw").await;
    let token = match client.next() {
        ServerEvent::LoginResult {
            success: true,
            token,
            ..
        } => token.unwrap(),
        other => panic!("login failed: {other:?}"),
    };
    client.drain();
    observer.drain();

    // "hello" is broadcast to everyone with a server timestamp.
    connection::handle_event(
        &state,
        client.conn_id,
        ClientEvent::ChatMessage {
            token: token.clone(),
            text: Some("hello".into()),
            image_url: None,
            quoted_message: None,
            mentions: Vec::new(),
        },
    )
    .await;
    match observer.next() {
        ServerEvent::ChatMessage {
            username,
            message,
            timestamp,
            ..
        } => {
            assert_eq!(username, "newbie");
            assert_eq!(message.as_deref(), Some("hello"));
            assert!(timestamp > 0);
        }
        other => panic!("expected chat broadcast, got {other:?}"),
    }
    assert!(matches!(
        client.next(),
        ServerEvent::ChatMessage { .. } | ServerEvent::SendResult { success: true, .. }
    ));
    client.drain();

    // Admin mutes the user; everyone hears about it.
    state.set_muted("newbie", true).unwrap();
    assert!(matches!(
        observer.next(),
        ServerEvent::UserMutedStatus { username, is_muted: true } if username == "newbie"
    ));

    // The next send is rejected with the mute-specific reason and is
    // neither persisted nor broadcast.
    let before = state.with_db(|db| db.recent_messages(50)).unwrap().len();
    client.drain();
    connection::handle_event(
        &state,
        client.conn_id,
        ClientEvent::ChatMessage {
            token,
            text: Some("again".into()),
            image_url: None,
            quoted_message: None,
            mentions: Vec::new(),
        },
    )
    .await;
    let reply = serde_json::to_value(client.next()).unwrap();
    assert_eq!(reply["type"], "send_result");
    assert_eq!(reply["success"], false);
    assert_eq!(reply["reason"], "muted");
    assert_eq!(
        state.with_db(|db| db.recent_messages(50)).unwrap().len(),
        before
    );
}

#[tokio::test]
async fn at_most_one_session_per_username_under_racing_reconnects() {
    let state = test_state();
    let token = state.issuer.issue("alice", false);

    let mut clients: Vec<TestClient> = (0..16).map(|_| TestClient::connect(&state)).collect();
    let mut handles = Vec::new();
    for client in &clients {
        let state = Arc::clone(&state);
        let token = token.clone();
        let conn_id = client.conn_id;
        handles.push(std::thread::spawn(move || {
            connection::handle_reconnect(&state, conn_id, &token);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Broadcasts from the winner may interleave with each loser's own
    // reply, so scan every queued event rather than assuming order.
    let mut successes = 0;
    for client in &mut clients {
        while let Ok(line) = client.rx.try_recv() {
            if let Ok(ServerEvent::ReconnectResult { success: true, .. }) =
                serde_json::from_str(&line)
            {
                successes += 1;
            }
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(state.presence.list_online(), vec!["alice".to_string()]);
}

#[test]
fn invitation_code_admits_exactly_k_of_n_racing_registrations() {
    let state = test_state();
    state
        .with_db(|db| db.create_invitation_code("LIMITED", 3))
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let state = Arc::clone(&state);
        handles.push(std::thread::spawn(move || {
            state
                .with_db(|db| db.register_user(&format!("user{i}"), "h", "LIMITED"))
                .unwrap()
        }));
    }
    let outcomes: Vec<RegisterOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let registered = outcomes
        .iter()
        .filter(|o| matches!(o, RegisterOutcome::Registered(_)))
        .count();
    let rejected = outcomes
        .iter()
        .filter(|o| matches!(o, RegisterOutcome::InvalidCode))
        .count();
    assert_eq!(registered, 3);
    assert_eq!(rejected, 7);

    let code = state
        .with_db(|db| db.find_invitation_code("LIMITED"))
        .flatten()
        .unwrap();
    assert_eq!(code.current_uses, 3);
}

#[tokio::test]
async fn credential_expiry_is_honored_independent_of_the_socket() {
    let config = ServerConfig {
        token_ttl_secs: -1, // already expired at issuance
        ..Default::default()
    };
    let state = SharedState::new(config, PluginManager::empty()).unwrap();
    let hash = hash_password("pw").unwrap();
    state
        .with_db(|db| db.create_user("alice", &hash, false))
        .unwrap();

    let mut client = TestClient::connect(&state);
    connection::handle_login(&state, client.conn_id, "alice", "pw").await;
    let token = match client.next() {
        ServerEvent::LoginResult {
            success: true,
            token,
            ..
        } => token.unwrap(),
        other => panic!("login failed: {other:?}"),
    };
    client.drain();

    // The socket is still connected and the session live, but the
    // credential has expired: the send must be rejected.
    connection::handle_event(
        &state,
        client.conn_id,
        ClientEvent::ChatMessage {
            token,
            text: Some("too late".into()),
            image_url: None,
            quoted_message: None,
            mentions: Vec::new(),
        },
    )
    .await;
    let reply = serde_json::to_value(client.next()).unwrap();
    assert_eq!(reply["success"], false);
    assert_eq!(reply["reason"], "invalid_credential");
}

#[test]
fn root_admin_guard_holds() {
    let state = test_state();
    assert_eq!(
        state.set_admin("admin", false),
        Err(ModerationError::Forbidden)
    );
    assert_eq!(state.set_admin("admin", true), Ok(()));
}
