//! Per-connection lifecycle: Anonymous → Authenticated → Closed.
//!
//! Each WebSocket connection gets one outbound queue and a writer
//! task, so a client always observes events in the order they were
//! queued. Login verifies the password hash, reconnect verifies a
//! token; both funnel through the presence registry's admit so only
//! one session per username can ever be live.

use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};

use crate::pipeline;
use crate::proto::{ClientEvent, RejectReason, ServerEvent};
use crate::server::SharedState;

/// Hash a password into PHC string format.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

/// Constant-shape verify: any parse or mismatch is just `false`.
pub fn verify_password(stored_hash: &str, supplied: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied.as_bytes(), &parsed)
        .is_ok()
}

/// Drive one WebSocket connection until it closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<SharedState>) {
    let (conn_id, mut outbox) = state.register_connection();
    tracing::debug!(conn_id, "New connection");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drains the outbound queue into the socket.
    let writer = tokio::spawn(async move {
        while let Some(line) = outbox.recv().await {
            if ws_tx.send(WsMessage::Text(line.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            // Pings are answered by axum; binary and pongs are ignored.
            Ok(_) => continue,
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => handle_event(&state, conn_id, event).await,
            Err(e) => {
                tracing::debug!(conn_id, "Unparseable client frame: {e}");
            }
        }
    }

    handle_disconnect(&state, conn_id);
    state.unregister_connection(conn_id);
    writer.abort();
    tracing::debug!(conn_id, "Connection closed");
}

/// Dispatch one client event.
pub async fn handle_event(state: &Arc<SharedState>, conn_id: u64, event: ClientEvent) {
    match event {
        ClientEvent::Login { username, password } => {
            handle_login(state, conn_id, &username, &password).await;
        }
        ClientEvent::ReconnectLogin { token } => {
            handle_reconnect(state, conn_id, &token);
        }
        ClientEvent::ChatMessage {
            token,
            text,
            image_url,
            quoted_message,
            mentions,
        } => {
            let result = pipeline::submit(
                state,
                &token,
                text.as_deref(),
                image_url.as_deref(),
                quoted_message.as_ref(),
                &mentions,
            );
            let reply = match result {
                Ok(_) => ServerEvent::send_ok(),
                Err(reason) => ServerEvent::send_err(reason),
            };
            state.send_to(conn_id, &reply);
        }
    }
}

/// Password login. Unknown user and wrong password produce the same
/// rejection so usernames cannot be enumerated.
pub async fn handle_login(state: &Arc<SharedState>, conn_id: u64, username: &str, password: &str) {
    let user = state.with_db(|db| db.find_user(username)).flatten();

    let verified = match user {
        Some(user) => {
            // Argon2 is deliberately slow; keep it off the runtime.
            let supplied = password.to_string();
            let verified = tokio::task::spawn_blocking(move || {
                verify_password(&user.password_hash, &supplied).then_some(user)
            })
            .await
            .ok()
            .flatten();
            verified
        }
        None => None,
    };

    let Some(user) = verified else {
        state.send_to(conn_id, &ServerEvent::login_err(RejectReason::BadCredentials));
        return;
    };

    if state.presence.admit(conn_id, &user.username, user.is_admin).is_err() {
        state.send_to(conn_id, &ServerEvent::login_err(RejectReason::AlreadyOnline));
        return;
    }

    let token = state.issuer.issue(&user.username, user.is_admin);
    state.send_to(
        conn_id,
        &ServerEvent::login_ok(user.username.clone(), user.is_admin, token),
    );
    tracing::info!("User {} logged in (admin: {})", user.username, user.is_admin);

    push_history(state, conn_id);
    state.broadcast(&ServerEvent::UserJoined {
        username: user.username,
    });
    state.broadcast_online_users();
}

/// Token-based reconnect. Deliberately no `user_joined` broadcast —
/// a reconnect is not a fresh join, though the online list is still
/// pushed to everyone.
pub fn handle_reconnect(state: &Arc<SharedState>, conn_id: u64, token: &str) {
    let claims = match state.issuer.verify(token) {
        Ok(claims) => claims,
        Err(_) => {
            state.send_to(
                conn_id,
                &ServerEvent::reconnect_err(RejectReason::InvalidCredential),
            );
            return;
        }
    };

    if state.presence.admit(conn_id, &claims.sub, claims.admin).is_err() {
        state.send_to(
            conn_id,
            &ServerEvent::reconnect_err(RejectReason::AlreadyOnline),
        );
        return;
    }

    state.send_to(
        conn_id,
        &ServerEvent::reconnect_ok(claims.sub.clone(), claims.admin),
    );
    tracing::info!("User {} reconnected (admin: {})", claims.sub, claims.admin);

    push_history(state, conn_id);
    state.broadcast_online_users();
}

/// Terminal: evict from the registry and announce the departure.
pub fn handle_disconnect(state: &Arc<SharedState>, conn_id: u64) {
    if let Some(username) = state.presence.evict(conn_id) {
        tracing::info!("User {username} disconnected");
        state.broadcast(&ServerEvent::UserLeft { username });
        state.broadcast_online_users();
    }
}

/// Push recent history (oldest first) to one connection only.
fn push_history(state: &SharedState, conn_id: u64) {
    let limit = state.config.history_limit;
    if let Some(messages) = state.with_db(|db| db.recent_messages(limit)) {
        state.send_to(conn_id, &ServerEvent::HistoryMessages { messages });
    }
}
