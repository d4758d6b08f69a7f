//! Message submission pipeline.
//!
//! Order matters and any failure short-circuits with its stated
//! reason: credential, presence, mute, content validation, plugin
//! interceptors, then persist + broadcast. The speech record is a
//! best-effort side effect — its failure never blocks delivery.

use chrono::Utc;

use crate::db::MessageRow;
use crate::plugin::ChatSubmission;
use crate::proto::{QuotedMessage, RejectReason, ServerEvent};
use crate::server::SharedState;

/// Submit a chat message on behalf of whoever the token verifies as.
///
/// `Ok(Some(row))` means the message was persisted and broadcast;
/// `Ok(None)` means a plugin claimed it (the plugin owns any side
/// effects, and nothing was persisted or broadcast here).
pub fn submit(
    state: &SharedState,
    token: &str,
    text: Option<&str>,
    image_url: Option<&str>,
    quoted_message: Option<&QuotedMessage>,
    mentions: &[String],
) -> Result<Option<MessageRow>, RejectReason> {
    // Expired and malformed tokens are indistinguishable to callers.
    let claims = state
        .issuer
        .verify(token)
        .map_err(|_| RejectReason::InvalidCredential)?;
    let username = claims.sub;

    // A credential can outlive its socket's registry entry; a sender
    // with no live session is rejected, not silently readmitted.
    if !state.presence.is_online(&username) {
        return Err(RejectReason::NotOnline);
    }

    // Distinct reason so clients can react without forcing a re-login.
    if state.is_muted(&username) {
        return Err(RejectReason::Muted);
    }

    let text = text.filter(|t| !t.is_empty());
    let image_url = image_url.filter(|u| !u.is_empty());
    if text.is_none() && image_url.is_none() {
        return Err(RejectReason::EmptyMessage);
    }

    let submission = ChatSubmission {
        username: username.clone(),
        text: text.map(str::to_string),
        image_url: image_url.map(str::to_string),
        quoted_message: quoted_message.cloned(),
        mentions: mentions.to_vec(),
    };
    if state.plugins.dispatch(&submission, state) {
        return Ok(None);
    }

    let now = Utc::now().timestamp();

    // Best-effort: with_db already logged any failure.
    let _ = state.with_db(|db| db.record_speech(&username, now));

    let row = state
        .with_db(|db| db.insert_message(&username, text, image_url, quoted_message, mentions, now))
        .ok_or(RejectReason::Storage)?;

    state.broadcast(&ServerEvent::ChatMessage {
        username: row.username.clone(),
        message: row.message.clone(),
        image_url: row.image_url.clone(),
        timestamp: row.timestamp,
        quoted_message: row.quoted_message.clone(),
        mentions: row.mentions.clone(),
    });
    tracing::info!("[{}]: {}", row.username, row.message.as_deref().unwrap_or("[image]"));
    Ok(Some(row))
}
