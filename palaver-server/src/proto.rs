//! Wire protocol: JSON events exchanged over the WebSocket transport.
//!
//! Every frame is one internally-tagged JSON object. Clients send
//! [`ClientEvent`]s; the server pushes [`ServerEvent`]s. Request-style
//! events (`login`, `reconnect_login`, `chat_message`) always get a
//! matching `*_result` event with a success flag and, on failure, a
//! stable machine-checkable [`RejectReason`] plus a human-readable
//! message.

use serde::{Deserialize, Serialize};

use crate::db::MessageRow;

/// A quoted message embedded in a chat message.
///
/// This is a value snapshot captured at quote time, not a reference:
/// deleting or purging the original message never changes the quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedMessage {
    pub username: String,
    pub text: String,
}

/// Events a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Login {
        username: String,
        password: String,
    },
    ReconnectLogin {
        token: String,
    },
    ChatMessage {
        token: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        image_url: Option<String>,
        #[serde(default)]
        quoted_message: Option<QuotedMessage>,
        #[serde(default)]
        mentions: Vec<String>,
    },
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    LoginResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_admin: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ReconnectResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_admin: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SendResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Recent history, oldest first, pushed to one connection after login.
    HistoryMessages {
        messages: Vec<MessageRow>,
    },
    /// A chat message broadcast to everyone, fully denormalized.
    ChatMessage {
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        quoted_message: Option<QuotedMessage>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        mentions: Vec<String>,
    },
    UserJoined {
        username: String,
    },
    UserLeft {
        username: String,
    },
    /// Full snapshot of the online-username set.
    OnlineUsers {
        usernames: Vec<String>,
    },
    UserMutedStatus {
        username: String,
        is_muted: bool,
    },
    UserAdminStatus {
        username: String,
        is_admin: bool,
    },
}

impl ServerEvent {
    pub fn login_ok(username: String, is_admin: bool, token: String) -> Self {
        Self::LoginResult {
            success: true,
            username: Some(username),
            is_admin: Some(is_admin),
            token: Some(token),
            reason: None,
            message: None,
        }
    }

    pub fn login_err(reason: RejectReason) -> Self {
        Self::LoginResult {
            success: false,
            username: None,
            is_admin: None,
            token: None,
            message: Some(reason.to_string()),
            reason: Some(reason),
        }
    }

    pub fn reconnect_ok(username: String, is_admin: bool) -> Self {
        Self::ReconnectResult {
            success: true,
            username: Some(username),
            is_admin: Some(is_admin),
            reason: None,
            message: None,
        }
    }

    pub fn reconnect_err(reason: RejectReason) -> Self {
        Self::ReconnectResult {
            success: false,
            username: None,
            is_admin: None,
            message: Some(reason.to_string()),
            reason: Some(reason),
        }
    }

    pub fn send_ok() -> Self {
        Self::SendResult {
            success: true,
            reason: None,
            message: None,
        }
    }

    pub fn send_err(reason: RejectReason) -> Self {
        Self::SendResult {
            success: false,
            message: Some(reason.to_string()),
            reason: Some(reason),
        }
    }
}

/// Stable rejection codes surfaced to clients.
///
/// Clients decide from the code whether to force a re-login: only
/// credential-related codes (`bad_credentials`, `invalid_credential`)
/// warrant that; a `muted` rejection must not trigger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Unknown username or wrong password — deliberately the same code
    /// for both so usernames cannot be enumerated.
    #[error("invalid username or password")]
    BadCredentials,
    #[error("user is already online")]
    AlreadyOnline,
    /// Malformed or expired token — deliberately the same code for both.
    #[error("invalid or expired token")]
    InvalidCredential,
    #[error("user is not online")]
    NotOnline,
    #[error("you are muted and cannot send messages")]
    Muted,
    #[error("message must contain text or an image")]
    EmptyMessage,
    #[error("failed to send message")]
    Storage,
}

impl RejectReason {
    /// The wire code, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadCredentials => "bad_credentials",
            Self::AlreadyOnline => "already_online",
            Self::InvalidCredential => "invalid_credential",
            Self::NotOnline => "not_online",
            Self::Muted => "muted",
            Self::EmptyMessage => "empty_message",
            Self::Storage => "storage",
        }
    }
}
