//! Palaver: an invitation-gated group chat server.
//!
//! Authenticated users exchange text/image messages broadcast to all
//! connected clients, with moderation (mute/unmute, admin roles),
//! invitation-gated registration, message history, a speech-count
//! leaderboard, and a plugin hook that can intercept outgoing
//! messages.

pub mod blobs;
pub mod config;
pub mod connection;
pub mod db;
pub mod pipeline;
pub mod plugin;
pub mod presence;
pub mod proto;
pub mod server;
pub mod sweep;
pub mod token;
pub mod web;
