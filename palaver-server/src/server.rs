//! Shared server state: presence, connections, store handle,
//! credential issuer, plugin manager, and the moderation gate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::blobs::BlobStore;
use crate::config::ServerConfig;
use crate::db::Db;
use crate::plugin::{Bus, PluginHost, PluginManager};
use crate::presence::PresenceRegistry;
use crate::proto::{QuotedMessage, ServerEvent};
use crate::token::CredentialIssuer;

/// Per-connection outbound queue depth. One sender per connection
/// keeps delivery FIFO from that connection's perspective.
const OUTBOX_CAPACITY: usize = 64;

/// Errors from admin-only moderation mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ModerationError {
    #[error("user not found")]
    NotFound,
    #[error("the root admin cannot be demoted")]
    Forbidden,
    #[error("storage failure")]
    Storage,
}

/// State shared by every connection handler and HTTP endpoint.
pub struct SharedState {
    pub config: ServerConfig,
    pub db: StdMutex<Db>,
    pub issuer: CredentialIssuer,
    pub presence: PresenceRegistry,
    pub plugins: PluginManager,
    pub blobs: BlobStore,
    /// conn_id -> sender feeding that connection's writer task.
    connections: parking_lot::Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_conn_id: AtomicU64,
}

impl SharedState {
    /// Build state, opening the database, bootstrapping the root
    /// admin, and loading plugins.
    pub fn new(config: ServerConfig, plugins: PluginManager) -> Result<Arc<Self>> {
        let db = match &config.db_path {
            Some(path) => {
                tracing::info!("Opening database: {path}");
                Db::open(path).context("failed to open database")?
            }
            None => Db::open_memory().context("failed to open in-memory database")?,
        };

        let issuer = match &config.token_secret {
            Some(secret) => CredentialIssuer::new(secret.as_bytes().to_vec(), config.token_ttl_secs),
            None => {
                tracing::warn!("No token secret configured; tokens will not survive a restart");
                CredentialIssuer::ephemeral(config.token_ttl_secs)
            }
        };

        let blobs = BlobStore::open(&config.uploads_dir).context("failed to open uploads dir")?;

        let state = Arc::new(Self {
            db: StdMutex::new(db),
            issuer,
            presence: PresenceRegistry::new(),
            plugins,
            blobs,
            connections: parking_lot::Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            config,
        });

        state.bootstrap_root_admin()?;
        state.plugins.load(&*state);
        Ok(state)
    }

    /// Create the configured root admin if it does not exist yet.
    fn bootstrap_root_admin(&self) -> Result<()> {
        let username = self.config.admin_username.clone();
        let exists = self
            .with_db(|db| db.find_user(&username))
            .flatten()
            .is_some();
        if exists {
            return Ok(());
        }
        let hash = crate::connection::hash_password(&self.config.admin_password)
            .context("failed to hash root admin password")?;
        match self.db.lock().unwrap().create_user(&username, &hash, true) {
            Ok(_) => {
                tracing::info!("Created root admin account {username}");
                Ok(())
            }
            // Lost a race with another process on the same database.
            Err(ref e) if crate::db::is_unique_violation(e) => Ok(()),
            Err(e) => Err(e).context("failed to create root admin"),
        }
    }

    /// Run a closure with the database. Logs errors but does not
    /// propagate them — persistence failures during side effects must
    /// not take down the chat server.
    pub fn with_db<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock().unwrap();
        match f(&db) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::error!("Database error: {e}");
                None
            }
        }
    }

    // ── Connection plumbing ────────────────────────────────────────

    /// Register a new connection's outbound queue, returning its id.
    pub fn register_connection(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(conn_id, tx);
        (conn_id, rx)
    }

    pub fn unregister_connection(&self, conn_id: u64) {
        self.connections.lock().remove(&conn_id);
    }

    /// Queue an event for one connection. Best-effort: a full or gone
    /// queue drops the frame.
    pub fn send_to(&self, conn_id: u64, event: &ServerEvent) {
        if let Ok(line) = serde_json::to_string(event)
            && let Some(tx) = self.connections.lock().get(&conn_id)
        {
            let _ = tx.try_send(line);
        }
    }

    /// Broadcast an event to every connection, authenticated or not.
    /// Fire-and-forget; per-connection order is preserved by the
    /// per-connection queue.
    pub fn broadcast(&self, event: &ServerEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize broadcast event: {e}");
                return;
            }
        };
        for tx in self.connections.lock().values() {
            let _ = tx.try_send(line.clone());
        }
    }

    pub fn broadcast_online_users(&self) {
        self.broadcast(&ServerEvent::OnlineUsers {
            usernames: self.presence.list_online(),
        });
    }

    // ── Moderation gate ────────────────────────────────────────────

    pub fn is_muted(&self, username: &str) -> bool {
        self.with_db(|db| db.is_muted(username)).unwrap_or(false)
    }

    /// Mute or unmute a user and broadcast the status change.
    pub fn set_muted(&self, username: &str, muted: bool) -> Result<(), ModerationError> {
        let user = self
            .with_db(|db| db.find_user(username))
            .ok_or(ModerationError::Storage)?;
        if user.is_none() {
            return Err(ModerationError::NotFound);
        }
        self.with_db(|db| db.set_muted(username, muted))
            .ok_or(ModerationError::Storage)?;
        self.broadcast(&ServerEvent::UserMutedStatus {
            username: username.to_string(),
            is_muted: muted,
        });
        Ok(())
    }

    /// Change a user's admin flag and broadcast it. The root admin can
    /// never be demoted; re-granting it admin is a no-op success.
    pub fn set_admin(&self, username: &str, is_admin: bool) -> Result<(), ModerationError> {
        if username == self.config.admin_username {
            if is_admin {
                return Ok(());
            }
            return Err(ModerationError::Forbidden);
        }
        let changed = self
            .with_db(|db| db.set_admin_flag(username, is_admin))
            .ok_or(ModerationError::Storage)?;
        if !changed {
            return Err(ModerationError::NotFound);
        }
        self.broadcast(&ServerEvent::UserAdminStatus {
            username: username.to_string(),
            is_admin,
        });
        Ok(())
    }
}

/// The capability surface plugins see is the shared state itself.
impl PluginHost for SharedState {
    fn send_message(
        &self,
        username: &str,
        text: Option<&str>,
        image_url: Option<&str>,
        quoted_message: Option<&QuotedMessage>,
        mentions: &[String],
    ) {
        self.broadcast(&ServerEvent::ChatMessage {
            username: username.to_string(),
            message: text.map(str::to_string),
            image_url: image_url.map(str::to_string),
            timestamp: Utc::now().timestamp(),
            quoted_message: quoted_message.cloned(),
            mentions: mentions.to_vec(),
        });
    }

    fn online_users(&self) -> Vec<String> {
        self.presence.list_online()
    }

    fn admin_users(&self) -> Vec<String> {
        self.with_db(|db| db.list_users())
            .unwrap_or_default()
            .into_iter()
            .filter(|u| u.is_admin)
            .map(|u| u.username)
            .collect()
    }

    fn set_muted(&self, username: &str, muted: bool) -> bool {
        SharedState::set_muted(self, username, muted).is_ok()
    }

    fn is_muted(&self, username: &str) -> bool {
        SharedState::is_muted(self, username)
    }

    fn bus(&self) -> &Bus {
        self.plugins.bus()
    }
}

/// The server itself: builds state and serves HTTP/WebSocket.
pub struct Server {
    config: ServerConfig,
    plugins: PluginManager,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            plugins: PluginManager::empty(),
        }
    }

    /// Install a plugin registry before starting.
    pub fn with_plugins(config: ServerConfig, plugins: PluginManager) -> Self {
        Self { config, plugins }
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let listen_addr = self.config.listen_addr.clone();
        let state = SharedState::new(self.config, self.plugins)?;

        crate::sweep::spawn(Arc::clone(&state));

        let app = crate::web::router(Arc::clone(&state));
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;
        let local: SocketAddr = listener.local_addr()?;
        tracing::info!("Listening on http://{local}");
        axum::serve(listener, app).await?;
        Ok(())
    }
}
