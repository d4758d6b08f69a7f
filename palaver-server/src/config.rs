//! Server configuration (CLI flags with env-var fallbacks).

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "palaver-server", about = "Invitation-gated group chat server")]
pub struct ServerConfig {
    /// HTTP/WebSocket listen address.
    #[arg(long, env = "PALAVER_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen_addr: String,

    /// SQLite database path. Omit for a transient in-memory database.
    #[arg(long, env = "PALAVER_DB", default_value = "palaver.db")]
    pub db_path: Option<String>,

    /// Directory for uploaded images, served under /uploads.
    #[arg(long, env = "PALAVER_UPLOADS_DIR", default_value = "uploads")]
    pub uploads_dir: String,

    /// Root admin username, created at startup if absent.
    /// This account can never be demoted.
    #[arg(long, env = "INITIAL_ADMIN_USERNAME", default_value = "admin")]
    pub admin_username: String,

    /// Root admin password (only used when the account is first created).
    #[arg(long, env = "INITIAL_ADMIN_PASSWORD", default_value = "adminpass")]
    pub admin_password: String,

    /// Secret for signing session credentials. If unset, a random
    /// per-process secret is used and tokens do not survive restarts.
    #[arg(long, env = "PALAVER_TOKEN_SECRET")]
    pub token_secret: Option<String>,

    /// Credential lifetime in seconds.
    #[arg(long, env = "PALAVER_TOKEN_TTL", default_value_t = 3600)]
    pub token_ttl_secs: i64,

    /// Number of recent messages pushed to a freshly logged-in client.
    #[arg(long, default_value_t = 50)]
    pub history_limit: usize,

    /// Image messages older than this many days are purged by the
    /// daily sweep, along with their blobs.
    #[arg(long, default_value_t = 7)]
    pub retention_days: i64,
}

impl Default for ServerConfig {
    /// Defaults for tests: in-memory database, ephemeral token secret.
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            db_path: None,
            uploads_dir: std::env::temp_dir()
                .join("palaver-uploads")
                .to_string_lossy()
                .into_owned(),
            admin_username: "admin".to_string(),
            admin_password: "adminpass".to_string(),
            token_secret: None,
            token_ttl_secs: 3600,
            history_limit: 50,
            retention_days: 7,
        }
    }
}
