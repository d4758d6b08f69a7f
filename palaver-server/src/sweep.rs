//! Background retention sweep.
//!
//! Once a day (and once at startup) image-carrying messages older
//! than the retention window are purged and their blobs deleted. The
//! cutoff is computed at sweep start, so messages inserted while the
//! sweep runs are never strictly older than it and cannot be touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::server::SharedState;

const SWEEP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawn the daily sweep task. The first tick fires immediately.
pub fn spawn(state: Arc<SharedState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        loop {
            interval.tick().await;
            run_once(&state);
        }
    });
}

/// One sweep pass against the current clock.
pub fn run_once(state: &SharedState) {
    let cutoff = (Utc::now() - chrono::Duration::days(state.config.retention_days)).timestamp();
    run_at(state, cutoff);
}

/// One sweep pass against an explicit cutoff (for tests).
pub fn run_at(state: &SharedState, cutoff: i64) {
    let refs = state
        .with_db(|db| db.old_image_refs(cutoff))
        .unwrap_or_default();
    for blob_ref in &refs {
        match state.blobs.delete(blob_ref) {
            Ok(()) => tracing::info!("Deleted expired image blob {blob_ref}"),
            Err(e) => tracing::warn!("Failed to delete expired image blob {blob_ref}: {e}"),
        }
    }
    if let Some(purged) = state.with_db(|db| db.purge_old_image_messages(cutoff))
        && purged > 0
    {
        tracing::info!("Purged {purged} expired image messages");
    }
}
