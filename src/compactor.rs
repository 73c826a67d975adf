use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const TICK: Duration = Duration::from_secs(5);

/// Background task per organization: rewrites the WAL once enough appends
/// have piled up since the last compaction, and drops idle notify channels
/// and backup ordering slots.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(TICK);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
        engine.notify.prune();
        engine.prune_delivery_slots();
    }
}

/// Returns true when a compaction ran and succeeded.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(
                "compacted WAL after {appends} appends: {} appointments kept",
                engine.appointment_count()
            );
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Skips with a debug line when nothing changed; used on shutdown.
pub async fn compact_on_shutdown(engine: &Engine) {
    if engine.wal_appends_since_compact().await == 0 {
        debug!("WAL unchanged since last compaction");
        return;
    }
    compact_if_due(engine, 1).await;
}
