use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::model::{Actor, Ms, Status};
use crate::observability::OVERDUE_SWEPT_TOTAL;

const OVERDUE_REASON: &str = "past end date";

/// One pass: move every confirmed/active reservation whose span ended at or
/// before `now` to overdue. Returns how many moved.
pub async fn sweep_overdue_once(engine: &Engine, now: Ms) -> usize {
    let system = Actor::system();
    let mut swept = 0;
    for id in engine.collect_overdue(now) {
        match engine
            .transition(id, &system, Status::Overdue, Some(OVERDUE_REASON.into()))
            .await
        {
            Ok(_) => {
                swept += 1;
                info!("marked {id} overdue");
            }
            // Completed, cancelled or deleted since it was collected.
            Err(e @ (EngineError::IllegalTransition { .. } | EngineError::NotFound(_))) => {
                tracing::debug!("sweeper skip {id}: {e}");
            }
            Err(e) => tracing::warn!("sweeper failed on {id}: {e}"),
        }
    }
    metrics::counter!(OVERDUE_SWEPT_TOTAL).increment(swept as u64);
    swept
}

pub async fn run_overdue_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        sweep_overdue_once(&engine, crate::engine::now_ms()).await;
    }
}

/// Compact the WAL whenever enough appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match engine.wal_appends_since_compact().await {
            Ok(n) if n >= threshold => {
                if let Err(e) = engine.compact_wal().await {
                    tracing::error!("WAL compaction failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("compactor stopping: {e}");
                break;
            }
        }
    }
}
