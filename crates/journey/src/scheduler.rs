//! Scheduler — a thin async sweep over due wake timers.
//!
//! Suspended instances are inert between sweeps; everything needed to
//! resume them lives in the instance store, so the scheduler process can
//! restart at any time and continue from persisted state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::engine::JourneyEngine;

pub struct Scheduler {
    engine: Arc<JourneyEngine>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<JourneyEngine>, tick: Duration) -> Self {
        Self { engine, tick }
    }

    /// Sweep loop: advance due instances every tick until the shutdown
    /// signal flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.tick.as_millis() as u64, "Scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let processed = self.engine.process_due(Utc::now());
                    if processed > 0 {
                        debug!(processed, "Scheduler sweep advanced instances");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pulse_core::JourneyConfig;
    use pulse_segmentation::{MemoryFactStore, SegmentationEngine};

    use crate::dispatch::CaptureDispatcher;
    use crate::stores::MemoryInstanceStore;

    fn engine() -> Arc<JourneyEngine> {
        Arc::new(JourneyEngine::new(
            Arc::new(SegmentationEngine::new()),
            Arc::new(MemoryFactStore::new()),
            Arc::new(CaptureDispatcher::new()),
            Arc::new(MemoryInstanceStore::new()),
            JourneyConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let scheduler = Scheduler::new(engine(), Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not shut down")
            .unwrap();
    }
}
