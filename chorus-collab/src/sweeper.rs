//! Background reclamation of operation-log storage.
//!
//! Documents accumulate committed operations while sessions are live; once
//! the last connection leaves, the log history only matters until the
//! content store's snapshot covers it. The sweeper periodically deletes
//! log storage for documents with no active session — a returning client
//! simply receives a full snapshot instead of an incremental replay.
//!
//! Each pass is isolated: a failing document logs and moves on, a failing
//! pass logs and the loop continues. The interval is jittered so multiple
//! server processes sharing a log do not sweep in lock-step.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::CollabConfig;
use crate::presence::PresenceTracker;
use crate::storage::OperationLog;

/// Result of a single sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Documents whose log storage was reclaimed.
    pub documents_swept: usize,
    /// Committed operations deleted across those documents.
    pub operations_removed: u64,
    /// Documents skipped because a session is live.
    pub documents_active: usize,
}

/// Periodic cleanup task over the operation log.
pub struct Sweeper {
    oplog: Arc<OperationLog>,
    tracker: Arc<PresenceTracker>,
    interval: Duration,
    jitter: Duration,
}

impl Sweeper {
    pub fn new(
        oplog: Arc<OperationLog>,
        tracker: Arc<PresenceTracker>,
        config: &CollabConfig,
    ) -> Self {
        Self {
            oplog,
            tracker,
            interval: config.sweep_interval,
            jitter: config.sweep_jitter,
        }
    }

    /// Run until `cancel` fires. Spawn this on the runtime.
    pub async fn run(self, cancel: CancellationToken) {
        log::info!(
            "Cleanup sweeper started (interval {:?}, jitter up to {:?})",
            self.interval,
            self.jitter
        );

        loop {
            let pause = self.interval + jittered(self.jitter);
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Cleanup sweeper stopped");
                    return;
                }
                _ = tokio::time::sleep(pause) => {}
            }

            match self.sweep_once().await {
                Ok(report) if report.documents_swept > 0 => {
                    log::info!(
                        "Sweep reclaimed {} documents ({} operations), {} active skipped",
                        report.documents_swept,
                        report.operations_removed,
                        report.documents_active
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    // One bad pass never kills the sweeper.
                    log::error!("Sweep pass failed: {e}");
                }
            }
        }
    }

    /// One pass: reclaim log storage for every document without a live
    /// session.
    pub async fn sweep_once(&self) -> Result<SweepReport, crate::storage::StoreError> {
        let documents = self.oplog.list_documents()?;
        let mut report = SweepReport::default();

        for document_id in documents {
            if self.tracker.has_document(document_id).await {
                report.documents_active += 1;
                continue;
            }

            match self.oplog.delete_document(document_id) {
                Ok(removed) => {
                    report.documents_swept += 1;
                    report.operations_removed += removed;
                    log::debug!("Swept document {document_id} ({removed} operations)");
                }
                Err(e) => {
                    // Skip this document, keep sweeping the rest.
                    log::warn!("Failed to sweep document {document_id}: {e}");
                }
            }
        }

        Ok(report)
    }
}

/// Uniform random delay in `[0, max]`.
fn jittered(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}
