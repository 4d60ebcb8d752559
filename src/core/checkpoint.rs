use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::claim::{ClaimGuard, Clock};
use crate::core::store::RunStore;
use crate::core::workflow::types::WorkflowRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Written,
    /// Storage was slow or unavailable; the run carries on in memory.
    Failed,
    /// The lease belongs to someone else now; the caller must stop.
    ClaimLost,
}

/// Best-effort persistence of run progress, bounded by a timeout so storage
/// latency never stalls the loop for long.
pub struct CheckpointWriter {
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn RunStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    pub async fn write(&self, run: &WorkflowRun, guard: &ClaimGuard) -> CheckpointOutcome {
        if guard.is_lost() {
            return CheckpointOutcome::ClaimLost;
        }
        let now = self.clock.now_ms();
        let write = self.store.write_checkpoint(run, guard.claimant(), now);
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(true)) => {
                debug!(run_id = %run.id, iteration = run.iteration, "Checkpoint written");
                CheckpointOutcome::Written
            }
            Ok(Ok(false)) => {
                warn!(run_id = %run.id, "Checkpoint refused: claim no longer held");
                guard.mark_lost();
                CheckpointOutcome::ClaimLost
            }
            Ok(Err(e)) => {
                warn!(run_id = %run.id, iteration = run.iteration, "Checkpoint failed: {:#}", e);
                CheckpointOutcome::Failed
            }
            Err(_) => {
                warn!(
                    run_id = %run.id,
                    iteration = run.iteration,
                    "Checkpoint timed out after {:?}", self.timeout
                );
                CheckpointOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::claim::{ClaimCoordinator, ManualClock};
    use crate::core::config::ClaimConfig;
    use crate::core::store::SqliteRunStore;
    use anyhow::{Result, bail};
    use async_trait::async_trait;

    /// Store whose checkpoint writes always fail.
    struct BrokenStore(SqliteRunStore);

    #[async_trait]
    impl RunStore for BrokenStore {
        async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
            self.0.create_run(run).await
        }
        async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
            self.0.load_run(run_id).await
        }
        async fn try_claim(&self, id: &str, c: &str, now: i64, stale: i64) -> Result<bool> {
            self.0.try_claim(id, c, now, stale).await
        }
        async fn refresh_claim(&self, id: &str, c: &str, now: i64) -> Result<bool> {
            self.0.refresh_claim(id, c, now).await
        }
        async fn write_checkpoint(&self, _: &WorkflowRun, _: &str, _: i64) -> Result<bool> {
            bail!("disk full")
        }
        async fn finish_run(&self, run: &WorkflowRun, c: &str, now: i64) -> Result<bool> {
            self.0.finish_run(run, c, now).await
        }
        async fn release_claim(&self, id: &str, c: &str) -> Result<()> {
            self.0.release_claim(id, c).await
        }
        async fn list_resumable(&self, stale: i64) -> Result<Vec<String>> {
            self.0.list_resumable(stale).await
        }
    }

    async fn setup(store: Arc<dyn RunStore>) -> (WorkflowRun, ClaimGuard, Arc<ManualClock>) {
        let run = WorkflowRun::new("s", "q", vec![], 0);
        store.create_run(&run).await.unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let coordinator =
            ClaimCoordinator::new(store, clock.clone(), "me".into(), &ClaimConfig::default());
        let guard = coordinator.acquire(&run.id).await.unwrap().unwrap();
        (run, guard, clock)
    }

    #[tokio::test]
    async fn holder_writes_progress() {
        let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::open_in_memory().unwrap());
        let (mut run, guard, clock) = setup(store.clone()).await;
        let writer = CheckpointWriter::new(store.clone(), clock, Duration::from_secs(1));
        run.iteration = 3;
        assert_eq!(writer.write(&run, &guard).await, CheckpointOutcome::Written);
        assert_eq!(store.load_run(&run.id).await.unwrap().unwrap().iteration, 3);
    }

    #[tokio::test]
    async fn storage_failure_is_not_fatal() {
        let store: Arc<dyn RunStore> =
            Arc::new(BrokenStore(SqliteRunStore::open_in_memory().unwrap()));
        let (run, guard, clock) = setup(store.clone()).await;
        let writer = CheckpointWriter::new(store, clock, Duration::from_secs(1));
        assert_eq!(writer.write(&run, &guard).await, CheckpointOutcome::Failed);
        assert!(!guard.is_lost());
    }

    #[tokio::test]
    async fn timeout_bounds_a_write_stuck_on_a_locked_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::open(&path).await.unwrap());
        let (run, guard, clock) = setup(store.clone()).await;

        // Another process holds the write lock.
        let locker = rusqlite::Connection::open(&path).unwrap();
        locker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let writer = CheckpointWriter::new(store, clock, Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert_eq!(writer.write(&run, &guard).await, CheckpointOutcome::Failed);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!guard.is_lost());
        drop(locker);
    }

    #[tokio::test]
    async fn refused_write_marks_the_claim_lost() {
        let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::open_in_memory().unwrap());
        let (run, guard, clock) = setup(store.clone()).await;
        clock.advance(Duration::from_secs(500));
        let now = clock.now_ms();
        assert!(store.try_claim(&run.id, "other", now, now - 1).await.unwrap());

        let writer = CheckpointWriter::new(store, clock, Duration::from_secs(1));
        assert_eq!(writer.write(&run, &guard).await, CheckpointOutcome::ClaimLost);
        assert!(guard.is_lost());
        assert_eq!(writer.write(&run, &guard).await, CheckpointOutcome::ClaimLost);
    }
}
