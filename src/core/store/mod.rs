mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::workflow::types::WorkflowRun;

pub use sqlite::SqliteRunStore;

/// Durable home of [`WorkflowRun`] records.
///
/// The record doubles as the lease: every mutating call after creation is a
/// conditional update that names the claimant, and reports through its
/// boolean result whether the caller still owned the run when it applied.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Take the lease if the run is still running and the current claim is
    /// absent, ours, or last refreshed before `stale_before_ms`.
    async fn try_claim(
        &self,
        run_id: &str,
        claimant: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<bool>;

    /// Bump the claim timestamp; `false` means the lease is gone.
    async fn refresh_claim(&self, run_id: &str, claimant: &str, now_ms: i64) -> Result<bool>;

    /// Persist progress. Also counts as a lease refresh.
    async fn write_checkpoint(&self, run: &WorkflowRun, claimant: &str, now_ms: i64)
    -> Result<bool>;

    /// Persist the terminal state and drop the claim in one update.
    async fn finish_run(&self, run: &WorkflowRun, claimant: &str, now_ms: i64) -> Result<bool>;

    async fn release_claim(&self, run_id: &str, claimant: &str) -> Result<()>;

    /// Running runs nobody holds a live lease on, oldest first.
    async fn list_resumable(&self, stale_before_ms: i64) -> Result<Vec<String>>;
}
