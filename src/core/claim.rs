use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::ClaimConfig;
use crate::core::store::RunStore;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// `<hostname>-<pid>-<random>`, unique per process start.
pub fn claimant_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &nonce[..8])
}

/// Acquires leases on runs for one replica.
pub struct ClaimCoordinator {
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    claimant: String,
    staleness: Duration,
    heartbeat: Duration,
}

impl ClaimCoordinator {
    pub fn new(
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
        claimant: String,
        config: &ClaimConfig,
    ) -> Self {
        Self {
            store,
            clock,
            claimant,
            staleness: config.staleness(),
            heartbeat: config.heartbeat(),
        }
    }

    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn stale_cutoff(&self) -> i64 {
        self.clock.now_ms() - self.staleness.as_millis() as i64
    }

    /// `None` when another replica holds a live lease or the run is no
    /// longer running. The caller must then leave the run alone.
    pub async fn acquire(&self, run_id: &str) -> Result<Option<ClaimGuard>> {
        let now = self.clock.now_ms();
        if !self
            .store
            .try_claim(run_id, &self.claimant, now, self.stale_cutoff())
            .await?
        {
            info!(run_id, claimant = %self.claimant, "Run is owned elsewhere or finished; skipping");
            return Ok(None);
        }
        debug!(run_id, claimant = %self.claimant, "Claim acquired");
        Ok(Some(ClaimGuard::start(
            run_id.to_string(),
            self.claimant.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.heartbeat,
        )))
    }

    /// Runs whose lease is absent or stale right now.
    pub async fn resumable(&self) -> Result<Vec<String>> {
        self.store.list_resumable(self.stale_cutoff()).await
    }
}

/// A held lease. A background heartbeat keeps it fresh; if a refresh finds
/// the lease gone, [`lost`](Self::lost) is cancelled and the holder must stop
/// writing to the run.
pub struct ClaimGuard {
    run_id: String,
    claimant: String,
    store: Arc<dyn RunStore>,
    lost: CancellationToken,
    stop: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

impl ClaimGuard {
    fn start(
        run_id: String,
        claimant: String,
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
        every: Duration,
    ) -> Self {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            run_id.clone(),
            claimant.clone(),
            store.clone(),
            clock,
            every,
            lost.clone(),
            stop.clone(),
        ));
        Self {
            run_id,
            claimant,
            store,
            lost,
            stop,
            heartbeat: Some(heartbeat),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    pub fn lost(&self) -> &CancellationToken {
        &self.lost
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Mark the lease as gone, e.g. after a write was refused.
    pub fn mark_lost(&self) {
        self.lost.cancel();
    }

    /// Stop the heartbeat and clear the claim if it is still ours. Harmless
    /// after the run has been finished.
    pub async fn release(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.await;
        }
        if let Err(e) = self.store.release_claim(&self.run_id, &self.claimant).await {
            warn!(run_id = %self.run_id, "Failed to release claim: {}", e);
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

async fn heartbeat_loop(
    run_id: String,
    claimant: String,
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        match store.refresh_claim(&run_id, &claimant, clock.now_ms()).await {
            Ok(true) => debug!(run_id = %run_id, "Claim refreshed"),
            Ok(false) => {
                warn!(run_id = %run_id, claimant = %claimant, "Claim lost to another replica");
                lost.cancel();
                return;
            }
            // Keep trying; if the store stays down the lease goes stale and
            // the next successful refresh reports the loss.
            Err(e) => warn!(run_id = %run_id, "Claim refresh failed: {}", e),
        }
    }
}
