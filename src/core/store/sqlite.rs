use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use super::RunStore;
use crate::core::workflow::types::{RunStatus, WorkflowRun};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    question TEXT NOT NULL,
    status TEXT NOT NULL,
    iteration INTEGER NOT NULL DEFAULT 0,
    messages TEXT NOT NULL,
    thinking TEXT NOT NULL,
    executed_queries TEXT NOT NULL,
    answer TEXT,
    follow_ups TEXT NOT NULL,
    truncated INTEGER NOT NULL DEFAULT 0,
    metrics TEXT NOT NULL,
    claimed_by TEXT,
    claimed_at INTEGER,
    started_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    error TEXT
)";

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_runs_session ON workflow_runs(session_id)",
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_RUN: &str = "SELECT id, session_id, question, status, iteration, messages, thinking,
        executed_queries, answer, follow_ups, truncated, metrics, claimed_by, claimed_at,
        started_at, updated_at, completed_at, error
    FROM workflow_runs WHERE id = ?1";

/// [`RunStore`] over a SQLite file. Separate processes opening the same file
/// coordinate through SQLite's own locking; claims are single statements.
///
/// Every statement runs on the blocking pool, so a caller's timeout fires
/// even while SQLite is waiting on a lock held elsewhere.
#[derive(Clone)]
pub struct SqliteRunStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::task::spawn_blocking(move || -> Result<Self> {
            let db = Connection::open(&path)
                .with_context(|| format!("opening run store at {}", path.display()))?;
            db.busy_timeout(BUSY_TIMEOUT)?;
            let mode: String =
                db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            info!("Run store opened at {} (journal_mode={})", path.display(), mode);
            Self::init(db)
        })
        .await?
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute(SCHEMA, [])?;
        for index in INDEXES {
            db.execute(index, [])?;
        }
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    async fn with_db<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("run store connection poisoned"))?;
            op(&conn)
        })
        .await
        .context("run store task failed")?
    }
}

/// Column values for the progress part of a run.
struct Encoded {
    messages: String,
    thinking: String,
    executed_queries: String,
    follow_ups: String,
    metrics: String,
}

fn encode(run: &WorkflowRun) -> Result<Encoded> {
    Ok(Encoded {
        messages: serde_json::to_string(&run.messages)?,
        thinking: serde_json::to_string(&run.thinking)?,
        executed_queries: serde_json::to_string(&run.executed_queries)?,
        follow_ups: serde_json::to_string(&run.follow_ups)?,
        metrics: serde_json::to_string(&run.metrics)?,
    })
}

/// Owned copy of a run's columns, movable onto the blocking pool.
struct Row {
    id: String,
    session_id: String,
    question: String,
    status: &'static str,
    iteration: u32,
    answer: Option<String>,
    truncated: bool,
    claimed_by: Option<String>,
    claimed_at: Option<i64>,
    started_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
    encoded: Encoded,
}

impl Row {
    fn of(run: &WorkflowRun) -> Result<Self> {
        Ok(Self {
            id: run.id.clone(),
            session_id: run.session_id.clone(),
            question: run.question.clone(),
            status: run.status.as_str(),
            iteration: run.iteration,
            answer: run.answer.clone(),
            truncated: run.truncated,
            claimed_by: run.claimed_by.clone(),
            claimed_at: run.claimed_at,
            started_at: run.started_at,
            updated_at: run.updated_at,
            completed_at: run.completed_at,
            error: run.error.clone(),
            encoded: encode(run)?,
        })
    }
}

struct RawRow {
    id: String,
    session_id: String,
    question: String,
    status: String,
    iteration: i64,
    messages: String,
    thinking: String,
    executed_queries: String,
    answer: Option<String>,
    follow_ups: String,
    truncated: bool,
    metrics: String,
    claimed_by: Option<String>,
    claimed_at: Option<i64>,
    started_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            question: row.get(2)?,
            status: row.get(3)?,
            iteration: row.get(4)?,
            messages: row.get(5)?,
            thinking: row.get(6)?,
            executed_queries: row.get(7)?,
            answer: row.get(8)?,
            follow_ups: row.get(9)?,
            truncated: row.get(10)?,
            metrics: row.get(11)?,
            claimed_by: row.get(12)?,
            claimed_at: row.get(13)?,
            started_at: row.get(14)?,
            updated_at: row.get(15)?,
            completed_at: row.get(16)?,
            error: row.get(17)?,
        })
    }

    fn decode(self) -> Result<WorkflowRun> {
        let status = RunStatus::from_status(&self.status)
            .ok_or_else(|| anyhow!("run {} has unknown status '{}'", self.id, self.status))?;
        Ok(WorkflowRun {
            status,
            iteration: u32::try_from(self.iteration).unwrap_or(0),
            messages: serde_json::from_str(&self.messages).context("decoding messages")?,
            thinking: serde_json::from_str(&self.thinking).context("decoding thinking")?,
            executed_queries: serde_json::from_str(&self.executed_queries)
                .context("decoding executed queries")?,
            follow_ups: serde_json::from_str(&self.follow_ups).context("decoding follow-ups")?,
            metrics: serde_json::from_str(&self.metrics).context("decoding metrics")?,
            id: self.id,
            session_id: self.session_id,
            question: self.question,
            answer: self.answer,
            truncated: self.truncated,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at,
            started_at: self.started_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            error: self.error,
        })
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        let row = Row::of(run)?;
        self.with_db(move |db| {
            db.execute(
                "INSERT INTO workflow_runs (id, session_id, question, status, iteration, messages,
                    thinking, executed_queries, answer, follow_ups, truncated, metrics, claimed_by,
                    claimed_at, started_at, updated_at, completed_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    row.id,
                    row.session_id,
                    row.question,
                    row.status,
                    row.iteration,
                    row.encoded.messages,
                    row.encoded.thinking,
                    row.encoded.executed_queries,
                    row.answer,
                    row.encoded.follow_ups,
                    row.truncated,
                    row.encoded.metrics,
                    row.claimed_by,
                    row.claimed_at,
                    row.started_at,
                    row.updated_at,
                    row.completed_at,
                    row.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let run_id = run_id.to_string();
        let raw = self
            .with_db(move |db| {
                Ok(db
                    .query_row(SELECT_RUN, params![run_id], RawRow::from_row)
                    .optional()?)
            })
            .await?;
        raw.map(RawRow::decode).transpose()
    }

    async fn try_claim(
        &self,
        run_id: &str,
        claimant: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<bool> {
        let (run_id, claimant) = (run_id.to_string(), claimant.to_string());
        self.with_db(move |db| {
            let changed = db.execute(
                "UPDATE workflow_runs SET claimed_by = ?2, claimed_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND status = 'running'
                   AND (claimed_by IS NULL OR claimed_at IS NULL OR claimed_by = ?2 OR claimed_at < ?4)",
                params![run_id, claimant, now_ms, stale_before_ms],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn refresh_claim(&self, run_id: &str, claimant: &str, now_ms: i64) -> Result<bool> {
        let (run_id, claimant) = (run_id.to_string(), claimant.to_string());
        self.with_db(move |db| {
            let changed = db.execute(
                "UPDATE workflow_runs SET claimed_at = ?3
                 WHERE id = ?1 AND status = 'running' AND claimed_by = ?2",
                params![run_id, claimant, now_ms],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn write_checkpoint(
        &self,
        run: &WorkflowRun,
        claimant: &str,
        now_ms: i64,
    ) -> Result<bool> {
        let row = Row::of(run)?;
        let claimant = claimant.to_string();
        self.with_db(move |db| {
            let changed = db.execute(
                "UPDATE workflow_runs SET iteration = ?3, messages = ?4, thinking = ?5,
                    executed_queries = ?6, metrics = ?7, updated_at = ?8, claimed_at = ?8
                 WHERE id = ?1 AND status = 'running' AND claimed_by = ?2",
                params![
                    row.id,
                    claimant,
                    row.iteration,
                    row.encoded.messages,
                    row.encoded.thinking,
                    row.encoded.executed_queries,
                    row.encoded.metrics,
                    now_ms,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn finish_run(&self, run: &WorkflowRun, claimant: &str, now_ms: i64) -> Result<bool> {
        let row = Row::of(run)?;
        let claimant = claimant.to_string();
        self.with_db(move |db| {
            let changed = db.execute(
                "UPDATE workflow_runs SET status = ?3, iteration = ?4, messages = ?5, thinking = ?6,
                    executed_queries = ?7, answer = ?8, follow_ups = ?9, truncated = ?10,
                    metrics = ?11, error = ?12, updated_at = ?13, completed_at = ?13,
                    claimed_by = NULL, claimed_at = NULL
                 WHERE id = ?1 AND status = 'running' AND claimed_by = ?2",
                params![
                    row.id,
                    claimant,
                    row.status,
                    row.iteration,
                    row.encoded.messages,
                    row.encoded.thinking,
                    row.encoded.executed_queries,
                    row.answer,
                    row.encoded.follow_ups,
                    row.truncated,
                    row.encoded.metrics,
                    row.error,
                    now_ms,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release_claim(&self, run_id: &str, claimant: &str) -> Result<()> {
        let (run_id, claimant) = (run_id.to_string(), claimant.to_string());
        self.with_db(move |db| {
            db.execute(
                "UPDATE workflow_runs SET claimed_by = NULL, claimed_at = NULL
                 WHERE id = ?1 AND claimed_by = ?2",
                params![run_id, claimant],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_resumable(&self, stale_before_ms: i64) -> Result<Vec<String>> {
        self.with_db(move |db| {
            let mut stmt = db.prepare(
                "SELECT id FROM workflow_runs
                 WHERE status = 'running' AND (claimed_by IS NULL OR claimed_at IS NULL OR claimed_at < ?1)
                 ORDER BY started_at ASC",
            )?;
            let rows = stmt.query_map(params![stale_before_ms], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::Message;

    fn run() -> WorkflowRun {
        WorkflowRun::new("session-1", "How many orders?", vec![], 1_000)
    }

    #[tokio::test]
    async fn create_and_load_round_trip() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let r = run();
        store.create_run(&r).await.unwrap();
        let loaded = store.load_run(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded, r);
        assert!(store.load_run("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_claim_blocks_other_claimants() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let r = run();
        store.create_run(&r).await.unwrap();

        assert!(store.try_claim(&r.id, "a", 10_000, 0).await.unwrap());
        // Re-claim by the holder is idempotent.
        assert!(store.try_claim(&r.id, "a", 11_000, 0).await.unwrap());
        // Claim at 11_000 is newer than the staleness cutoff of 5_000.
        assert!(!store.try_claim(&r.id, "b", 12_000, 5_000).await.unwrap());
        // Once the cutoff passes the claim time, b may take over.
        assert!(store.try_claim(&r.id, "b", 200_000, 80_000).await.unwrap());
        assert!(!store.refresh_claim(&r.id, "a", 200_001).await.unwrap());
        assert!(store.refresh_claim(&r.id, "b", 200_001).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_on_shared_file_admit_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let first = SqliteRunStore::open(&path).await.unwrap();
        let second = SqliteRunStore::open(&path).await.unwrap();
        let r = run();
        first.create_run(&r).await.unwrap();
        assert!(first.try_claim(&r.id, "holder", 50_000, 0).await.unwrap());

        let (a, b) = tokio::join!(
            first.try_claim(&r.id, "replica-a", 60_000, 10_000),
            second.try_claim(&r.id, "replica-b", 60_000, 10_000),
        );
        assert!(!a.unwrap());
        assert!(!b.unwrap());

        // Stale now: exactly one of the two racers wins.
        let (a, b) = tokio::join!(
            first.try_claim(&r.id, "replica-a", 500_000, 400_000),
            second.try_claim(&r.id, "replica-b", 500_000, 400_000),
        );
        assert!(a.unwrap() ^ b.unwrap());
    }

    #[tokio::test]
    async fn writes_require_the_lease() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let mut r = run();
        store.create_run(&r).await.unwrap();
        assert!(store.try_claim(&r.id, "a", 2_000, 0).await.unwrap());

        r.iteration = 1;
        r.messages.push(Message::assistant("thinking about it"));
        assert!(!store.write_checkpoint(&r, "b", 3_000).await.unwrap());
        assert!(store.write_checkpoint(&r, "a", 3_000).await.unwrap());

        let loaded = store.load_run(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded.iteration, 1);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.claimed_at, Some(3_000));

        r.status = RunStatus::Completed;
        r.answer = Some("42".into());
        assert!(store.finish_run(&r, "a", 4_000).await.unwrap());
        let loaded = store.load_run(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.answer.as_deref(), Some("42"));
        assert_eq!(loaded.completed_at, Some(4_000));
        assert!(loaded.claimed_by.is_none());

        // Terminal runs can be neither claimed nor finished again.
        assert!(!store.try_claim(&r.id, "a", 5_000, 0).await.unwrap());
        assert!(!store.finish_run(&r, "a", 5_000).await.unwrap());
    }

    #[tokio::test]
    async fn resumable_lists_unclaimed_and_stale_runs() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let idle = run();
        let live = run();
        let stale = run();
        for r in [&idle, &live, &stale] {
            store.create_run(r).await.unwrap();
        }
        store.try_claim(&live.id, "a", 90_000, 0).await.unwrap();
        store.try_claim(&stale.id, "b", 10_000, 0).await.unwrap();

        let ids = store.list_resumable(50_000).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&idle.id));
        assert!(ids.contains(&stale.id));

        store.release_claim(&live.id, "a").await.unwrap();
        assert_eq!(store.list_resumable(50_000).await.unwrap().len(), 3);
    }
}
