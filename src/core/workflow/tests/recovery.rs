use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Harness, MemoryBackend, START_MS, ScriptedProvider, answer, tool_turn};
use crate::core::claim::ManualClock;
use crate::core::llm::{ContentBlock, Message, Role};
use crate::core::store::{RunStore, SqliteRunStore};
use crate::core::tools::query::RawQueryResult;
use crate::core::tools::{QueryBackend, ToolError};
use crate::core::workflow::types::{CellValue, RunStatus, WorkflowRun};
use crate::core::workflow::{ProgressSink, RunError};

/// A run that replica-a created, checkpointed after one tool round, and
/// then abandoned.
async fn abandoned_run(store: &SqliteRunStore) -> WorkflowRun {
    let mut run = WorkflowRun::new("s", "How many orders?", vec![], START_MS);
    store.create_run(&run).await.unwrap();
    assert!(
        store
            .try_claim(&run.id, "replica-a", START_MS, START_MS - 120_000)
            .await
            .unwrap()
    );
    run.messages.push(Message {
        role: Role::Assistant,
        content: vec![ContentBlock::ToolUse {
            id: "t1".into(),
            name: "execute_sql".into(),
            input: json!({"queries": [{"question": "count", "query": "SELECT count(*) FROM orders"}]}),
        }],
    });
    run.messages.push(Message {
        role: Role::User,
        content: vec![ContentBlock::tool_result("t1", "| count |\n| --- |\n| 42 |")],
    });
    run.iteration = 1;
    assert!(
        store
            .write_checkpoint(&run, "replica-a", START_MS)
            .await
            .unwrap()
    );
    run
}

#[tokio::test]
async fn stale_run_is_resumed_from_its_checkpoint() {
    let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
    let run = abandoned_run(&store).await;
    let h = Harness::on_store(
        store.clone(),
        ScriptedProvider::new(vec![answer("There are 42 orders.")]),
        5,
        Arc::new(MemoryBackend),
        Arc::new(ManualClock::new(START_MS + 30_000)),
    );

    let err = h.runner.resume(&run.id, ProgressSink::none()).await.unwrap_err();
    assert!(matches!(err, RunError::OwnershipConflict { .. }));
    assert!(h.provider.seen().is_empty());

    h.clock.advance(Duration::from_secs(121));
    let report = h.runner.resume(&run.id, ProgressSink::none()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.answer.as_deref(), Some("There are 42 orders."));

    let seen = h.provider.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].messages.len(), 3);

    let stored = store.load_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.iteration, 1);
    assert_eq!(stored.messages.len(), 4);
    assert!(stored.claimed_by.is_none());
}

#[tokio::test]
async fn finished_run_is_reported_not_answered_again() {
    let h = Harness::new(ScriptedProvider::new(vec![answer("Once.")]), 5);
    let first = h.runner.run("s", "q").await.unwrap();

    let again = h
        .runner
        .resume(&first.run_id, ProgressSink::none())
        .await
        .unwrap();
    assert_eq!(again, first);
    assert_eq!(h.provider.seen().len(), 1);
}

#[tokio::test]
async fn resuming_an_unknown_run_is_not_found() {
    let h = Harness::new(ScriptedProvider::new(vec![]), 5);
    let err = h
        .runner
        .resume("no-such-run", ProgressSink::none())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::NotFound { .. }));
}

#[tokio::test]
async fn resume_stale_skips_runs_with_live_owners() {
    let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
    let dead = abandoned_run(&store).await;

    let live = WorkflowRun::new("s2", "Other question", vec![], START_MS);
    store.create_run(&live).await.unwrap();
    let later = START_MS + 200_000;
    assert!(
        store
            .try_claim(&live.id, "replica-b", later, later - 120_000)
            .await
            .unwrap()
    );

    let h = Harness::on_store(
        store.clone(),
        ScriptedProvider::new(vec![answer("Recovered.")]),
        5,
        Arc::new(MemoryBackend),
        Arc::new(ManualClock::new(later)),
    );
    let reports = h.runner.resume_stale().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].run_id, dead.id);

    let untouched = store.load_run(&live.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, RunStatus::Running);
    assert_eq!(untouched.claimed_by.as_deref(), Some("replica-b"));
}

/// Lets another replica take over every running run while a query is in
/// flight, as if this replica had stalled past the staleness window.
struct StealingBackend {
    store: SqliteRunStore,
}

#[async_trait]
impl QueryBackend for StealingBackend {
    async fn run(&self, _query: &str, _cancel: &CancellationToken) -> Result<RawQueryResult, ToolError> {
        let far_future = START_MS + 10_000_000;
        let ids = self
            .store
            .list_resumable(i64::MAX)
            .await
            .map_err(|e| ToolError::Backend(e.to_string()))?;
        for id in ids {
            self.store
                .try_claim(&id, "thief", far_future, i64::MAX)
                .await
                .map_err(|e| ToolError::Backend(e.to_string()))?;
        }
        Ok(RawQueryResult {
            columns: vec!["n".into()],
            rows: vec![vec![CellValue::Int(1)]],
            row_count: Some(1),
            error: None,
        })
    }
}

#[tokio::test]
async fn losing_the_claim_stops_the_run_without_writing() {
    let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
    let h = Harness::on_store(
        store.clone(),
        ScriptedProvider::new(vec![
            tool_turn(
                "",
                vec![(
                    "t1",
                    "execute_sql",
                    json!({"queries": [{"question": "q", "query": "SELECT 1"}]}),
                )],
            ),
            answer("should never be stored"),
        ]),
        5,
        Arc::new(StealingBackend {
            store: (*store).clone(),
        }),
        Arc::new(ManualClock::new(START_MS)),
    );

    let err = h.runner.run("s", "q").await.unwrap_err();
    let RunError::ClaimLost { run_id } = err else {
        panic!("expected ClaimLost, got {:?}", err);
    };
    assert_eq!(h.provider.seen().len(), 1);

    let stored = store.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Running);
    assert_eq!(stored.claimed_by.as_deref(), Some("thief"));
    assert_eq!(stored.iteration, 0);
    assert!(stored.executed_queries.is_empty());
    assert!(stored.answer.is_none());
}
