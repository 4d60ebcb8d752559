use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::engine::{EngineSettings, RunError, WorkflowEngine};
use super::progress::ProgressSink;
use super::types::{Dialect, RunReport, WorkflowRun};
use crate::core::checkpoint::CheckpointWriter;
use crate::core::claim::{ClaimCoordinator, Clock, SystemClock, claimant_id};
use crate::core::config::EngineConfig;
use crate::core::llm::providers::AnthropicProvider;
use crate::core::llm::{LlmGateway, LlmProvider, Message};
use crate::core::store::{RunStore, SqliteRunStore};
use crate::core::telemetry::{TelemetrySink, TracingSink};
use crate::core::tools::{
    FsDocumentReader, HttpQueryBackend, QueryTool, ReadDocsTool, ToolDispatcher, ToolRegistry,
};

/// Per-run inputs beyond the question itself.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub history: Vec<Message>,
    pub progress: ProgressSink,
    /// Cancels just this run. [`Runner::shutdown`] cancels all of them.
    pub cancel: Option<CancellationToken>,
}

/// Entry points for creating and resuming runs on this replica.
pub struct Runner {
    engine: Arc<WorkflowEngine>,
    store: Arc<dyn RunStore>,
    claims: Arc<ClaimCoordinator>,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        store: Arc<dyn RunStore>,
        claims: Arc<ClaimCoordinator>,
    ) -> Self {
        Self {
            engine,
            store,
            claims,
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire the production stack described by `config`.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let api_key = std::env::var(&config.llm.api_key_env)
            .with_context(|| format!("{} is not set", config.llm.api_key_env))?;
        let provider: Arc<dyn LlmProvider> = Arc::new(AnthropicProvider::new(&config.llm, api_key));
        let store: Arc<dyn RunStore> =
            Arc::new(SqliteRunStore::open(config.database_path()).await?);
        let registry = build_registry(config);
        Ok(Self::assemble(
            config,
            provider,
            store,
            registry,
            Arc::new(SystemClock),
            Arc::new(TracingSink),
        ))
    }

    /// Build a runner from explicit parts; the seams tests and embedders use.
    pub fn assemble(
        config: &EngineConfig,
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn RunStore>,
        registry: ToolRegistry,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let gateway = LlmGateway::new(
            provider,
            config.retry.clone(),
            Duration::from_secs(config.llm.timeout_secs),
            telemetry.clone(),
        );
        let dispatcher = ToolDispatcher::new(Arc::new(registry), config.run_loop.tool_timeout());
        let checkpoints = CheckpointWriter::new(
            store.clone(),
            clock.clone(),
            Duration::from_millis(config.checkpoint.timeout_ms),
        );
        let claims = Arc::new(ClaimCoordinator::new(
            store.clone(),
            clock.clone(),
            claimant_id(),
            &config.claim,
        ));
        let engine = Arc::new(WorkflowEngine::new(
            gateway,
            dispatcher,
            checkpoints,
            store.clone(),
            clock,
            telemetry,
            EngineSettings::from_config(config),
        ));
        Self::new(engine, store, claims)
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn claimant(&self) -> &str {
        self.claims.claimant()
    }

    /// Fire-and-forget: no prior history, no progress events.
    pub async fn run(&self, session_id: &str, question: &str) -> Result<RunReport, RunError> {
        self.run_with_options(session_id, question, RunOptions::default())
            .await
    }

    pub async fn run_with_history(
        &self,
        session_id: &str,
        question: &str,
        history: Vec<Message>,
    ) -> Result<RunReport, RunError> {
        let options = RunOptions {
            history,
            ..Default::default()
        };
        self.run_with_options(session_id, question, options).await
    }

    pub async fn run_with_progress(
        &self,
        session_id: &str,
        question: &str,
        history: Vec<Message>,
        progress: ProgressSink,
    ) -> Result<RunReport, RunError> {
        let options = RunOptions {
            history,
            progress,
            cancel: None,
        };
        self.run_with_options(session_id, question, options).await
    }

    pub async fn run_with_options(
        &self,
        session_id: &str,
        question: &str,
        options: RunOptions,
    ) -> Result<RunReport, RunError> {
        let now = self.engine.clock().now_ms();
        let run = WorkflowRun::new(session_id, question, options.history, now);
        self.store.create_run(&run).await?;
        info!(run_id = %run.id, session_id, "Run created");

        let Some(guard) = self.claims.acquire(&run.id).await? else {
            return Err(RunError::OwnershipConflict { run_id: run.id });
        };
        let cancel = self.shutdown.child_token();
        let _link = link(options.cancel, &cancel);
        self.engine
            .drive(run, guard, cancel, options.progress)
            .await
    }

    /// Continue a run from its last checkpoint. A run that already finished
    /// is reported as stored, never answered twice.
    pub async fn resume(
        &self,
        run_id: &str,
        progress: ProgressSink,
    ) -> Result<RunReport, RunError> {
        let Some(guard) = self.claims.acquire(run_id).await? else {
            return match self.store.load_run(run_id).await? {
                None => Err(RunError::NotFound {
                    run_id: run_id.to_string(),
                }),
                Some(run) if run.status.is_terminal() => Ok(RunReport::from_run(&run)),
                Some(_) => Err(RunError::OwnershipConflict {
                    run_id: run_id.to_string(),
                }),
            };
        };
        // Load after claiming so the state cannot move underneath us.
        let Some(run) = self.store.load_run(run_id).await? else {
            return Err(RunError::NotFound {
                run_id: run_id.to_string(),
            });
        };
        info!(run_id, iteration = run.iteration, "Resuming run");
        self.engine
            .drive(run, guard, self.shutdown.child_token(), progress)
            .await
    }

    /// Resume every run whose owner has gone quiet. Runs another replica
    /// grabs first are skipped.
    pub async fn resume_stale(&self) -> Result<Vec<RunReport>, RunError> {
        let mut reports = Vec::new();
        for run_id in self.claims.resumable().await? {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.resume(&run_id, ProgressSink::none()).await {
                Ok(report) => reports.push(report),
                Err(RunError::OwnershipConflict { .. }) | Err(RunError::ClaimLost { .. }) => {
                    info!(run_id = %run_id, "Skipping run owned by another replica");
                }
                Err(e) => warn!(run_id = %run_id, "Resume failed: {}", e),
            }
        }
        Ok(reports)
    }

    /// Cancel every in-flight run on this replica.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Forward a caller's cancellation into the run token until the run ends.
fn link(
    caller: Option<CancellationToken>,
    run: &CancellationToken,
) -> tokio_util::sync::DropGuard {
    let done = CancellationToken::new();
    if let Some(caller) = caller {
        let run = run.clone();
        let done = done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => run.cancel(),
                _ = done.cancelled() => {}
            }
        });
    }
    done.drop_guard()
}

fn build_registry(config: &EngineConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let max_rows = config.run_loop.max_rows_in_result;
    let timeout = config.run_loop.tool_timeout();
    if let Some(url) = &config.backends.sql_url {
        let backend = Arc::new(HttpQueryBackend::new(url, config.retry.clone(), timeout));
        registry.register(Arc::new(QueryTool::new(Dialect::Sql, backend, max_rows)));
    }
    if let Some(url) = &config.backends.cypher_url {
        let backend = Arc::new(HttpQueryBackend::new(url, config.retry.clone(), timeout));
        registry.register(Arc::new(QueryTool::new(Dialect::Cypher, backend, max_rows)));
    }
    if let Some(dir) = &config.backends.docs_dir {
        registry.register(Arc::new(ReadDocsTool::new(Arc::new(FsDocumentReader::new(
            dir.clone(),
        )))));
    }
    if registry.names().is_empty() {
        warn!("No tool backends configured; runs will be conversational only");
    }
    registry
}
