use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::progress::{ProgressEvent, ProgressSink};
use super::prompt;
use super::types::{GENERIC_FAILURE, RunReport, RunStatus, WorkflowRun};
use super::{LoopState, can_transition};
use crate::core::checkpoint::{CheckpointOutcome, CheckpointWriter};
use crate::core::claim::{ClaimGuard, Clock};
use crate::core::config::EngineConfig;
use crate::core::llm::{
    CallContext, ContentBlock, LlmError, LlmGateway, LlmRequest, Message, Role, ToolDefinition,
    ToolResponse,
};
use crate::core::store::RunStore;
use crate::core::telemetry::{RunSummary, TelemetrySink};
use crate::core::tools::repair::history_input;
use crate::core::tools::{ToolContext, ToolDispatcher};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_iterations: u32,
    pub max_tokens: u32,
    /// Stream model text to progress listeners when there are any.
    pub stream: bool,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_iterations: config.run_loop.max_iterations,
            max_tokens: config.llm.max_tokens,
            stream: config.llm.stream,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run {run_id} is owned by another replica")]
    OwnershipConflict { run_id: String },
    #[error("lost the claim on run {run_id}")]
    ClaimLost { run_id: String },
    #[error("run {run_id} not found")]
    NotFound { run_id: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// How the loop stopped, before it is written down.
enum Ending {
    Complete(String),
    Truncated(String),
    /// Carries the internal cause, kept for operators and never shown to users.
    Failed(String),
    Cancelled,
    ClaimLost,
}

/// Drives one claimed run from its current iteration to a terminal state.
pub struct WorkflowEngine {
    gateway: LlmGateway,
    dispatcher: ToolDispatcher,
    checkpoints: CheckpointWriter,
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
    settings: EngineSettings,
}

fn advance(state: &mut LoopState, to: LoopState) {
    debug_assert!(
        can_transition(*state, to),
        "illegal loop transition {:?} -> {:?}",
        state,
        to
    );
    debug!(from = state.as_str(), to = to.as_str(), "loop state");
    *state = to;
}

impl WorkflowEngine {
    pub fn new(
        gateway: LlmGateway,
        dispatcher: ToolDispatcher,
        checkpoints: CheckpointWriter,
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            gateway,
            dispatcher,
            checkpoints,
            store,
            clock,
            telemetry,
            settings,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn drive(
        &self,
        run: WorkflowRun,
        guard: ClaimGuard,
        cancel: CancellationToken,
        progress: ProgressSink,
    ) -> Result<RunReport, RunError> {
        let span = info_span!(
            "workflow_run",
            run_id = %run.id,
            session_id = %run.session_id,
            claimant = %guard.claimant()
        );
        self.drive_claimed(run, guard, cancel, progress)
            .instrument(span)
            .await
    }

    async fn drive_claimed(
        &self,
        mut run: WorkflowRun,
        guard: ClaimGuard,
        cancel: CancellationToken,
        progress: ProgressSink,
    ) -> Result<RunReport, RunError> {
        let started = Instant::now();
        info!(iteration = run.iteration, "Run started");
        progress.emit(ProgressEvent::RunStarted {
            run_id: run.id.clone(),
            iteration: run.iteration,
        });

        match self.iterate(&mut run, &guard, &cancel, &progress).await {
            Ending::ClaimLost => {
                warn!("Claim lost; discarding in-progress work");
                return Err(RunError::ClaimLost { run_id: run.id });
            }
            Ending::Complete(answer) => settle(&mut run, &answer, false),
            Ending::Truncated(answer) => settle(&mut run, &answer, true),
            Ending::Failed(cause) => {
                error!("Run failed: {}", cause);
                run.status = LoopState::Error.run_status();
                run.error = Some(cause);
            }
            Ending::Cancelled => {
                info!("Run cancelled");
                run.status = LoopState::Cancelled.run_status();
            }
        }

        let now = self.clock.now_ms();
        run.updated_at = now;
        run.completed_at = Some(now);
        match self.store.finish_run(&run, guard.claimant(), now).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Final state refused: claim no longer held");
                return Err(RunError::ClaimLost { run_id: run.id });
            }
            Err(e) => {
                guard.release().await;
                return Err(RunError::Internal(e.context("persisting final run state")));
            }
        }
        guard.release().await;

        let report = RunReport::from_run(&run);
        self.telemetry.record_run(&RunSummary {
            run_id: run.id.clone(),
            session_id: run.session_id.clone(),
            status: run.status,
            truncated: run.truncated,
            llm_calls: run.metrics.llm_calls,
            queries_executed: report.executed_queries,
            query_errors: report.query_errors,
            classification: report.classification,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        progress.emit(match run.status {
            RunStatus::Cancelled => ProgressEvent::Cancelled,
            RunStatus::Failed => ProgressEvent::Failed {
                message: GENERIC_FAILURE.to_string(),
            },
            _ => ProgressEvent::Completed {
                report: report.clone(),
            },
        });
        info!(
            status = run.status.as_str(),
            truncated = run.truncated,
            iterations = run.iteration,
            "Run finished"
        );
        Ok(report)
    }

    async fn iterate(
        &self,
        run: &mut WorkflowRun,
        guard: &ClaimGuard,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Ending {
        let tools = self.dispatcher.definitions();
        let system = prompt::system_prompt(&tools, &self.today());
        let tool_ctx = ToolContext {
            session_id: run.session_id.clone(),
            run_id: run.id.clone(),
            cancel: cancel.clone(),
        };
        let mut state = LoopState::Thinking;

        loop {
            if run.iteration >= self.settings.max_iterations {
                advance(&mut state, LoopState::Truncated);
                info!(iteration = run.iteration, "Iteration cap reached");
                return self.truncate(run, &system, guard, cancel).await;
            }
            if cancel.is_cancelled() {
                advance(&mut state, LoopState::Cancelled);
                return Ending::Cancelled;
            }

            let response = {
                let request = self.request(&system, &tools, run.messages.clone());
                let ctx = CallContext {
                    session_id: &run.session_id,
                    run_id: &run.id,
                    iteration: run.iteration,
                    cancel,
                };
                tokio::select! {
                    biased;
                    _ = guard.lost().cancelled() => return Ending::ClaimLost,
                    r = self.ask_model(&request, &ctx, progress) => r,
                }
            };
            let response = match response {
                Ok(r) => r,
                Err(LlmError::Cancelled) => {
                    advance(&mut state, LoopState::Cancelled);
                    return Ending::Cancelled;
                }
                Err(e) => {
                    advance(&mut state, LoopState::Error);
                    return Ending::Failed(e.to_string());
                }
            };
            run.record_usage(&response.usage);

            if !response.wants_tools() {
                advance(&mut state, LoopState::Complete);
                let answer = response.text();
                run.messages.push(history_message(response));
                return Ending::Complete(answer);
            }

            advance(&mut state, LoopState::Executing);
            let note = response.text();
            if !note.is_empty() {
                run.thinking.push(note.clone());
                progress.emit(ProgressEvent::Thinking { text: note });
            }
            let calls = response.tool_uses();
            for call in &calls {
                progress.emit(ProgressEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
            }
            let outcomes = tokio::select! {
                biased;
                _ = guard.lost().cancelled() => return Ending::ClaimLost,
                o = self.dispatcher.dispatch(&calls, &tool_ctx) => o,
            };
            if cancel.is_cancelled() {
                advance(&mut state, LoopState::Cancelled);
                return Ending::Cancelled;
            }

            run.messages.push(history_message(response));
            let mut results = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                progress.emit(ProgressEvent::ToolResult {
                    id: outcome.tool_use_id.clone(),
                    name: outcome.name.clone(),
                    is_error: outcome.is_error,
                });
                for query in outcome.queries {
                    progress.emit(ProgressEvent::QueryExecuted {
                        query: query.clone(),
                    });
                    run.executed_queries.push(query);
                }
                results.push(outcome.result);
            }
            run.messages.push(Message {
                role: Role::User,
                content: results,
            });
            run.iteration += 1;
            run.updated_at = self.clock.now_ms();

            match self.checkpoints.write(run, guard).await {
                CheckpointOutcome::Written => progress.emit(ProgressEvent::Checkpointed {
                    iteration: run.iteration,
                }),
                CheckpointOutcome::Failed => {}
                CheckpointOutcome::ClaimLost => return Ending::ClaimLost,
            }
            advance(&mut state, LoopState::Thinking);
        }
    }

    async fn ask_model(
        &self,
        request: &LlmRequest,
        ctx: &CallContext<'_>,
        progress: &ProgressSink,
    ) -> Result<ToolResponse, LlmError> {
        if self.settings.stream && progress.is_enabled() {
            let mut forward = |text: &str| {
                progress.emit(ProgressEvent::TextDelta {
                    text: text.to_string(),
                })
            };
            let mut restart = || progress.emit(ProgressEvent::TextReset);
            self.gateway
                .stream_tools(request, ctx, &mut forward, &mut restart)
                .await
        } else {
            self.gateway.call_tools(request, ctx).await
        }
    }

    /// Best-effort answer from what has been gathered, with no more tools.
    async fn truncate(
        &self,
        run: &mut WorkflowRun,
        system: &str,
        guard: &ClaimGuard,
        cancel: &CancellationToken,
    ) -> Ending {
        let result = {
            let request = self.request(system, &[], prompt::truncation_messages(run));
            let ctx = CallContext {
                session_id: &run.session_id,
                run_id: &run.id,
                iteration: run.iteration,
                cancel,
            };
            tokio::select! {
                biased;
                _ = guard.lost().cancelled() => return Ending::ClaimLost,
                r = self.gateway.complete(&request, &ctx) => r,
            }
        };
        let answer = match result {
            Ok(completion) => {
                run.record_usage(&completion.usage);
                if completion.text.trim().is_empty() {
                    prompt::fallback_answer(run)
                } else {
                    completion.text
                }
            }
            Err(LlmError::Cancelled) => return Ending::Cancelled,
            Err(e) => {
                warn!("Synthesis after truncation failed, using fallback: {}", e);
                prompt::fallback_answer(run)
            }
        };
        run.messages.push(Message::assistant(answer.clone()));
        Ending::Truncated(answer)
    }

    fn request(&self, system: &str, tools: &[ToolDefinition], messages: Vec<Message>) -> LlmRequest {
        LlmRequest {
            system: system.to_string(),
            tools: tools.to_vec(),
            messages,
            max_tokens: self.settings.max_tokens,
        }
    }

    fn today(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.clock.now_ms())
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }
}

/// The assistant turn as it is kept in history and replayed to the model.
/// Tool input that arrived as unparsed text is replaced by an object, since
/// the API rejects anything else in `tool_use.input`.
fn history_message(response: ToolResponse) -> Message {
    let mut message = response.into_message();
    for block in &mut message.content {
        if let ContentBlock::ToolUse { input, .. } = block
            && !input.is_object()
        {
            *input = history_input(input);
        }
    }
    message
}

fn settle(run: &mut WorkflowRun, answer: &str, truncated: bool) {
    let (answer, follow_ups) = prompt::split_follow_ups(answer);
    let state = if truncated {
        LoopState::Truncated
    } else {
        LoopState::Complete
    };
    run.status = state.run_status();
    run.answer = Some(answer);
    run.follow_ups = follow_ups;
    run.truncated = truncated;
}
