use std::sync::Mutex;
use tracing::info;

use crate::core::llm::TokenUsage;
use crate::core::workflow::types::{Classification, RunStatus};

#[derive(Debug, Clone)]
pub struct LlmCallRecord {
    pub provider: String,
    pub model: String,
    pub session_id: String,
    pub run_id: String,
    pub iteration: u32,
    pub streaming: bool,
    pub duration_ms: u64,
    pub usage: TokenUsage,
    pub success: bool,
    pub error_class: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub session_id: String,
    pub status: RunStatus,
    pub truncated: bool,
    pub llm_calls: u64,
    pub queries_executed: usize,
    pub query_errors: usize,
    pub classification: Classification,
    pub duration_ms: u64,
}

/// Destination for per-call and per-run measurements. The engine only
/// reports; aggregation belongs to whatever collector sits behind the sink.
pub trait TelemetrySink: Send + Sync {
    fn record_llm_call(&self, record: &LlmCallRecord);
    fn record_run(&self, summary: &RunSummary);
}

/// Emits measurements as structured tracing events.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_llm_call(&self, r: &LlmCallRecord) {
        info!(
            target: "dataloop::telemetry",
            provider = %r.provider,
            model = %r.model,
            session_id = %r.session_id,
            run_id = %r.run_id,
            iteration = r.iteration,
            streaming = r.streaming,
            duration_ms = r.duration_ms,
            input_tokens = r.usage.input_tokens,
            output_tokens = r.usage.output_tokens,
            cache_creation_input_tokens = r.usage.cache_creation_input_tokens,
            cache_read_input_tokens = r.usage.cache_read_input_tokens,
            success = r.success,
            error_class = r.error_class.unwrap_or("none"),
            "llm_call"
        );
    }

    fn record_run(&self, s: &RunSummary) {
        info!(
            target: "dataloop::telemetry",
            run_id = %s.run_id,
            session_id = %s.session_id,
            status = s.status.as_str(),
            truncated = s.truncated,
            llm_calls = s.llm_calls,
            queries_executed = s.queries_executed,
            query_errors = s.query_errors,
            classification = s.classification.as_str(),
            duration_ms = s.duration_ms,
            "run_finished"
        );
    }
}

/// Keeps every record in memory; handy for embedding hosts and tests.
#[derive(Default)]
pub struct RecordingSink {
    pub calls: Mutex<Vec<LlmCallRecord>>,
    pub runs: Mutex<Vec<RunSummary>>,
}

impl TelemetrySink for RecordingSink {
    fn record_llm_call(&self, record: &LlmCallRecord) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(record.clone());
        }
    }

    fn record_run(&self, summary: &RunSummary) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(summary.clone());
        }
    }
}
