mod recovery;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::claim::ManualClock;
use crate::core::config::EngineConfig;
use crate::core::llm::{
    Completion, ContentBlock, LlmError, LlmProvider, LlmRequest, StopReason, TextCallback,
    TokenUsage, ToolResponse,
};
use crate::core::retry::RetryPolicy;
use crate::core::store::{RunStore, SqliteRunStore};
use crate::core::telemetry::RecordingSink;
use crate::core::tools::query::RawQueryResult;
use crate::core::tools::{
    DocumentReader, QueryBackend, QueryTool, ReadDocsTool, ToolError, ToolRegistry,
};
use crate::core::workflow::types::{CellValue, Dialect};
use crate::core::workflow::Runner;

pub(super) const START_MS: i64 = 1_700_000_000_000;

/// Plays back canned model turns and remembers every request it saw.
pub(super) struct ScriptedProvider {
    turns: Mutex<VecDeque<ToolResponse>>,
    fallback: Option<ToolResponse>,
    synthesis: Result<String, fn() -> LlmError>,
    delay: Duration,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ToolResponse>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            fallback: None,
            synthesis: Ok("Partial answer from what was gathered.".to_string()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Returned once the scripted turns run out.
    pub fn repeating(mut self, turn: ToolResponse) -> Self {
        self.fallback = Some(turn);
        self
    }

    pub fn failing_synthesis(mut self, error: fn() -> LlmError) -> Self {
        self.synthesis = Err(error);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn seen(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.synthesis {
            Ok(text) => Ok(Completion {
                text: text.clone(),
                usage: synthesis_usage(),
            }),
            Err(make) => Err(make()),
        }
    }

    async fn complete_with_tools(&self, request: &LlmRequest) -> Result<ToolResponse, LlmError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.requests.lock().unwrap().push(request.clone());
        let next = self.turns.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| LlmError::InvalidRequest("script exhausted".into()))
    }

    async fn stream_with_tools(
        &self,
        request: &LlmRequest,
        on_text: TextCallback<'_>,
    ) -> Result<ToolResponse, LlmError> {
        let response = self.complete_with_tools(request).await?;
        for word in response.text().split_inclusive(' ') {
            on_text(word);
        }
        Ok(response)
    }
}

pub(super) fn usage() -> TokenUsage {
    TokenUsage {
        input_tokens: 100,
        output_tokens: 20,
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: 80,
    }
}

pub(super) fn synthesis_usage() -> TokenUsage {
    TokenUsage {
        input_tokens: 300,
        output_tokens: 40,
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: 0,
    }
}

pub(super) fn answer(text: &str) -> ToolResponse {
    ToolResponse {
        stop_reason: StopReason::EndTurn,
        content: vec![ContentBlock::text(text)],
        usage: usage(),
    }
}

pub(super) fn tool_turn(note: &str, calls: Vec<(&str, &str, Value)>) -> ToolResponse {
    let mut content = Vec::new();
    if !note.is_empty() {
        content.push(ContentBlock::text(note));
    }
    for (id, name, input) in calls {
        content.push(ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        });
    }
    ToolResponse {
        stop_reason: StopReason::ToolUse,
        content,
        usage: usage(),
    }
}

/// Queries containing "bad" fail; "slow" ones take a while; the rest return
/// one row holding the query length.
pub(super) struct MemoryBackend;

#[async_trait]
impl QueryBackend for MemoryBackend {
    async fn run(&self, query: &str, _cancel: &CancellationToken) -> Result<RawQueryResult, ToolError> {
        if query.contains("slow") {
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        if query.contains("bad") {
            return Ok(RawQueryResult {
                error: Some("no such table: bad".to_string()),
                ..Default::default()
            });
        }
        Ok(RawQueryResult {
            columns: vec!["len".to_string()],
            rows: vec![vec![CellValue::Int(query.len() as i64)]],
            row_count: Some(1),
            error: None,
        })
    }
}

pub(super) struct StaticDocs;

#[async_trait]
impl DocumentReader for StaticDocs {
    async fn read(&self, page: &str) -> Result<Option<String>, ToolError> {
        Ok((page == "orders").then(|| "orders(id, placed_at, total)".to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, ToolError> {
        Ok(vec!["orders".to_string()])
    }
}

pub(super) fn registry(sql: Arc<dyn QueryBackend>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(QueryTool::new(Dialect::Sql, sql, 20)));
    registry.register(Arc::new(ReadDocsTool::new(Arc::new(StaticDocs))));
    registry
}

pub(super) fn config(max_iterations: u32) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.run_loop.max_iterations = max_iterations;
    config.retry = RetryPolicy {
        max_attempts: 2,
        base_ms: 1,
        factor: 1.0,
        jitter: 0.0,
        cap_ms: 1,
    };
    config
}

pub(super) struct Harness {
    pub runner: Arc<Runner>,
    pub store: Arc<SqliteRunStore>,
    pub provider: Arc<ScriptedProvider>,
    pub telemetry: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(provider: ScriptedProvider, max_iterations: u32) -> Self {
        Self::with_backend(provider, max_iterations, Arc::new(MemoryBackend))
    }

    pub fn with_backend(
        provider: ScriptedProvider,
        max_iterations: u32,
        sql: Arc<dyn QueryBackend>,
    ) -> Self {
        let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
        Self::on_store(store, provider, max_iterations, sql, Arc::new(ManualClock::new(START_MS)))
    }

    pub fn on_store(
        store: Arc<SqliteRunStore>,
        provider: ScriptedProvider,
        max_iterations: u32,
        sql: Arc<dyn QueryBackend>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let provider = Arc::new(provider);
        let telemetry = Arc::new(RecordingSink::default());
        let runner = Runner::assemble(
            &config(max_iterations),
            provider.clone(),
            store.clone() as Arc<dyn RunStore>,
            registry(sql),
            clock.clone(),
            telemetry.clone(),
        );
        Self {
            runner: Arc::new(runner),
            store,
            provider,
            telemetry,
            clock,
        }
    }
}
