pub mod docs;
pub mod query;
pub mod repair;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::llm::{ContentBlock, ToolDefinition, ToolUse};
use crate::core::workflow::types::ExecutedQuery;

pub use docs::{DocumentReader, FsDocumentReader, ReadDocsTool};
pub use query::{HttpQueryBackend, QueryBackend, QueryTool};
pub use repair::{QueryRequest, ToolInputError, parse_query_requests};

/// Per-run context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub run_id: String,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    pub queries: Vec<ExecutedQuery>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },
    #[error(transparent)]
    InvalidInput(#[from] ToolInputError),
    #[error("{0}")]
    Backend(String),
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool call cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!("Tool '{}' registered twice; keeping the latest", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool descriptions for the model, sorted by name so prompts are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

/// Result of one tool invocation, ready to be appended to history.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub tool_use_id: String,
    pub name: String,
    pub result: ContentBlock,
    pub is_error: bool,
    pub queries: Vec<ExecutedQuery>,
}

impl ToolCallOutcome {
    fn failed(call: &ToolUse, message: String) -> Self {
        Self {
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            result: ContentBlock::tool_error(&call.id, message),
            is_error: true,
            queries: Vec::new(),
        }
    }
}

/// Runs one model turn's tool calls concurrently and hands results back in
/// request order, one per call, whatever happened to the individual tools.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    pub async fn dispatch(&self, calls: &[ToolUse], ctx: &ToolContext) -> Vec<ToolCallOutcome> {
        let mut slots: Vec<ToolCallOutcome> = calls
            .iter()
            .map(|c| ToolCallOutcome::failed(c, "Error: tool execution was aborted".to_string()))
            .collect();

        let mut set = JoinSet::new();
        for (idx, call) in calls.iter().enumerate() {
            let Some(tool) = self.registry.get(&call.name) else {
                slots[idx] = ToolCallOutcome::failed(
                    call,
                    format!(
                        "Error: {}. Available tools: {}",
                        ToolError::UnknownTool {
                            name: call.name.clone()
                        },
                        self.registry.names().join(", ")
                    ),
                );
                continue;
            };
            let call = call.clone();
            let ctx = ctx.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let outcome = run_one(tool, &call, &ctx, timeout).await;
                (idx, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = outcome,
                Err(e) => warn!("Tool task did not complete: {}", e),
            }
        }
        slots
    }
}

async fn run_one(
    tool: Arc<dyn Tool>,
    call: &ToolUse,
    ctx: &ToolContext,
    timeout: Duration,
) -> ToolCallOutcome {
    debug!(tool = %call.name, id = %call.id, "executing tool");
    let result = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
        r = tokio::time::timeout(timeout, tool.execute(call.input.clone(), ctx)) => {
            r.unwrap_or(Err(ToolError::Timeout(timeout)))
        }
    };
    match result {
        Ok(mut output) => {
            for q in &mut output.queries {
                q.tool_use_id = call.id.clone();
            }
            ToolCallOutcome {
                tool_use_id: call.id.clone(),
                name: call.name.clone(),
                result: ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: output.content,
                    is_error: output.is_error,
                },
                is_error: output.is_error,
                queries: output.queries,
            }
        }
        Err(e) => {
            warn!(tool = %call.name, id = %call.id, "tool failed: {}", e);
            ToolCallOutcome::failed(call, format!("Error: {}", e))
        }
    }
}
