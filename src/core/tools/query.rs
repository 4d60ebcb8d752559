use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::repair::{QueryRequest, parse_query_requests};
use super::{Tool, ToolContext, ToolError, ToolOutput};
use crate::core::retry::{RetryClass, RetryPolicy, Retryable, retry_with_backoff};
use crate::core::workflow::types::{CellValue, Dialect, ExecutedQuery, QueryResult};

/// What a backend hands back for one query. A non-empty `error` is a
/// query-level failure (bad syntax, missing table) and is shown to the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawQueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: Option<usize>,
    pub error: Option<String>,
}

#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// `Err` means the backend could not be reached at all.
    async fn run(&self, query: &str, cancel: &CancellationToken) -> Result<RawQueryResult, ToolError>;
}

pub struct QueryTool {
    dialect: Dialect,
    backend: Arc<dyn QueryBackend>,
    max_rows: usize,
}

impl QueryTool {
    pub fn new(dialect: Dialect, backend: Arc<dyn QueryBackend>, max_rows: usize) -> Self {
        Self {
            dialect,
            backend,
            max_rows: max_rows.max(1),
        }
    }

    async fn run_one(
        dialect: Dialect,
        backend: Arc<dyn QueryBackend>,
        request: QueryRequest,
        max_rows: usize,
        cancel: CancellationToken,
    ) -> ExecutedQuery {
        let started = Instant::now();
        let raw = match backend.run(&request.query, &cancel).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(dialect = dialect.as_str(), "query backend failed: {}", e);
                RawQueryResult {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        let result = normalize(raw, max_rows);
        ExecutedQuery {
            tool_use_id: String::new(),
            dialect,
            question: request.question,
            query: request.query,
            result,
            duration_ms: started.elapsed().as_millis() as u64,
            executed_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &str {
        match self.dialect {
            Dialect::Sql => "execute_sql",
            Dialect::Cypher => "execute_cypher",
        }
    }

    fn description(&self) -> &str {
        match self.dialect {
            Dialect::Sql => {
                "Run one or more read-only SQL queries against the analytical database. \
                 Each entry pairs the question it answers with the SQL text. \
                 Independent queries run in parallel."
            }
            Dialect::Cypher => {
                "Run one or more read-only Cypher queries against the graph database. \
                 Each entry pairs the question it answers with the Cypher text. \
                 Independent queries run in parallel."
            }
        }
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "queries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": {"type": "string", "description": "What this query answers"},
                            "query": {"type": "string", "description": format!("{} query text", self.dialect.as_str())}
                        },
                        "required": ["question", "query"]
                    }
                }
            },
            "required": ["queries"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let requests = parse_query_requests(&input)?;
        debug!(
            dialect = self.dialect.as_str(),
            count = requests.len(),
            "dispatching sub-queries"
        );

        let mut slots: Vec<Option<ExecutedQuery>> = vec![None; requests.len()];
        let mut set = JoinSet::new();
        for (idx, request) in requests.iter().cloned().enumerate() {
            let backend = self.backend.clone();
            let dialect = self.dialect;
            let max_rows = self.max_rows;
            let cancel = ctx.cancel.clone();
            set.spawn(async move {
                let q = Self::run_one(dialect, backend, request, max_rows, cancel).await;
                (idx, q)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, q)) => slots[idx] = Some(q),
                Err(e) => warn!("sub-query task did not complete: {}", e),
            }
        }
        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let queries: Vec<ExecutedQuery> = slots
            .into_iter()
            .zip(requests)
            .map(|(slot, request)| {
                slot.unwrap_or_else(|| ExecutedQuery {
                    tool_use_id: String::new(),
                    dialect: self.dialect,
                    question: request.question,
                    query: request.query,
                    result: QueryResult {
                        error: Some("query execution was aborted".to_string()),
                        ..Default::default()
                    },
                    duration_ms: 0,
                    executed_at: chrono::Utc::now().timestamp_millis(),
                })
            })
            .collect();

        let content = render(&queries, self.dialect);
        let is_error = queries.iter().all(|q| q.result.is_error());
        Ok(ToolOutput {
            content,
            is_error,
            queries,
        })
    }
}

fn normalize(raw: RawQueryResult, max_rows: usize) -> QueryResult {
    let row_count = raw.row_count.unwrap_or(raw.rows.len());
    let rows: Vec<Vec<Value>> = raw
        .rows
        .into_iter()
        .map(|row| row.into_iter().map(CellValue::into_json).collect())
        .collect();
    let mut result = QueryResult {
        columns: raw.columns,
        rows,
        row_count,
        formatted: String::new(),
        error: raw.error.filter(|e| !e.is_empty()),
    };
    result.formatted = match &result.error {
        Some(e) => format!("Error: {}", e),
        None => format_table(&result.columns, &result.rows, row_count, max_rows),
    };
    result
}

/// Pipe table with at most `max_rows` body rows.
pub fn format_table(columns: &[String], rows: &[Vec<Value>], row_count: usize, max_rows: usize) -> String {
    if columns.is_empty() && rows.is_empty() {
        return "(no rows)".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "| {} |", columns.join(" | "));
    let _ = writeln!(
        out,
        "|{}|",
        columns.iter().map(|_| "---").collect::<Vec<_>>().join("|")
    );
    for row in rows.iter().take(max_rows) {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        let _ = writeln!(out, "| {} |", cells.join(" | "));
    }
    if row_count > max_rows {
        let _ = writeln!(out, "({} rows total, showing first {})", row_count, max_rows);
    } else {
        let _ = writeln!(out, "({} rows)", row_count);
    }
    out.trim_end().to_string()
}

fn cell_text(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.replace('|', "\\|").replace('\n', " "),
        other => other.to_string(),
    }
}

fn render(queries: &[ExecutedQuery], dialect: Dialect) -> String {
    let mut out = String::new();
    for (i, q) in queries.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        let _ = writeln!(out, "### Query {}: {}", i + 1, q.question);
        let _ = writeln!(out, "```{}\n{}\n```", dialect.as_str(), q.query.trim());
        out.push_str(&q.result.formatted);
    }
    out
}

// ── HTTP backend ──

#[derive(Serialize)]
struct WireQuery<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct WireResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
    row_count: Option<usize>,
    error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum BackendError {
    #[error("query backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("query backend returned HTTP {0}")]
    Status(u16),
    #[error("query cancelled")]
    Cancelled,
}

impl Retryable for BackendError {
    fn retry_class(&self) -> RetryClass {
        match self {
            BackendError::Transport(_) => RetryClass::Transient,
            BackendError::Status(code) if *code == 429 || *code >= 500 => RetryClass::Transient,
            _ => RetryClass::Permanent,
        }
    }

    fn cancelled() -> Self {
        BackendError::Cancelled
    }
}

/// Posts `{"query": ...}` to a query service and reads back
/// `{columns, rows, row_count, error}`.
pub struct HttpQueryBackend {
    url: String,
    client: Client,
    retry: RetryPolicy,
}

impl HttpQueryBackend {
    pub fn new(url: impl Into<String>, retry: RetryPolicy, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            url: url.into(),
            client,
            retry,
        }
    }

    async fn post(&self, query: &str) -> Result<WireResult, BackendError> {
        let res = self
            .client
            .post(&self.url)
            .json(&WireQuery { query })
            .send()
            .await?;
        let status = res.status();
        // Query services report bad queries in the body, often with a 4xx.
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(BackendError::Status(status.as_u16()));
        }
        match res.json::<WireResult>().await {
            Ok(body) => Ok(body),
            Err(_) if !status.is_success() => Err(BackendError::Status(status.as_u16())),
            Err(e) => Err(e.into()),
        }
    }
}

/// JSON cannot carry NaN or infinities, so services spell them as strings.
/// Those spellings are read as numbers only in columns that otherwise hold
/// numbers; in any other column they stay text.
fn wire_rows(rows: Vec<Vec<Value>>) -> Vec<Vec<CellValue>> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let numeric: Vec<bool> = (0..width)
        .map(|col| {
            let mut saw_number = false;
            for row in &rows {
                match row.get(col) {
                    Some(Value::Number(_)) => saw_number = true,
                    Some(Value::String(s)) if non_finite(s).is_some() => {}
                    None | Some(Value::Null) => {}
                    Some(_) => return false,
                }
            }
            saw_number
        })
        .collect();
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .map(|(col, v)| wire_cell(v, numeric[col]))
                .collect()
        })
        .collect()
}

fn non_finite(s: &str) -> Option<f64> {
    match s {
        "NaN" => Some(f64::NAN),
        "Infinity" | "inf" => Some(f64::INFINITY),
        "-Infinity" | "-inf" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

fn wire_cell(v: Value, numeric: bool) -> CellValue {
    match v {
        Value::Null => CellValue::Null,
        Value::Bool(b) => CellValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CellValue::Int(i),
            None => CellValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => match non_finite(&s) {
            Some(f) if numeric => CellValue::Float(f),
            _ => CellValue::Text(s),
        },
        other => CellValue::Text(other.to_string()),
    }
}

#[async_trait]
impl QueryBackend for HttpQueryBackend {
    async fn run(&self, query: &str, cancel: &CancellationToken) -> Result<RawQueryResult, ToolError> {
        let body = retry_with_backoff(&self.retry, cancel, "query backend", |_| self.post(query))
            .await
            .map_err(|e| match e {
                BackendError::Cancelled => ToolError::Cancelled,
                other => ToolError::Backend(other.to_string()),
            })?;
        Ok(RawQueryResult {
            columns: body.columns,
            rows: wire_rows(body.rows),
            row_count: body.row_count,
            error: body.error,
        })
    }
}
