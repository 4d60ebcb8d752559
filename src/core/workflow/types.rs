use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::llm::{Message, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }
}

/// Derived label used for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    DataAnalysis,
    Conversational,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::DataAnalysis => "data-analysis",
            Classification::Conversational => "conversational",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Sql,
    Cypher,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Sql => "sql",
            Dialect::Cypher => "cypher",
        }
    }
}

/// A cell as produced by a query backend, before it is made JSON-safe.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    /// NaN and infinities have no JSON form; they become null.
    pub fn into_json(self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(b),
            CellValue::Int(i) => Value::from(i),
            CellValue::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub formatted: String,
    pub error: Option<String>,
}

impl QueryResult {
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// One dispatched sub-query and what came back. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedQuery {
    pub tool_use_id: String,
    pub dialect: Dialect,
    pub question: String,
    pub query: String,
    pub result: QueryResult,
    pub duration_ms: u64,
    pub executed_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub llm_calls: u64,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub session_id: String,
    pub question: String,
    pub status: RunStatus,
    pub iteration: u32,
    pub messages: Vec<Message>,
    pub thinking: Vec<String>,
    pub executed_queries: Vec<ExecutedQuery>,
    pub answer: Option<String>,
    pub follow_ups: Vec<String>,
    pub truncated: bool,
    pub metrics: RunMetrics,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub started_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

impl WorkflowRun {
    /// A fresh run whose history is `history` followed by the question.
    pub fn new(session_id: &str, question: &str, history: Vec<Message>, now_ms: i64) -> Self {
        let mut messages = history;
        messages.push(Message::user(question));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            question: question.to_string(),
            status: RunStatus::Running,
            iteration: 0,
            messages,
            thinking: Vec::new(),
            executed_queries: Vec::new(),
            answer: None,
            follow_ups: Vec::new(),
            truncated: false,
            metrics: RunMetrics::default(),
            claimed_by: None,
            claimed_at: None,
            started_at: now_ms,
            updated_at: now_ms,
            completed_at: None,
            error: None,
        }
    }

    pub fn classification(&self) -> Classification {
        if self.executed_queries.is_empty() {
            Classification::Conversational
        } else {
            Classification::DataAnalysis
        }
    }

    pub fn query_error_count(&self) -> usize {
        self.executed_queries
            .iter()
            .filter(|q| q.result.is_error())
            .count()
    }

    pub fn record_usage(&mut self, usage: &TokenUsage) {
        self.metrics.llm_calls += 1;
        self.metrics.usage.add(usage);
    }
}

/// Shown to users whenever a run fails, whatever the cause.
pub const GENERIC_FAILURE: &str =
    "Sorry, something went wrong while answering this question. Please try again.";

/// What a caller gets back once a run reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub session_id: String,
    pub status: RunStatus,
    pub answer: Option<String>,
    pub truncated: bool,
    pub follow_ups: Vec<String>,
    pub executed_queries: usize,
    pub query_errors: usize,
    pub classification: Classification,
    pub metrics: RunMetrics,
}

impl RunReport {
    pub fn from_run(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id.clone(),
            session_id: run.session_id.clone(),
            status: run.status,
            answer: run.answer.clone(),
            truncated: run.truncated,
            follow_ups: run.follow_ups.clone(),
            executed_queries: run.executed_queries.len(),
            query_errors: run.query_error_count(),
            classification: run.classification(),
            metrics: run.metrics,
        }
    }

    /// Text safe to show an end user.
    pub fn user_message(&self) -> &str {
        match self.status {
            RunStatus::Completed => self.answer.as_deref().unwrap_or(""),
            RunStatus::Cancelled => "The request was cancelled.",
            RunStatus::Failed => GENERIC_FAILURE,
            RunStatus::Running => "This question is still being answered.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::from_status(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::from_status("canceled"), None);
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(CellValue::Float(f64::NAN).into_json(), Value::Null);
        assert_eq!(CellValue::Float(f64::INFINITY).into_json(), Value::Null);
        assert_eq!(CellValue::Float(f64::NEG_INFINITY).into_json(), Value::Null);
        assert_eq!(CellValue::Float(1.5).into_json(), serde_json::json!(1.5));
        assert_eq!(CellValue::Int(7).into_json(), serde_json::json!(7));
    }

    #[test]
    fn classification_follows_executed_queries() {
        let mut run = WorkflowRun::new("s", "hello", vec![], 0);
        assert_eq!(run.classification(), Classification::Conversational);
        assert_eq!(run.messages.len(), 1);
        run.executed_queries.push(ExecutedQuery {
            tool_use_id: "t".into(),
            dialect: Dialect::Sql,
            question: "q".into(),
            query: "SELECT 1".into(),
            result: QueryResult {
                error: Some("syntax error".into()),
                ..Default::default()
            },
            duration_ms: 1,
            executed_at: 0,
        });
        assert_eq!(run.classification(), Classification::DataAnalysis);
        assert_eq!(run.query_error_count(), 1);
    }

    #[test]
    fn history_precedes_the_question() {
        let run = WorkflowRun::new(
            "s",
            "and now?",
            vec![Message::user("before"), Message::assistant("reply")],
            5,
        );
        assert_eq!(run.messages.len(), 3);
        assert_eq!(run.messages[2].text(), "and now?");
        assert_eq!(run.started_at, 5);
    }
}
