use serde::Serialize;
use tokio::sync::mpsc;

use super::types::{ExecutedQuery, RunReport};

/// Intermediate events for a caller that wants to render a run as it happens.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted { run_id: String, iteration: u32 },
    TextDelta { text: String },
    /// Text streamed since the last model call started came from an
    /// attempt that failed; the retry streams its answer again.
    TextReset,
    Thinking { text: String },
    ToolCall { id: String, name: String },
    ToolResult { id: String, name: String, is_error: bool },
    QueryExecuted { query: ExecutedQuery },
    Checkpointed { iteration: u32 },
    Completed { report: RunReport },
    Failed { message: String },
    Cancelled,
}

/// Optional event channel. Sending never waits, and a dropped receiver is
/// ignored so a vanished UI cannot stall a run.
#[derive(Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

impl From<mpsc::UnboundedSender<ProgressEvent>> for ProgressSink {
    fn from(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }
}
