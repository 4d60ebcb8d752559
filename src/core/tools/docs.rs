use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use super::{Tool, ToolContext, ToolError, ToolOutput};

static PAGE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+$").unwrap());

#[async_trait]
pub trait DocumentReader: Send + Sync {
    /// `Ok(None)` when the page does not exist.
    async fn read(&self, page: &str) -> Result<Option<String>, ToolError>;
    async fn list(&self) -> Result<Vec<String>, ToolError>;
}

/// Serves `<root>/<page>.md`.
pub struct FsDocumentReader {
    root: PathBuf,
}

impl FsDocumentReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentReader for FsDocumentReader {
    async fn read(&self, page: &str) -> Result<Option<String>, ToolError> {
        let path = self.root.join(format!("{}.md", page));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ToolError::Backend(format!("failed to read page: {}", e))),
        }
    }

    async fn list(&self) -> Result<Vec<String>, ToolError> {
        let mut pages = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pages),
            Err(e) => return Err(ToolError::Backend(format!("failed to list pages: {}", e))),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && PAGE_ID.is_match(stem)
            {
                pages.push(stem.to_string());
            }
        }
        pages.sort();
        Ok(pages)
    }
}

pub struct ReadDocsTool {
    reader: Arc<dyn DocumentReader>,
}

impl ReadDocsTool {
    pub fn new(reader: Arc<dyn DocumentReader>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl Tool for ReadDocsTool {
    fn name(&self) -> &str {
        "read_docs"
    }

    fn description(&self) -> &str {
        "Read a page of the data documentation (schemas, metric definitions, caveats). \
         Call with page \"index\" to list available pages."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "page": {"type": "string", "description": "Page id, letters, digits and dashes only"}
            },
            "required": ["page"]
        })
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let page = match &input {
            Value::String(s) => s.trim(),
            other => other
                .get("page")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default(),
        };
        if !PAGE_ID.is_match(page) {
            return Ok(ToolOutput {
                content: format!("Error: invalid page id '{}'", page),
                is_error: true,
                queries: Vec::new(),
            });
        }

        if let Some(text) = self.reader.read(page).await? {
            return Ok(ToolOutput::text(text));
        }
        let pages = self.reader.list().await?;
        if page == "index" {
            return Ok(ToolOutput::text(format!("Available pages: {}", pages.join(", "))));
        }
        Ok(ToolOutput {
            content: format!(
                "Error: page '{}' not found. Available pages: {}",
                page,
                pages.join(", ")
            ),
            is_error: true,
            queries: Vec::new(),
        })
    }
}
