//! Assembly of a streamed Messages API response.
//!
//! The stream is a sequence of server-sent events. Text deltas are handed to
//! the caller as they arrive; tool-use inputs arrive as partial JSON strings
//! and are only parsed once their block closes.

use serde_json::Value;
use tracing::debug;

use super::{ContentBlock, LlmError, StopReason, TokenUsage, ToolResponse};

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        initial: Value,
        json: String,
    },
    Skipped,
}

#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: Vec<u8>,
    blocks: Vec<PartialBlock>,
    stop_reason: Option<StopReason>,
    usage: TokenUsage,
    finished: bool,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the response body. Complete events are processed
    /// immediately; a trailing partial event stays buffered.
    pub fn feed(&mut self, chunk: &[u8], on_text: &mut (dyn FnMut(&str) + Send)) -> Result<(), LlmError> {
        self.buffer.extend_from_slice(chunk);
        while let Some((end, sep_len)) = find_event_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + sep_len).collect();
            let event = String::from_utf8_lossy(&raw[..end]).to_string();
            self.handle_event(&event, on_text)?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn finish(mut self) -> Result<ToolResponse, LlmError> {
        if !self.buffer.is_empty() {
            let rest = String::from_utf8_lossy(&self.buffer).to_string();
            self.buffer.clear();
            if !rest.trim().is_empty() {
                self.handle_event(&rest, &mut |_| {})?;
            }
        }
        let stop_reason = self
            .stop_reason
            .ok_or_else(|| LlmError::Decode("stream ended without a stop reason".to_string()))?;

        let content = self
            .blocks
            .into_iter()
            .filter_map(|b| match b {
                PartialBlock::Text(text) => Some(ContentBlock::Text { text }),
                PartialBlock::ToolUse {
                    id,
                    name,
                    initial,
                    json,
                } => {
                    let input = if json.trim().is_empty() {
                        initial
                    } else {
                        // Keep unparseable arguments verbatim; the repair
                        // pipeline gets a chance at them later.
                        serde_json::from_str(&json).unwrap_or(Value::String(json))
                    };
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                PartialBlock::Skipped => None,
            })
            .collect();

        Ok(ToolResponse {
            stop_reason,
            content,
            usage: self.usage,
        })
    }

    fn handle_event(
        &mut self,
        event: &str,
        on_text: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), LlmError> {
        let data: String = event
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|l| l.trim_start())
            .collect::<Vec<_>>()
            .join("\n");
        if data.is_empty() {
            return Ok(());
        }
        let v: Value = serde_json::from_str(&data)
            .map_err(|e| LlmError::Decode(format!("bad stream event: {}", e)))?;

        match v["type"].as_str().unwrap_or_default() {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    self.merge_usage(usage);
                }
            }
            "content_block_start" => {
                let index = block_index(&v)?;
                let block = &v["content_block"];
                let partial = match block["type"].as_str() {
                    Some("text") => {
                        let text = block["text"].as_str().unwrap_or_default().to_string();
                        if !text.is_empty() {
                            on_text(&text);
                        }
                        PartialBlock::Text(text)
                    }
                    Some("tool_use") => PartialBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        initial: block.get("input").cloned().unwrap_or(Value::Object(Default::default())),
                        json: String::new(),
                    },
                    other => {
                        debug!("skipping stream block of type {:?}", other);
                        PartialBlock::Skipped
                    }
                };
                while self.blocks.len() <= index {
                    self.blocks.push(PartialBlock::Skipped);
                }
                self.blocks[index] = partial;
            }
            "content_block_delta" => {
                let index = block_index(&v)?;
                let delta = &v["delta"];
                match (self.blocks.get_mut(index), delta["type"].as_str()) {
                    (Some(PartialBlock::Text(text)), Some("text_delta")) => {
                        let fragment = delta["text"].as_str().unwrap_or_default();
                        text.push_str(fragment);
                        if !fragment.is_empty() {
                            on_text(fragment);
                        }
                    }
                    (Some(PartialBlock::ToolUse { json, .. }), Some("input_json_delta")) => {
                        json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = v["delta"].get("stop_reason").filter(|r| !r.is_null()) {
                    self.stop_reason = Some(
                        serde_json::from_value(reason.clone()).unwrap_or(StopReason::Other),
                    );
                }
                if let Some(usage) = v.get("usage") {
                    self.merge_usage(usage);
                }
            }
            "message_stop" => self.finished = true,
            "error" => {
                let kind = v["error"]["type"].as_str().unwrap_or_default();
                let message = v["error"]["message"].as_str().unwrap_or_default().to_string();
                return Err(match kind {
                    "overloaded_error" => LlmError::Overloaded,
                    "rate_limit_error" => LlmError::RateLimited,
                    "authentication_error" | "permission_error" => LlmError::Auth(message),
                    "invalid_request_error" => LlmError::InvalidRequest(message),
                    _ => LlmError::Api {
                        status: 500,
                        message,
                    },
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// Later usage reports carry cumulative counts, so the maximum wins.
    fn merge_usage(&mut self, usage: &Value) {
        let read = |key: &str| usage.get(key).and_then(Value::as_u64);
        if let Some(n) = read("input_tokens") {
            self.usage.input_tokens = self.usage.input_tokens.max(n);
        }
        if let Some(n) = read("output_tokens") {
            self.usage.output_tokens = self.usage.output_tokens.max(n);
        }
        if let Some(n) = read("cache_creation_input_tokens") {
            self.usage.cache_creation_input_tokens = self.usage.cache_creation_input_tokens.max(n);
        }
        if let Some(n) = read("cache_read_input_tokens") {
            self.usage.cache_read_input_tokens = self.usage.cache_read_input_tokens.max(n);
        }
    }
}

fn block_index(v: &Value) -> Result<usize, LlmError> {
    v["index"]
        .as_u64()
        .map(|i| i as usize)
        .ok_or_else(|| LlmError::Decode("stream event without block index".to_string()))
}

fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, data: Value) -> String {
        format!("event: {}\ndata: {}\n\n", name, data)
    }

    fn tool_stream(partial_json: &[&str]) -> String {
        let mut s = String::new();
        s.push_str(&event(
            "message_start",
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 40, "output_tokens": 1, "cache_read_input_tokens": 12}}}),
        ));
        s.push_str(&event(
            "content_block_start",
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        ));
        s.push_str(&event(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Let me "}}),
        ));
        s.push_str(&event(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "check."}}),
        ));
        s.push_str(&event(
            "content_block_start",
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "tu_1", "name": "execute_sql", "input": {}}}),
        ));
        for part in partial_json {
            s.push_str(&event(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": part}}),
            ));
        }
        s.push_str(&event(
            "message_delta",
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 31}}),
        ));
        s.push_str(&event("message_stop", json!({"type": "message_stop"})));
        s
    }

    #[test]
    fn assembles_text_and_tool_use_from_fragments() {
        let stream = tool_stream(&[r#"{"queries": [{"question": "q", "#, r#""query": "SELECT 1"}]}"#]);
        let mut acc = SseAccumulator::new();
        let mut seen = Vec::new();
        // Feed in awkward slices to exercise buffering across event boundaries.
        for chunk in stream.as_bytes().chunks(7) {
            acc.feed(chunk, &mut |t| seen.push(t.to_string())).unwrap();
        }
        assert!(acc.is_finished());
        let resp = acc.finish().unwrap();

        assert_eq!(seen.concat(), "Let me check.");
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.text(), "Let me check.");
        let uses = resp.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].name, "execute_sql");
        assert_eq!(uses[0].input["queries"][0]["query"], "SELECT 1");
        assert_eq!(resp.usage.input_tokens, 40);
        assert_eq!(resp.usage.output_tokens, 31);
        assert_eq!(resp.usage.cache_read_input_tokens, 12);
    }

    #[test]
    fn malformed_tool_json_is_kept_as_raw_string() {
        let stream = tool_stream(&[r#"{"queries": "[{\"question\": \"q\"}]}}"#]);
        let mut acc = SseAccumulator::new();
        acc.feed(stream.as_bytes(), &mut |_| {}).unwrap();
        let resp = acc.finish().unwrap();
        let uses = resp.tool_uses();
        assert!(uses[0].input.is_string());
    }

    #[test]
    fn error_event_maps_to_typed_error() {
        let mut acc = SseAccumulator::new();
        let err = acc
            .feed(
                event(
                    "error",
                    json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
                )
                .as_bytes(),
                &mut |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, LlmError::Overloaded));
    }

    #[test]
    fn stream_without_stop_reason_is_a_decode_error() {
        let mut acc = SseAccumulator::new();
        acc.feed(
            event(
                "message_start",
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 1}}}),
            )
            .as_bytes(),
            &mut |_| {},
        )
        .unwrap();
        assert!(matches!(acc.finish(), Err(LlmError::Decode(_))));
    }

    #[test]
    fn crlf_delimited_events_are_accepted() {
        let stream = "event: message_delta\r\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\r\n\r\n";
        let mut acc = SseAccumulator::new();
        acc.feed(stream.as_bytes(), &mut |_| {}).unwrap();
        assert_eq!(acc.finish().unwrap().stop_reason, StopReason::EndTurn);
    }
}
