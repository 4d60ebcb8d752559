//! Recovery of malformed query-tool arguments.
//!
//! The model's tool arguments are untrusted text. Before giving up on them we
//! apply four text-level repairs, in this order:
//!
//! 1. cut at the first leaked invocation-markup tag,
//! 2. merge `"a" + "b"` string concatenations into one literal,
//! 3. escape raw newlines that sit inside string literals,
//! 4. drop one unmatched trailing `}` when that yields valid JSON.
//!
//! Step 4 relies on step 3: it checks validity with a JSON parser, which
//! only works once in-string newlines are escaped.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Markup fragments the model sometimes echoes into its own arguments.
const LEAKED_TAGS: &[&str] = &[
    "</invoke>",
    "<invoke",
    "</parameter>",
    "<parameter",
    "</function_calls>",
    "<function_calls>",
    "</tool_use>",
];

/// One sub-query requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub question: String,
    #[serde(alias = "sql", alias = "cypher")]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolInputError {
    #[error("tool arguments are not valid JSON even after repair: {detail}")]
    Unparseable { detail: String },
    #[error("tool arguments have the wrong shape: {detail}")]
    WrongShape { detail: String },
    #[error("no queries were supplied")]
    Empty,
}

/// Parse query-tool arguments into a list of [`QueryRequest`]s.
///
/// Accepts `{"queries": [...]}`, a bare array, a single query object, or any
/// of those encoded as a JSON string. Structured input is never repaired.
pub fn parse_query_requests(input: &Value) -> Result<Vec<QueryRequest>, ToolInputError> {
    let payload = match input {
        Value::Object(map) => match map.get("queries") {
            Some(Value::String(raw)) => parse_text(raw)?,
            Some(inner) => inner.clone(),
            None => input.clone(),
        },
        Value::String(raw) => parse_text(raw)?,
        other => other.clone(),
    };
    let requests = shape(payload)?;
    if requests.is_empty() {
        return Err(ToolInputError::Empty);
    }
    Ok(requests)
}

/// Parse text as JSON, repairing it first only if it does not parse as-is.
pub fn parse_text(raw: &str) -> Result<Value, ToolInputError> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Ok(unwrap_queries_key(v));
    }
    let repaired = repair(raw);
    serde_json::from_str::<Value>(&repaired)
        .map(unwrap_queries_key)
        .map_err(|e| ToolInputError::Unparseable {
            detail: e.to_string(),
        })
}

/// Apply every text repair in order.
pub fn repair(raw: &str) -> String {
    let s = strip_leaked_tags(raw);
    let s = merge_concatenated_strings(&s);
    let s = escape_newlines_in_strings(&s);
    drop_unmatched_trailing_brace(&s)
}

/// Tool input in the shape the Messages API accepts when the turn is sent
/// back as history: always an object. Text is parsed, repaired if needed; a
/// bare array is filed under `queries`; anything else is kept under `raw`.
pub fn history_input(input: &Value) -> Value {
    match input {
        Value::Object(_) => input.clone(),
        Value::Array(items) => json!({ "queries": items }),
        Value::String(raw) => {
            let parsed = serde_json::from_str::<Value>(raw)
                .or_else(|_| serde_json::from_str::<Value>(&repair(raw)));
            match parsed {
                Ok(obj @ Value::Object(_)) => obj,
                Ok(Value::Array(items)) => json!({ "queries": items }),
                _ => json!({ "raw": raw }),
            }
        }
        other => json!({ "raw": other }),
    }
}

fn unwrap_queries_key(v: Value) -> Value {
    match v {
        Value::Object(mut map) if map.contains_key("queries") => {
            map.remove("queries").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn shape(payload: Value) -> Result<Vec<QueryRequest>, ToolInputError> {
    let items = match payload {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => {
            return Err(ToolInputError::WrongShape {
                detail: format!("expected an array of queries, got {}", kind(&other)),
            });
        }
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<QueryRequest>(item).map_err(|e| ToolInputError::WrongShape {
                detail: e.to_string(),
            })
        })
        .collect()
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Repair 1: truncate at the earliest leaked tag.
pub fn strip_leaked_tags(s: &str) -> String {
    let cut = LEAKED_TAGS.iter().filter_map(|tag| s.find(tag)).min();
    match cut {
        Some(idx) => s[..idx].trim_end().to_string(),
        None => s.to_string(),
    }
}

/// Repair 2: `"abc" + "def"` becomes `"abcdef"`. Only quotes that really close
/// a string literal are considered, so escaped quotes inside values are safe.
pub fn merge_concatenated_strings(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
            } else if c == '\\' {
                escaped = true;
                out.push(c);
            } else if c == '"' {
                if let Some(next_open) = concatenation_continues_at(&chars, i + 1) {
                    // Skip the closing quote, the operator and the opening quote.
                    i = next_open + 1;
                    continue;
                }
                in_string = false;
                out.push(c);
            } else {
                out.push(c);
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
        i += 1;
    }
    out
}

/// After a closing quote, returns the index of the next opening quote if the
/// gap is whitespace, a single `+`, whitespace.
fn concatenation_continues_at(chars: &[char], mut j: usize) -> Option<usize> {
    while j < chars.len() && chars[j].is_whitespace() {
        j += 1;
    }
    if chars.get(j) != Some(&'+') {
        return None;
    }
    j += 1;
    while j < chars.len() && chars[j].is_whitespace() {
        j += 1;
    }
    (chars.get(j) == Some(&'"')).then_some(j)
}

/// Repair 3: escape raw newlines (and carriage returns and tabs) inside string
/// literals with a single left-to-right scan. Whitespace between tokens is left alone.
pub fn escape_newlines_in_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// Repair 4: remove one trailing `}` only if the result then parses.
pub fn drop_unmatched_trailing_brace(s: &str) -> String {
    let trimmed = s.trim_end();
    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return s.to_string();
    }
    if let Some(candidate) = trimmed.strip_suffix('}')
        && serde_json::from_str::<Value>(candidate).is_ok()
    {
        return candidate.to_string();
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_input_is_used_as_is() {
        let input = json!({"queries": [
            {"question": "How many users?", "query": "SELECT count(*) FROM users"},
            {"question": "Newest user?", "query": "SELECT max(created_at) FROM users"}
        ]});
        let parsed = parse_query_requests(&input).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].question, "Newest user?");
    }

    #[test]
    fn repair_is_identity_on_valid_json_text() {
        let samples = [
            r#"[{"question":"q","query":"SELECT 1"}]"#,
            "[\n  {\"question\": \"q\",\n   \"query\": \"SELECT \\n 1\"}\n]",
            r#"{"question":"says \"hi\" + \"there\"","query":"SELECT '}'"}"#,
        ];
        for s in samples {
            assert!(serde_json::from_str::<Value>(s).is_ok());
            assert_eq!(repair(s), s, "repair changed valid input {:?}", s);
        }
    }

    #[test]
    fn literal_newline_inside_sql_is_escaped() {
        let raw = "{\"question\":\"q\",\"sql\":\"SELECT \n 1\"}";
        assert!(serde_json::from_str::<Value>(raw).is_err());
        let parsed = parse_query_requests(&Value::String(raw.to_string())).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].question, "q");
        assert_eq!(parsed[0].query, "SELECT \n 1");
    }

    #[test]
    fn extra_trailing_brace_is_removed() {
        let raw = r#"[{"question":"q","sql":"SELECT 1"}]}"#;
        let parsed = parse_query_requests(&Value::String(raw.to_string())).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].query, "SELECT 1");
    }

    #[test]
    fn history_input_is_always_an_object() {
        let obj = json!({"queries": [{"question": "q", "query": "SELECT 1"}]});
        assert_eq!(history_input(&obj), obj);

        let raw = "[{\"question\":\"q\",\"sql\":\"SELECT \n 1\"}]}";
        assert_eq!(
            history_input(&Value::String(raw.to_string())),
            json!({"queries": [{"question": "q", "sql": "SELECT \n 1"}]})
        );
        assert_eq!(
            history_input(&json!("{\"page\":\"orders\"}")),
            json!({"page": "orders"})
        );
        assert_eq!(
            history_input(&json!("count the orders please")),
            json!({"raw": "count the orders please"})
        );
        assert_eq!(history_input(&json!(7)), json!({"raw": 7}));
    }

    #[test]
    fn trailing_brace_kept_when_removal_does_not_help() {
        let raw = r#"[{"question":"q"}"#;
        assert_eq!(drop_unmatched_trailing_brace(raw), raw);
    }

    #[test]
    fn leaked_closing_tag_is_stripped() {
        let raw = r#"[{"question":"q","sql":"SELECT 1"}]</invoke>"#;
        let parsed = parse_query_requests(&Value::String(raw.to_string())).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].query, "SELECT 1");
    }

    #[test]
    fn leaked_tag_cuts_at_earliest_occurrence() {
        let raw = "[1]\n</parameter>\n</invoke>";
        assert_eq!(strip_leaked_tags(raw), "[1]");
    }

    #[test]
    fn concatenated_literals_are_merged() {
        let raw = r#"[{"question":"q","query":"SELECT a " + "FROM t " +
            "WHERE x = 1"}]"#;
        let parsed = parse_query_requests(&Value::String(raw.to_string())).unwrap();
        assert_eq!(parsed[0].query, "SELECT a FROM t WHERE x = 1");
    }

    #[test]
    fn escaped_quote_is_not_treated_as_concatenation() {
        let s = r#"{"q":"a\" + \"b"}"#;
        assert_eq!(merge_concatenated_strings(s), s);
    }

    #[test]
    fn structural_whitespace_is_untouched_by_newline_escaping() {
        let s = "[\n {\"a\": \"x\ny\"}\n]";
        assert_eq!(escape_newlines_in_strings(s), "[\n {\"a\": \"x\\ny\"}\n]");
    }

    #[test]
    fn all_repairs_compose() {
        let raw = "{\"queries\": [{\"question\": \"q\", \"sql\": \"SELECT *\n\" + \"FROM t\"}]}}</invoke>";
        let parsed = parse_query_requests(&Value::String(raw.to_string())).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].query, "SELECT *\nFROM t");
    }

    #[test]
    fn queries_key_holding_string_is_repaired() {
        let input = json!({"queries": "[{\"question\":\"q\",\"query\":\"SELECT 1\"}]}"});
        let parsed = parse_query_requests(&input).unwrap();
        assert_eq!(parsed[0].query, "SELECT 1");
    }

    #[test]
    fn hopeless_input_yields_typed_error() {
        let err = parse_query_requests(&Value::String("SELECT 1 please".into())).unwrap_err();
        assert!(matches!(err, ToolInputError::Unparseable { .. }));
    }

    #[test]
    fn wrong_shape_and_empty_are_reported() {
        assert!(matches!(
            parse_query_requests(&json!({"queries": 5})),
            Err(ToolInputError::WrongShape { .. })
        ));
        assert!(matches!(
            parse_query_requests(&json!({"queries": []})),
            Err(ToolInputError::Empty)
        ));
        assert!(matches!(
            parse_query_requests(&json!([{"question": "no query here"}])),
            Err(ToolInputError::WrongShape { .. })
        ));
    }
}
