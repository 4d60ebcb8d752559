//! Prompt text and answer post-processing.

use std::fmt::Write as _;

use crate::core::llm::{ContentBlock, Message, Role, ToolDefinition};

use super::types::WorkflowRun;

pub const FOLLOW_UPS_OPEN: &str = "<follow_ups>";
const FOLLOW_UPS_CLOSE: &str = "</follow_ups>";

pub fn system_prompt(tools: &[ToolDefinition], today: &str) -> String {
    let mut prompt = String::from(
        "You are a data analyst. You answer questions about the organisation's data by \
         querying it, never by guessing.\n\n",
    );
    let _ = writeln!(prompt, "Today is {}.\n", today);
    if tools.is_empty() {
        prompt.push_str("No data tools are available in this session; answer from the conversation only.\n");
    } else {
        prompt.push_str("Available tools:\n");
        for tool in tools {
            let _ = writeln!(prompt, "- {}: {}", tool.name, tool.description);
        }
        prompt.push_str(
            "\nGuidelines:\n\
             - Read the documentation before querying tables you have not seen yet.\n\
             - Batch independent queries into a single tool call.\n\
             - Tool arguments must be valid JSON. Put each query in one string literal.\n\
             - When a query fails, read the error, fix the query and try again.\n",
        );
    }
    let _ = write!(
        prompt,
        "\nWhen you are done, answer in concise markdown and cite the figures you found. \
         You may end with up to three follow-up questions as a JSON array of strings \
         wrapped in {}...{}.",
        FOLLOW_UPS_OPEN, FOLLOW_UPS_CLOSE
    );
    prompt
}

const TRUNCATION_NOTE: &str = "You have run out of steps for this question. Do not call any \
     more tools. Using only the results gathered so far, write the best answer you can and \
     say clearly what is still unknown.";

/// History for the final no-tools call made when the iteration cap is hit.
/// The instruction is folded into a trailing user turn so roles keep
/// alternating.
pub fn truncation_messages(run: &WorkflowRun) -> Vec<Message> {
    let mut messages = run.messages.clone();
    match messages.last_mut() {
        Some(last) if last.role == Role::User => {
            last.content.push(ContentBlock::text(TRUNCATION_NOTE));
        }
        _ => messages.push(Message::user(TRUNCATION_NOTE)),
    }
    messages
}

/// Used when even the synthesis call fails.
pub fn fallback_answer(run: &WorkflowRun) -> String {
    let mut out = String::from(
        "I could not finish the analysis within the step limit. Here is what I found so far:\n",
    );
    if run.executed_queries.is_empty() {
        match run.thinking.last() {
            Some(note) => {
                let _ = write!(out, "\n{}", note);
            }
            None => out.push_str("\nNo data was retrieved."),
        }
        return out;
    }
    for q in &run.executed_queries {
        let outcome = match &q.result.error {
            Some(_) => "failed".to_string(),
            None => format!("{} rows", q.result.row_count),
        };
        let _ = write!(out, "\n- {} ({})", q.question, outcome);
    }
    out
}

/// Split a trailing follow-up block off the answer. A malformed block is
/// left in place.
pub fn split_follow_ups(answer: &str) -> (String, Vec<String>) {
    let Some(start) = answer.rfind(FOLLOW_UPS_OPEN) else {
        return (answer.trim().to_string(), Vec::new());
    };
    let body_start = start + FOLLOW_UPS_OPEN.len();
    let Some(len) = answer[body_start..].find(FOLLOW_UPS_CLOSE) else {
        return (answer.trim().to_string(), Vec::new());
    };
    let body = &answer[body_start..body_start + len];
    match serde_json::from_str::<Vec<String>>(body.trim()) {
        Ok(items) => {
            let rest = format!(
                "{}{}",
                &answer[..start],
                &answer[body_start + len + FOLLOW_UPS_CLOSE.len()..]
            );
            let items = items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            (rest.trim().to_string(), items)
        }
        Err(_) => (answer.trim().to_string(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workflow::types::{Dialect, ExecutedQuery, QueryResult};
    use serde_json::json;

    #[test]
    fn follow_ups_are_split_off() {
        let (answer, follow) = split_follow_ups(
            "Revenue grew 12%.\n\n<follow_ups>[\"By region?\", \" \", \"By month?\"]</follow_ups>",
        );
        assert_eq!(answer, "Revenue grew 12%.");
        assert_eq!(follow, vec!["By region?", "By month?"]);
    }

    #[test]
    fn malformed_follow_ups_are_left_alone() {
        let text = "Done. <follow_ups>not json</follow_ups>";
        let (answer, follow) = split_follow_ups(text);
        assert_eq!(answer, text);
        assert!(follow.is_empty());
        let (answer, _) = split_follow_ups("plain answer ");
        assert_eq!(answer, "plain answer");
    }

    #[test]
    fn truncation_note_joins_trailing_user_turn() {
        let mut run = WorkflowRun::new("s", "q", vec![], 0);
        run.messages.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "execute_sql".into(),
                input: json!({}),
            }],
        });
        run.messages.push(Message {
            role: Role::User,
            content: vec![ContentBlock::tool_result("t1", "ok")],
        });
        let messages = truncation_messages(&run);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content.len(), 2);

        run.messages.push(Message::assistant("thinking"));
        assert_eq!(truncation_messages(&run).len(), 5);
    }

    #[test]
    fn fallback_lists_gathered_results() {
        let mut run = WorkflowRun::new("s", "q", vec![], 0);
        run.executed_queries.push(ExecutedQuery {
            tool_use_id: "t".into(),
            dialect: Dialect::Sql,
            question: "Orders per day".into(),
            query: "SELECT 1".into(),
            result: QueryResult {
                row_count: 31,
                ..Default::default()
            },
            duration_ms: 3,
            executed_at: 0,
        });
        assert!(fallback_answer(&run).contains("- Orders per day (31 rows)"));
    }

    #[test]
    fn system_prompt_lists_tools() {
        let prompt = system_prompt(
            &[ToolDefinition {
                name: "execute_sql".into(),
                description: "Run SQL".into(),
                input_schema: json!({}),
            }],
            "2026-01-01",
        );
        assert!(prompt.contains("- execute_sql: Run SQL"));
        assert!(prompt.contains("2026-01-01"));
    }
}
