//! NDJSON event-kind normalization for the LLM CLI subprocess stream
//! (`SPEC_FULL.md` §6.1, §9 Design Notes: "isolate event mapping in a pure
//! function").
//!
//! Grounded on `lanegrid-agtrace`'s `agtrace-providers/src/codex/{parser,normalize}.rs`,
//! which normalizes a CLI coding agent's recorded session stream into a small
//! typed event set by matching on a `type`/`kind` discriminant — the same
//! shape this module applies to a *live* subprocess stream instead of a
//! recorded log.

use serde_json::Value;

/// The small set of runtime events the LLM Session Runner maps every NDJSON
/// line onto (`SPEC_FULL.md` §4.4 step 3).
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Accumulated assistant text (a delta or a completed message).
    Text(String),
    ToolUse { name: String, params: Value },
    ToolResult { name: String, result: Value },
    /// Terminal success.
    Done,
    /// Terminal or non-terminal error.
    Error(String),
}

/// Carries forward the bits of state that must persist across lines within
/// one turn.
#[derive(Debug, Clone, Default)]
pub struct ParseState {
    pub thread_id: Option<String>,
    pub saw_deltas: bool,
    pub accumulated_text: String,
}

/// Outcome of normalizing one NDJSON line.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub events: Vec<RuntimeEvent>,
    pub turn_completed: bool,
}

/// Normalizes a raw event-kind string: slash/underscore/camelCase variants
/// all map to the dotted form (`SPEC_FULL.md` §6.1).
fn normalize_kind(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for ch in raw.chars() {
        if ch == '/' || ch == '_' {
            out.push('.');
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower {
            out.push('.');
        }
        out.push(ch.to_ascii_lowercase());
        prev_lower = ch.is_lowercase();
    }
    out
}

/// Normalizes one parsed NDJSON line into runtime events, mutating `state` in
/// place. Pure given `(line, state)`: same inputs always produce the same
/// `(events, next_state, turn_completed)`.
pub fn normalize_line(line: &Value, state: &mut ParseState) -> NormalizeOutcome {
    // Legacy stream format: `{type: "assistant", message: {content: [...]}}`
    // followed by `{type: "result"}`.
    if let Some(ty) = line.get("type").and_then(Value::as_str) {
        match ty {
            "assistant" => {
                if let Some(blocks) = line
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                {
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                state.accumulated_text.push_str(text);
                                return NormalizeOutcome {
                                    events: vec![RuntimeEvent::Text(text.to_string())],
                                    turn_completed: false,
                                };
                            }
                        }
                    }
                }
                return NormalizeOutcome::default();
            }
            "result" => {
                return NormalizeOutcome {
                    events: vec![RuntimeEvent::Done],
                    turn_completed: true,
                };
            }
            _ => {}
        }
    }

    let raw_kind = line
        .get("type")
        .or_else(|| line.get("kind"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let kind = normalize_kind(raw_kind);

    match kind.as_str() {
        "thread.started" => {
            if let Some(id) = line.get("thread_id").and_then(Value::as_str) {
                state.thread_id = Some(id.to_string());
            }
            NormalizeOutcome::default()
        }
        "item.agent.message.delta" => {
            let text = line
                .get("delta")
                .or_else(|| line.get("text"))
                .or_else(|| line.get("content"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if text.is_empty() {
                return NormalizeOutcome::default();
            }
            state.saw_deltas = true;
            state.accumulated_text.push_str(text);
            NormalizeOutcome {
                events: vec![RuntimeEvent::Text(text.to_string())],
                turn_completed: false,
            }
        }
        "item.completed" => normalize_item_completed(line, state),
        "item.mcp.tool.call.progress" => normalize_item_completed(line, state),
        "turn.completed" => NormalizeOutcome {
            events: vec![RuntimeEvent::Done],
            turn_completed: true,
        },
        "turn.failed" => {
            let message = line
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("turn failed")
                .to_string();
            NormalizeOutcome {
                events: vec![RuntimeEvent::Error(message)],
                turn_completed: true,
            }
        }
        "error" => {
            let message = line
                .get("message")
                .or_else(|| line.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("error")
                .to_string();
            NormalizeOutcome {
                events: vec![RuntimeEvent::Error(message)],
                turn_completed: false,
            }
        }
        _ => NormalizeOutcome::default(),
    }
}

fn normalize_item_completed(line: &Value, state: &mut ParseState) -> NormalizeOutcome {
    let item = line.get("item").unwrap_or(line);
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");

    match item_type {
        "agent_message" => {
            if state.saw_deltas {
                return NormalizeOutcome::default();
            }
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                state.accumulated_text.push_str(text);
                return NormalizeOutcome {
                    events: vec![RuntimeEvent::Text(text.to_string())],
                    turn_completed: false,
                };
            }
            NormalizeOutcome::default()
        }
        "mcp_tool_call" => {
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let params = item.get("params").cloned().unwrap_or(Value::Null);
            let mut events = vec![RuntimeEvent::ToolUse {
                name: name.clone(),
                params,
            }];
            if let Some(result) = item
                .get("result")
                .or_else(|| item.get("output"))
                .or_else(|| item.get("content"))
            {
                events.push(RuntimeEvent::ToolResult {
                    name,
                    result: result.clone(),
                });
            }
            NormalizeOutcome {
                events,
                turn_completed: false,
            }
        }
        _ => NormalizeOutcome::default(),
    }
}

/// Parses the accumulated assistant text as a single JSON object for the
/// structured response (`SPEC_FULL.md` §4.4 step 7): try a whole-text parse
/// first, then fall back to extracting the first `{ … "pattern" … }`
/// substring via brace counting — the same fallback strategy as the
/// teacher's `Agent::parse_tool_call`.
pub fn extract_response_object(accumulated_text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(accumulated_text.trim()) {
        return Some(value);
    }

    let marker = accumulated_text.find("\"pattern\"")?;
    let brace_start = accumulated_text[..marker].rfind('{')?;
    let bytes = accumulated_text.as_bytes();
    let mut depth = 0i32;
    let mut end = None;
    for (idx, ch) in accumulated_text[brace_start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(brace_start + idx + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    let _ = bytes;
    serde_json::from_str::<Value>(&accumulated_text[brace_start..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_started_captures_id() {
        let mut state = ParseState::default();
        let out = normalize_line(&json!({"type": "thread.started", "thread_id": "abc"}), &mut state);
        assert!(out.events.is_empty());
        assert_eq!(state.thread_id.as_deref(), Some("abc"));
    }

    #[test]
    fn slash_and_camel_case_variants_normalize() {
        let mut state = ParseState::default();
        let out = normalize_line(&json!({"type": "thread/started", "thread_id": "x"}), &mut state);
        assert!(out.events.is_empty());
        assert_eq!(state.thread_id.as_deref(), Some("x"));
    }

    #[test]
    fn delta_accumulates_text() {
        let mut state = ParseState::default();
        let out = normalize_line(&json!({"type": "item.agent.message.delta", "delta": "hel"}), &mut state);
        assert_eq!(out.events, vec![RuntimeEvent::Text("hel".to_string())]);
        assert!(state.saw_deltas);
        assert_eq!(state.accumulated_text, "hel");
    }

    #[test]
    fn completed_message_ignored_if_deltas_seen() {
        let mut state = ParseState {
            saw_deltas: true,
            ..Default::default()
        };
        let out = normalize_line(
            &json!({"type": "item.completed", "item": {"type": "agent_message", "text": "whole"}}),
            &mut state,
        );
        assert!(out.events.is_empty());
    }

    #[test]
    fn turn_completed_is_terminal() {
        let mut state = ParseState::default();
        let out = normalize_line(&json!({"type": "turn.completed"}), &mut state);
        assert!(out.turn_completed);
        assert_eq!(out.events, vec![RuntimeEvent::Done]);
    }

    #[test]
    fn legacy_result_terminates() {
        let mut state = ParseState::default();
        normalize_line(
            &json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "hi"}]}}),
            &mut state,
        );
        let out = normalize_line(&json!({"type": "result"}), &mut state);
        assert!(out.turn_completed);
    }

    #[test]
    fn extract_response_object_whole_text() {
        let value = extract_response_object(r#"{"pattern": "silence", "thoughts": "ok"}"#).unwrap();
        assert_eq!(value["pattern"], "silence");
    }

    #[test]
    fn extract_response_object_falls_back_to_substring() {
        let text = r#"Sure thing! Here you go: {"pattern": "s(\"bd\")", "thoughts": "ok"} Hope that helps."#;
        let value = extract_response_object(text).unwrap();
        assert_eq!(value["thoughts"], "ok");
    }
}
