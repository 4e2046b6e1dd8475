//! Decoding a CLI's raw JSON event into the uniform [`NormalizedEvent`]
//! shape: a tagged variant with a closed set of kinds, with each CLI's
//! own field names (especially `session_id` vs `sessionID`) mapped into
//! that shape.

use bloom_types::OutputSpec;
use serde_json::Value;

/// The closed set of event kinds every supported CLI's output is folded
/// into. Unknown `type` values decode to [`NormalizedEvent::Unknown`] —
/// they are ignored for rendering purposes but still count as activity.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    /// Assistant-authored text, from `assistant`/`message`/
    /// `content_block_delta`/`text` events (possibly nested under
    /// `message.content`).
    AssistantText(String),
    /// A tool invocation, from `tool_use`/`tool_call`.
    ToolUse {
        /// The tool's name, if the event carried one.
        name: Option<String>,
    },
    /// A tool's result, from `tool_result`/`tool_response`.
    ToolResult {
        /// The result content, if any, for verbose rendering.
        content: Option<String>,
    },
    /// A terminal summary, from `result`/`done`/`complete`/`finish`.
    Result {
        /// Reported cost in USD, from `total_cost_usd` or `cost_usd`.
        cost_usd: Option<f64>,
        /// Reported wall-clock duration.
        duration_ms: Option<u64>,
    },
    /// An error, from `error` events (`error.message` or `content`).
    Error {
        /// The error message.
        message: String,
    },
    /// Session/model initialization, from `system` events with
    /// `subtype: "init"`.
    Init {
        /// Session id, if present.
        session_id: Option<String>,
        /// Model name, if present.
        model: Option<String>,
    },
    /// A non-`init` `system` subtype (`hook_started`, `hook_response`):
    /// recognized, but has no dedicated rendering — it still counts as
    /// activity and may still carry a session id.
    SystemOther {
        /// The subtype string as reported.
        subtype: Option<String>,
    },
    /// A `session` event, which may carry the session id under the
    /// spec's configured field.
    Session {
        /// Session id, if present.
        session_id: Option<String>,
    },
    /// A recognized `type` with no further structure this runtime cares
    /// about, or a `type` outside the set above.
    Unknown,
}

/// Extract the session id from an arbitrary event object by trying the
/// spec's primary field, then its alternate, anywhere the event carries
/// a string there.
pub fn extract_session_id(spec: &OutputSpec, value: &Value) -> Option<String> {
    find_string_field(value, &spec.session_id_field).or_else(|| {
        spec.session_id_field_alt
            .as_deref()
            .and_then(|alt| find_string_field(value, alt))
    })
}

fn find_string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Decode one already-parsed JSON event object into a [`NormalizedEvent`].
pub fn normalize(value: &Value) -> NormalizedEvent {
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return NormalizedEvent::Unknown;
    };

    match kind {
        "assistant" | "message" => NormalizedEvent::AssistantText(extract_assistant_text(value)),
        "content_block_delta" => {
            let text = value
                .get("delta")
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            NormalizedEvent::AssistantText(text)
        }
        "text" => {
            let text = value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            NormalizedEvent::AssistantText(text)
        }
        "tool_use" | "tool_call" => NormalizedEvent::ToolUse {
            name: value
                .get("name")
                .or_else(|| value.get("tool_name"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "tool_result" | "tool_response" => NormalizedEvent::ToolResult {
            content: extract_tool_result_content(value),
        },
        "result" | "done" | "complete" | "finish" => NormalizedEvent::Result {
            cost_usd: value
                .get("total_cost_usd")
                .or_else(|| value.get("cost_usd"))
                .and_then(Value::as_f64),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        },
        "error" => NormalizedEvent::Error {
            message: extract_error_message(value),
        },
        "system" => {
            let subtype = value.get("subtype").and_then(Value::as_str);
            match subtype {
                Some("init") => NormalizedEvent::Init {
                    session_id: value
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    model: value.get("model").and_then(Value::as_str).map(str::to_string),
                },
                other => NormalizedEvent::SystemOther {
                    subtype: other.map(str::to_string),
                },
            }
        }
        "session" => NormalizedEvent::Session {
            session_id: value
                .get("session_id")
                .or_else(|| value.get("sessionID"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        _ => NormalizedEvent::Unknown,
    }
}

fn extract_assistant_text(value: &Value) -> String {
    if let Some(text) = value.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| value.get("content"));
    let Some(blocks) = content.and_then(Value::as_array) else {
        return String::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

fn extract_tool_result_content(value: &Value) -> Option<String> {
    if let Some(s) = value.get("content").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    if let Some(arr) = value.get("content").and_then(Value::as_array) {
        let joined: String = arr
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    value
        .get("output")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_error_message(value: &Value) -> String {
    if let Some(msg) = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return msg.to_string();
    }
    if let Some(msg) = value.get("message").and_then(Value::as_str) {
        return msg.to_string();
    }
    if let Some(content) = value.get("content").and_then(Value::as_str) {
        return content.to_string();
    }
    "unknown error".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_nested_assistant_text() {
        let v = json!({"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}});
        assert_eq!(normalize(&v), NormalizedEvent::AssistantText("hello".to_string()));
    }

    #[test]
    fn decodes_content_block_delta() {
        let v = json!({"type":"content_block_delta","delta":{"text":"wor"}});
        assert_eq!(normalize(&v), NormalizedEvent::AssistantText("wor".to_string()));
    }

    #[test]
    fn decodes_init_with_session_and_model() {
        let v = json!({"type":"system","subtype":"init","session_id":"s1","model":"m"});
        assert_eq!(
            normalize(&v),
            NormalizedEvent::Init {
                session_id: Some("s1".to_string()),
                model: Some("m".to_string())
            }
        );
    }

    #[test]
    fn decodes_other_system_subtype() {
        let v = json!({"type":"system","subtype":"hook_started"});
        assert_eq!(
            normalize(&v),
            NormalizedEvent::SystemOther {
                subtype: Some("hook_started".to_string())
            }
        );
    }

    #[test]
    fn decodes_result_cost_and_duration() {
        let v = json!({"type":"result","total_cost_usd":0.01,"duration_ms":1200});
        assert_eq!(
            normalize(&v),
            NormalizedEvent::Result {
                cost_usd: Some(0.01),
                duration_ms: Some(1200)
            }
        );
    }

    #[test]
    fn decodes_error_from_nested_message() {
        let v = json!({"type":"error","error":{"message":"boom"}});
        assert_eq!(
            normalize(&v),
            NormalizedEvent::Error {
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn unrecognized_type_is_unknown() {
        let v = json!({"type":"something_new"});
        assert_eq!(normalize(&v), NormalizedEvent::Unknown);
    }

    #[test]
    fn missing_type_is_unknown() {
        let v = json!({"foo":"bar"});
        assert_eq!(normalize(&v), NormalizedEvent::Unknown);
    }

    #[test]
    fn extract_session_id_falls_back_to_alt_field() {
        let spec = OutputSpec {
            format: bloom_types::OutputFormat::StreamJson,
            session_id_field: "sessionID".to_string(),
            session_id_field_alt: Some("conversation_id".to_string()),
        };
        let v = json!({"type":"session","conversation_id":"abc"});
        assert_eq!(extract_session_id(&spec, &v).as_deref(), Some("abc"));
    }

    #[test]
    fn extract_session_id_prefers_primary_field() {
        let spec = OutputSpec {
            format: bloom_types::OutputFormat::StreamJson,
            session_id_field: "sessionID".to_string(),
            session_id_field_alt: Some("conversation_id".to_string()),
        };
        let v = json!({"sessionID":"primary","conversation_id":"alt"});
        assert_eq!(extract_session_id(&spec, &v).as_deref(), Some("primary"));
    }
}
