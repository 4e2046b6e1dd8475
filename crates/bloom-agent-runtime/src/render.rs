//! The bit-exact rendered-stdout format a human watching the terminal
//! sees. These markers are a public contract: the out-of-scope TUI
//! frontend and this crate's own tests both depend on the exact
//! punctuation.

use crate::event::NormalizedEvent;

const VERBOSE_TRUNCATE_LEN: usize = 200;

/// Render one decoded event to its human-readable stdout form, or
/// `None` if the event kind has no rendering of its own
/// (`NormalizedEvent::Unknown`/`SystemOther`/`Session` without an id,
/// `ToolResult`/`ToolUse` without data beyond what's rendered below).
///
/// `verbose` controls whether a tool result's content is echoed
/// (truncated to 200 characters) or elided to a bare marker.
pub fn render_event(event: &NormalizedEvent, verbose: bool) -> Option<String> {
    match event {
        NormalizedEvent::AssistantText(text) => {
            if text.is_empty() {
                None
            } else {
                Some(text.clone())
            }
        }
        NormalizedEvent::ToolUse { name } => {
            Some(format!("\n[tool: {}]\n", name.as_deref().unwrap_or("unknown")))
        }
        NormalizedEvent::ToolResult { content } => {
            if verbose {
                let shown = content.as_deref().unwrap_or("");
                if shown.chars().count() > VERBOSE_TRUNCATE_LEN {
                    let truncated: String = shown.chars().take(VERBOSE_TRUNCATE_LEN).collect();
                    Some(format!("[result] {truncated}…\n"))
                } else {
                    Some(format!("[result] {shown}\n"))
                }
            } else {
                Some("[result]\n".to_string())
            }
        }
        NormalizedEvent::Result { cost_usd, duration_ms } => {
            let mut out = String::new();
            if let Some(cost) = cost_usd {
                out.push_str(&format!("\n[cost: ${cost:.4}]\n"));
            }
            if let Some(ms) = duration_ms {
                out.push_str(&format!("[duration: {:.1}s]\n", *ms as f64 / 1000.0));
            }
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        NormalizedEvent::Error { message } => Some(format!("\n[ERROR: {message}]\n")),
        NormalizedEvent::Init { session_id, model } => {
            let mut out = String::new();
            if let Some(id) = session_id {
                out.push_str(&format!("[session: {id}]\n"));
            }
            if let Some(name) = model {
                out.push_str(&format!("[model: {name}]\n"));
            }
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        NormalizedEvent::Session { session_id: Some(id) } => Some(format!("[session: {id}]\n")),
        NormalizedEvent::Session { session_id: None }
        | NormalizedEvent::SystemOther { .. }
        | NormalizedEvent::Unknown => None,
    }
}

/// `[heartbeat <N>s] ` — no trailing newline.
pub fn render_heartbeat(elapsed_secs: u64) -> String {
    format!("[heartbeat {elapsed_secs}s] ")
}

/// `\n[TIMEOUT] No activity for <N>s - agent may be stuck\n`.
pub fn render_timeout(elapsed_secs: u64) -> String {
    format!("\n[TIMEOUT] No activity for {elapsed_secs}s - agent may be stuck\n")
}
