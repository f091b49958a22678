//! Output formatting for CLI commands

use serde::Serialize;

use crate::event::{Event, Role};

/// Format output as JSON or a fallback debug form based on --json flag
pub fn format_output<T: Serialize>(data: &T, json: bool) -> String {
    if json {
        serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
    } else {
        serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string())
    }
}

/// One event as a single JSON line
pub fn event_json_line(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
}

/// Human-readable rendering of one event; `None` for events not worth a line
pub fn render_event(event: &Event) -> Option<String> {
    let line = match event {
        Event::Message { role, text, .. } => match role {
            Role::User => format!("[user] {}", text),
            Role::Assistant => format!("[assistant] {}", text),
        },
        Event::AssistantDelta { .. } => return None,
        Event::AssistantComplete { text, interrupted, .. } => {
            if *interrupted {
                format!("[assistant, interrupted] {}", text)
            } else {
                format!("[assistant] {}", text)
            }
        }
        Event::ToolStart { tool_kind, name, args, .. } => format!("[tool:{}] {} {}", tool_kind, name, args),
        Event::ToolOutput {
            chunk, done, exit_code, ..
        } => {
            let mut line = truncate(chunk.trim_end(), 400);
            if *done {
                if let Some(code) = exit_code {
                    line.push_str(&format!(" (exit {})", code));
                }
            }
            format!("  {}", line)
        }
        Event::ThinkingUpdate { text, done: true, .. } => format!("[thinking] {}", truncate(text, 200)),
        Event::ThinkingUpdate { .. } => return None,
        Event::PermissionRequest { id, tools, .. } => {
            let tools: Vec<&str> = tools.iter().map(|t| t.as_str()).collect();
            format!("[permission] {} requests {}", id, tools.join(", "))
        }
        Event::PermissionDecision { id, allow, .. } => {
            format!("[permission] {} {}", id, if *allow { "allowed" } else { "denied" })
        }
        Event::CheckpointCreate {
            trigger, file_snapshots, ..
        } => format!("[checkpoint] {} ({} files)", trigger, file_snapshots.len()),
        Event::EditProposed { file, .. } => format!("[edit] proposed {}", file),
        Event::EditResolved { id, applied, .. } => {
            format!("[edit] {} {}", id, if *applied { "applied" } else { "rejected" })
        }
        Event::CostUpdate { usd, .. } => format!("[cost] ${:.4}", usd),
        Event::TelemetryTokens {
            tokens_in, tokens_out, ..
        } => format!("[tokens] in {} / out {}", tokens_in, tokens_out),
        Event::ModelUpdate { model, .. } => format!("[model] {}", model.as_deref().unwrap_or("default")),
        Event::Error { message, .. } => format!("[error] {}", message),
        Event::Raw { .. } => return None,
    };
    Some(line)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_message() {
        let event = Event::Message {
            id: "m1".into(),
            role: Role::Assistant,
            text: "Hello".into(),
            content_parts: Vec::new(),
            model: None,
            tokens: None,
            timestamp: 1,
        };
        assert_eq!(render_event(&event).as_deref(), Some("[assistant] Hello"));
    }

    #[test]
    fn test_deltas_not_rendered() {
        let event = Event::AssistantDelta {
            id: "m1".into(),
            chunk: "He".into(),
            timestamp: 1,
        };
        assert!(render_event(&event).is_none());
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo", 2), "hé…");
    }
}
