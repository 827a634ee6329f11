//! Record Parser — turns one raw JSONL line into a [`relay_protocol::Record`].
//!
//! Pure function, no I/O: the tailer hands this complete lines, this hands
//! back a parsed record or a typed reason it couldn't. Line-oriented JSON,
//! tolerant of blank lines; one bad line never poisons the rest of the
//! file.

use chrono::{DateTime, Utc};
use relay_protocol::{Record, Role};
use serde_json::Value;
use thiserror::Error;

const EXCERPT_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {reason} ({excerpt})")]
    Syntax { reason: String, excerpt: String },
    #[error("line did not match the expected record schema: {reason} ({excerpt})")]
    Schema { reason: String, excerpt: String },
}

fn excerpt(line: &str) -> String {
    if line.len() <= EXCERPT_LEN {
        line.to_string()
    } else {
        format!("{}...", &line[..EXCERPT_LEN])
    }
}

/// Parse a single line of a session transcript.
///
/// Returns `Ok(None)` for blank/whitespace-only lines (never an error —
/// these show up routinely as trailing newlines). Returns `Err` for lines
/// that are present but don't parse, so the caller can log-and-skip
/// without losing the rest of the file.
pub fn parse(line: &str) -> Result<Option<Record>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| ParseError::Syntax {
        reason: e.to_string(),
        excerpt: excerpt(trimmed),
    })?;

    let session_id = require_str(&value, "sessionId").map_err(|reason| ParseError::Schema {
        reason,
        excerpt: excerpt(trimmed),
    })?;

    let role_str = value
        .get("message")
        .and_then(|m| m.get("role"))
        .and_then(Value::as_str)
        .or_else(|| value.get("type").and_then(Value::as_str))
        .ok_or_else(|| ParseError::Schema {
            reason: "missing message.role / type".to_string(),
            excerpt: excerpt(trimmed),
        })?;

    let role = match role_str {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => {
            return Err(ParseError::Schema {
                reason: format!("unrecognized role/type {other:?}"),
                excerpt: excerpt(trimmed),
            })
        }
    };

    let content = extract_content(&value).ok_or_else(|| ParseError::Schema {
        reason: "missing or unrecognized message.content".to_string(),
        excerpt: excerpt(trimmed),
    })?;

    let created_at = value
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ParseError::Schema {
            reason: "missing or unparseable timestamp".to_string(),
            excerpt: excerpt(trimmed),
        })?;

    let parent_id = value
        .get("parentUuid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let cwd = value
        .get("cwd")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(Some(Record {
        session_id: session_id.to_string(),
        role,
        content,
        parent_id,
        created_at,
        cwd,
    }))
}

fn require_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing or empty {field}"))
}

/// `message.content` is either a bare string or an array of content blocks
/// (`[{"type":"text","text":"..."}]`); concatenate text blocks and ignore
/// tool-use/tool-result blocks, which aren't part of this spec's data
/// model.
fn extract_content(value: &Value) -> Option<String> {
    let content = value.get("message")?.get("content")?;
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                }
            }
            Some(out)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_is_not_an_error() {
        assert!(parse("").unwrap().is_none());
        assert!(parse("   \n").unwrap().is_none());
    }

    #[test]
    fn parses_a_well_formed_user_line() {
        let line = r#"{"sessionId":"s1","message":{"role":"user","content":"hello"},"timestamp":"2026-01-01T00:00:00Z","parentUuid":"p0","cwd":"/tmp"}"#;
        let record = parse(line).unwrap().unwrap();
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.role, Role::User);
        assert_eq!(record.content, "hello");
        assert_eq!(record.parent_id, "p0");
        assert_eq!(record.cwd, "/tmp");
    }

    #[test]
    fn missing_parent_and_cwd_default_to_empty() {
        let line = r#"{"sessionId":"s1","message":{"role":"assistant","content":"hi"},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let record = parse(line).unwrap().unwrap();
        assert_eq!(record.parent_id, "");
        assert_eq!(record.cwd, "");
    }

    #[test]
    fn content_blocks_are_concatenated() {
        let line = r#"{"sessionId":"s1","message":{"role":"assistant","content":[{"type":"text","text":"a"},{"type":"tool_use","id":"x"},{"type":"text","text":"b"}]},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let record = parse(line).unwrap().unwrap();
        assert_eq!(record.content, "a\nb");
    }

    #[test]
    fn invalid_json_is_a_syntax_error() {
        let err = parse("{not json").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { .. }));
    }

    #[test]
    fn missing_required_field_is_a_schema_error() {
        let line = r#"{"message":{"role":"user","content":"hi"},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let err = parse(line).unwrap_err();
        assert!(matches!(err, ParseError::Schema { .. }));
    }

    #[test]
    fn unrecognized_role_is_a_schema_error() {
        let line = r#"{"sessionId":"s1","message":{"role":"system","content":"hi"},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let err = parse(line).unwrap_err();
        assert!(matches!(err, ParseError::Schema { .. }));
    }

    #[test]
    fn excerpt_is_capped() {
        let long = "x".repeat(500);
        let line = format!(r#"{{"sessionId":"s1","message":{{"role":"user","content":"{long}"}}}}"#);
        let err = parse(&line).unwrap_err();
        let msg = err.to_string();
        assert!(msg.len() < line.len());
    }
}
