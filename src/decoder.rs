//! Per-line frame decoding for streaming responses.
//!
//! Every logical line is classified independently, with no negotiation up front:
//! event-stream `data:` lines, newline-delimited JSON objects, the non-success
//! sentinel, and comments/keep-alives. Malformed JSON is logged and skipped.

use serde_json::Value;

use crate::extract;

/// Sentinel the worker writes when the provider answered with a non-success status.
pub const NON_SUCCESS_SENTINEL: &str = "X-NON-200-STATUS:";

/// Payload of an event-stream line that terminates the stream.
const DONE_MARKER: &str = "[DONE]";

/// One decoded frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedEvent {
    /// Visible answer text.
    pub content: Option<String>,
    /// Whether the frame carried provider reasoning.
    pub is_reasoning: bool,
    /// Reasoning text, when the provider sends it.
    pub reasoning_text: Option<String>,
    /// Whether the frame ends the stream.
    pub is_done: bool,
    /// Detail following the non-success sentinel.
    pub error_marker: Option<String>,
}

impl NormalizedEvent {
    fn done() -> Self {
        Self {
            is_done: true,
            ..Default::default()
        }
    }

    fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    fn from_extracted(extracted: extract::Extracted) -> Option<Self> {
        if extracted.content.is_none() && !extracted.is_reasoning {
            return None;
        }
        Some(Self {
            content: extracted.content,
            is_reasoning: extracted.is_reasoning,
            reasoning_text: extracted.reasoning_text,
            ..Default::default()
        })
    }
}

/// Wire sub-format a line was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `data:` line of an event stream.
    EventData,
    /// `event:` metadata line.
    EventName,
    /// `:` comment or keep-alive.
    Comment,
    /// Standalone JSON object.
    JsonObject,
    /// Non-success sentinel.
    Sentinel,
    /// Blank line.
    Blank,
    /// Anything else.
    Unrecognized,
}

/// Classifies a line. First match wins.
pub fn classify(line: &str) -> LineKind {
    if line.trim().is_empty() {
        LineKind::Blank
    } else if line.starts_with("data:") {
        LineKind::EventData
    } else if line.starts_with("event:") {
        LineKind::EventName
    } else if line.starts_with(':') {
        LineKind::Comment
    } else if line.trim_start().starts_with('{') {
        LineKind::JsonObject
    } else if line.contains(NON_SUCCESS_SENTINEL) {
        LineKind::Sentinel
    } else {
        LineKind::Unrecognized
    }
}

/// Decodes a single line into at most one event.
pub fn decode_line(line: &str) -> Option<NormalizedEvent> {
    match classify(line) {
        LineKind::Blank | LineKind::EventName | LineKind::Comment => None,
        LineKind::EventData => decode_event_data(&line["data:".len()..]),
        LineKind::JsonObject => decode_json_object(line.trim()),
        LineKind::Sentinel => {
            let start = line.find(NON_SUCCESS_SENTINEL).unwrap_or(0) + NON_SUCCESS_SENTINEL.len();
            Some(NormalizedEvent {
                error_marker: Some(line[start..].trim().to_string()),
                ..Default::default()
            })
        }
        LineKind::Unrecognized => {
            tracing::debug!(line = %line, "unrecognized stream line, passing through as content");
            Some(NormalizedEvent::content(line))
        }
    }
}

fn decode_event_data(payload: &str) -> Option<NormalizedEvent> {
    let payload = payload.trim();
    if payload == DONE_MARKER {
        return Some(NormalizedEvent::done());
    }
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(json) => NormalizedEvent::from_extracted(extract::extract(&json)),
        Err(e) => {
            tracing::warn!(error = %e, payload = %payload, "skipping malformed event-stream frame");
            None
        }
    }
}

fn decode_json_object(line: &str) -> Option<NormalizedEvent> {
    let json = match serde_json::from_str::<Value>(line) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, line = %line, "skipping malformed JSON line");
            return None;
        }
    };

    if let Some(message) = json.get("error").and_then(error_text) {
        return Some(NormalizedEvent::content(format!("Error: {}", message)));
    }

    let done = json.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
    let event = NormalizedEvent::from_extracted(extract::extract(&json));
    if done {
        // The closing object may still carry a last fragment.
        let mut event = event.unwrap_or_default();
        event.is_done = true;
        return Some(event);
    }
    event
}

/// Reads a human-readable message out of an `error` value.
fn error_text(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| Some(error.to_string())),
        other => Some(other.to_string()),
    }
}

/// Recovers an error message from the tail of a failed response.
///
/// The body may arrive fragmented and mixed with other text, so this looks for the
/// last closing brace and tries every opening brace before it, right to left, until
/// a slice parses as JSON. Best effort: `None` when nothing usable is found.
pub fn extract_tail_error(raw: &str) -> Option<String> {
    let end = raw.rfind('}')?;
    let candidates = raw[..end].match_indices('{').map(|(i, _)| i).collect::<Vec<_>>();
    for &start in candidates.iter().rev() {
        let Ok(json) = serde_json::from_str::<Value>(&raw[start..=end]) else {
            continue;
        };
        if let Some(message) = message_from_error_body(&json) {
            return Some(message);
        }
    }
    None
}

fn message_from_error_body(json: &Value) -> Option<String> {
    if let Some(error) = json.get("error") {
        if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
            return Some(message.to_string());
        }
        if let Some(message) = error.as_str() {
            return Some(message.to_string());
        }
    }
    ["message", "detail", "error_description"]
        .iter()
        .find_map(|key| json.get(*key).and_then(|m| m.as_str()))
        .map(str::to_string)
}

/// Shortens diagnostic text to at most `limit` characters.
pub fn truncate_diagnostic(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_lines_with_and_without_space() {
        let spaced = decode_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(spaced.content.as_deref(), Some("Hel"));

        let tight = decode_line(r#"data:{"choices":[{"delta":{"content":"lo"}}]}"#).unwrap();
        assert_eq!(tight.content.as_deref(), Some("lo"));
    }

    #[test]
    fn done_marker_ends_stream() {
        let event = decode_line("data: [DONE]").unwrap();
        assert!(event.is_done);
        assert_eq!(event.content, None);
        assert!(decode_line("data:[DONE]").unwrap().is_done);
    }

    #[test]
    fn metadata_and_comments_are_ignored() {
        assert_eq!(decode_line("event: message_start"), None);
        assert_eq!(decode_line(": keep-alive"), None);
        assert_eq!(decode_line(":"), None);
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line("   "), None);
    }

    #[test]
    fn malformed_data_frame_is_skipped() {
        assert_eq!(decode_line("data: {\"choices\":[{"), None);
        assert_eq!(decode_line("{not json"), None);
    }

    #[test]
    fn ndjson_error_becomes_visible_content() {
        let event = decode_line(r#"{"error":"model 'foo' not found"}"#).unwrap();
        assert_eq!(event.content.as_deref(), Some("Error: model 'foo' not found"));

        let nested = decode_line(r#"{"error":{"message":"overloaded","type":"server"}}"#).unwrap();
        assert_eq!(nested.content.as_deref(), Some("Error: overloaded"));
    }

    #[test]
    fn ndjson_done_flag_ends_stream() {
        let event =
            decode_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#).unwrap();
        assert!(event.is_done);
        assert_eq!(event.content.as_deref(), Some(""));

        let bare = decode_line(r#"{"done":true,"total_duration":1}"#).unwrap();
        assert!(bare.is_done);
        assert_eq!(bare.content, None);
    }

    #[test]
    fn ndjson_object_goes_through_extractor() {
        let event = decode_line(r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#)
            .unwrap();
        assert_eq!(event.content.as_deref(), Some("Hi"));
        assert!(!event.is_done);

        assert_eq!(decode_line(r#"{"type":"ping"}"#), None);
    }

    #[test]
    fn sentinel_line_carries_detail() {
        let event = decode_line("X-NON-200-STATUS: 429").unwrap();
        assert_eq!(event.error_marker.as_deref(), Some("429"));
        assert_eq!(classify("X-NON-200-STATUS:500"), LineKind::Sentinel);
    }

    #[test]
    fn sentinel_found_inline() {
        let event = decode_line("curl: (22) X-NON-200-STATUS: 401 Unauthorized").unwrap();
        assert_eq!(event.error_marker.as_deref(), Some("401 Unauthorized"));
    }

    #[test]
    fn unrecognized_text_passes_through() {
        let event = decode_line("plain words").unwrap();
        assert_eq!(event.content.as_deref(), Some("plain words"));
    }

    #[test]
    fn tail_error_parses_nested_object() {
        let raw = "429\n{\"error\":{\"message\":\"rate limited\",\"code\":429}}\n";
        assert_eq!(extract_tail_error(raw).as_deref(), Some("rate limited"));
    }

    #[test]
    fn tail_error_handles_pretty_printed_fragments() {
        let raw = "garbage {\n  \"error\": {\n    \"message\": \"invalid api key\"\n  }\n}";
        assert_eq!(extract_tail_error(raw).as_deref(), Some("invalid api key"));
    }

    #[test]
    fn tail_error_reads_flat_message() {
        assert_eq!(
            extract_tail_error(r#"{"detail":"Not Found"}"#).as_deref(),
            Some("Not Found")
        );
    }

    #[test]
    fn tail_error_gives_up_without_json() {
        assert_eq!(extract_tail_error("Bad Gateway"), None);
        assert_eq!(extract_tail_error("{\"error\": "), None);
    }

    #[test]
    fn truncate_diagnostic_respects_char_boundaries() {
        assert_eq!(truncate_diagnostic("  short  ", 10), "short");
        assert_eq!(truncate_diagnostic("ééééé", 2), "éé...");
    }
}
