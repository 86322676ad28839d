//! Vendor payload extraction.
//!
//! Provider responses are identified by their JSON shape rather than by any
//! negotiated header. [`SHAPES`] lists the known shapes in priority order; the
//! first rule whose predicate matches decides how content and reasoning are pulled
//! out of the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Known provider payload shapes, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadShape {
    /// OpenAI-compatible `choices[0].delta` chunk.
    ChoicesDelta,
    /// Anthropic `content_block_start` opening a thinking block.
    ThinkingBlockStart,
    /// Anthropic `delta` carrying `thinking` or `text`.
    BlockDelta,
    /// `content` array of typed blocks.
    ContentBlocks,
    /// Gemini `candidates[0].content.parts`.
    Candidates,
    /// Simple chat echo with a `message.content` string.
    MessageContent,
}

/// Content pulled out of a single payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    /// Visible answer text.
    pub content: Option<String>,
    /// Whether the payload carried provider reasoning.
    pub is_reasoning: bool,
    /// Reasoning text, when the provider sends it.
    pub reasoning_text: Option<String>,
}

impl Extracted {
    fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    fn reasoning(text: Option<&str>) -> Self {
        Self {
            content: None,
            is_reasoning: true,
            reasoning_text: text.filter(|t| !t.is_empty()).map(str::to_string),
        }
    }
}

/// One row of the detection table.
pub struct ShapeRule {
    /// Shape this row recognizes.
    pub shape: PayloadShape,
    /// Returns true when the payload has this shape.
    pub matches: fn(&Value) -> bool,
    /// Pulls content and reasoning out of a matching payload.
    pub extract: fn(&Value) -> Extracted,
}

/// Shape detection table, evaluated top to bottom.
pub const SHAPES: &[ShapeRule] = &[
    ShapeRule {
        shape: PayloadShape::ChoicesDelta,
        matches: is_choices_delta,
        extract: extract_choices_delta,
    },
    ShapeRule {
        shape: PayloadShape::ThinkingBlockStart,
        matches: is_thinking_block_start,
        extract: extract_thinking_block_start,
    },
    ShapeRule {
        shape: PayloadShape::BlockDelta,
        matches: is_block_delta,
        extract: extract_block_delta,
    },
    ShapeRule {
        shape: PayloadShape::ContentBlocks,
        matches: is_content_blocks,
        extract: extract_content_blocks,
    },
    ShapeRule {
        shape: PayloadShape::Candidates,
        matches: is_candidates,
        extract: extract_candidates,
    },
    ShapeRule {
        shape: PayloadShape::MessageContent,
        matches: is_message_content,
        extract: extract_message_content,
    },
];

fn rule_for(value: &Value) -> Option<&'static ShapeRule> {
    SHAPES.iter().find(|rule| (rule.matches)(value))
}

/// Returns the first shape whose predicate matches `value`.
pub fn detect(value: &Value) -> Option<PayloadShape> {
    rule_for(value).map(|rule| rule.shape)
}

/// Extracts content from an incremental payload.
///
/// Unrecognized shapes yield an empty [`Extracted`].
pub fn extract(value: &Value) -> Extracted {
    rule_for(value)
        .map(|rule| (rule.extract)(value))
        .unwrap_or_default()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn first<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key).and_then(|v| v.as_array()).and_then(|a| a.first())
}

fn is_choices_delta(value: &Value) -> bool {
    first(value, "choices").is_some_and(|choice| choice.get("delta").is_some())
}

fn extract_choices_delta(value: &Value) -> Extracted {
    let Some(choice) = first(value, "choices") else {
        return Extracted::default();
    };
    if str_field(choice, "finish_reason").is_some_and(|r| !r.is_empty()) {
        return Extracted::default();
    }
    let Some(delta) = choice.get("delta") else {
        return Extracted::default();
    };
    let reasoning = str_field(delta, "reasoning_content")
        .or_else(|| str_field(delta, "reasoning"))
        .filter(|r| !r.is_empty());
    if let Some(text) = reasoning {
        return Extracted::reasoning(Some(text));
    }
    match str_field(delta, "content") {
        Some(text) => Extracted::content(text),
        None => Extracted::default(),
    }
}

fn is_thinking_block_start(value: &Value) -> bool {
    str_field(value, "type") == Some("content_block_start")
        && value
            .get("content_block")
            .and_then(|b| str_field(b, "type"))
            == Some("thinking")
}

fn extract_thinking_block_start(_value: &Value) -> Extracted {
    Extracted::reasoning(None)
}

fn is_block_delta(value: &Value) -> bool {
    value
        .get("delta")
        .is_some_and(|d| d.get("thinking").is_some() || d.get("text").is_some())
}

fn extract_block_delta(value: &Value) -> Extracted {
    let Some(delta) = value.get("delta") else {
        return Extracted::default();
    };
    if delta.get("thinking").is_some() {
        return Extracted::reasoning(str_field(delta, "thinking"));
    }
    match str_field(delta, "text") {
        Some(text) => Extracted::content(text),
        None => Extracted::default(),
    }
}

fn is_content_blocks(value: &Value) -> bool {
    first(value, "content").is_some()
}

fn extract_content_blocks(value: &Value) -> Extracted {
    let Some(block) = first(value, "content") else {
        return Extracted::default();
    };
    if str_field(block, "type") == Some("thinking") {
        return Extracted::reasoning(str_field(block, "thinking"));
    }
    match str_field(block, "text") {
        Some(text) => Extracted::content(text),
        None => Extracted::default(),
    }
}

fn candidate_parts(value: &Value) -> Option<&Vec<Value>> {
    first(value, "candidates")
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
}

fn is_candidates(value: &Value) -> bool {
    candidate_parts(value).is_some()
}

fn is_thought(part: &Value) -> bool {
    part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false)
}

fn extract_candidates(value: &Value) -> Extracted {
    let Some(parts) = candidate_parts(value) else {
        return Extracted::default();
    };
    let mut extracted = Extracted::default();
    for part in parts {
        if is_thought(part) {
            extracted.is_reasoning = true;
            if extracted.reasoning_text.is_none() {
                extracted.reasoning_text = str_field(part, "text").map(str::to_string);
            }
        } else if extracted.content.is_none() {
            extracted.content = str_field(part, "text").map(str::to_string);
        }
    }
    extracted
}

fn is_message_content(value: &Value) -> bool {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .is_some_and(|c| c.is_string())
}

fn extract_message_content(value: &Value) -> Extracted {
    match value.get("message").and_then(|m| str_field(m, "content")) {
        Some(text) => Extracted::content(text),
        None => Extracted::default(),
    }
}

/// A fully parsed non-incremental response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompleteResponse {
    /// Answer text.
    pub content: String,
    /// Reasoning text, when present.
    pub reasoning: Option<String>,
    /// Whether any reasoning was observed.
    pub reasoning_observed: bool,
    /// Token usage or other provider metadata.
    pub usage: Option<Value>,
}

/// Extracts the answer from a complete (non-streaming) provider response.
///
/// Returns `None` when no known shape carries any text.
pub fn extract_complete(value: &Value) -> Option<CompleteResponse> {
    let usage = value
        .get("usage")
        .or_else(|| value.get("usageMetadata"))
        .cloned();

    // choices[0].message
    if let Some(message) = first(value, "choices").and_then(|c| c.get("message")) {
        let reasoning = str_field(message, "reasoning_content")
            .or_else(|| str_field(message, "reasoning"))
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        let content = str_field(message, "content").unwrap_or_default().to_string();
        return Some(CompleteResponse {
            content,
            reasoning_observed: reasoning.is_some(),
            reasoning,
            usage,
        });
    }

    // content blocks: concatenate text, collect thinking
    if let Some(blocks) = value.get("content").and_then(|c| c.as_array()) {
        let mut response = CompleteResponse {
            usage,
            ..Default::default()
        };
        for block in blocks {
            match str_field(block, "type") {
                Some("thinking") => {
                    response.reasoning_observed = true;
                    if let Some(text) = str_field(block, "thinking") {
                        response.reasoning.get_or_insert_with(String::new).push_str(text);
                    }
                }
                _ => {
                    if let Some(text) = str_field(block, "text") {
                        response.content.push_str(text);
                    }
                }
            }
        }
        return Some(response);
    }

    if let Some(parts) = candidate_parts(value) {
        let mut response = CompleteResponse {
            usage,
            ..Default::default()
        };
        for part in parts {
            let text = str_field(part, "text").unwrap_or_default();
            if is_thought(part) {
                response.reasoning_observed = true;
                response.reasoning.get_or_insert_with(String::new).push_str(text);
            } else {
                response.content.push_str(text);
            }
        }
        return Some(response);
    }

    if let Some(text) = value.get("message").and_then(|m| str_field(m, "content")) {
        return Some(CompleteResponse {
            content: text.to_string(),
            usage,
            ..Default::default()
        });
    }

    None
}
