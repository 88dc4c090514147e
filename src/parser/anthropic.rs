//! Dialect-A (Anthropic-style) event parser (C2, spec §4.2).
//!
//! Grounded on the teacher's `llm/anthropic.rs` streaming loop (event
//! dispatch over `eventsource_stream::Eventsource`, the same wire structs
//! for `message_start`/`content_block_start`/`content_block_delta`/
//! `message_delta`), generalized from a flat string accumulator into the
//! per-block state machine spec §4.2 and §9 describe, re-emitting through
//! `sse::Writer` instead of a `StreamChunk` channel.

use std::collections::HashMap;

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::StopReason;
use crate::error::StopKind;
use crate::json_accum::JsonAccumulator;
use crate::model::{TokenUsage, ToolCallRequest};
use crate::sse::Writer;

enum BlockState {
    Text { id: String },
    Reasoning { id: String },
    ToolUse {
        id: String,
        name: String,
        acc: JsonAccumulator,
    },
}

/// Runs the Dialect-A parser to completion over one upstream response
/// body, emitting UI parts to `writer` as it goes.
///
/// `is_continuation` suppresses the outer `start(messageId)` frame on
/// steps after the first (spec §4.2 point 1).
pub async fn run<S>(
    byte_stream: S,
    writer: &Writer,
    cancel: &CancellationToken,
    is_continuation: bool,
) -> StopReason
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send,
{
    let events = byte_stream.eventsource();
    futures::pin_mut!(events);

    let mut blocks: HashMap<usize, BlockState> = HashMap::new();
    let mut stop_from_delta: Option<String> = None;
    let mut message_id: Option<String> = None;
    let mut model: Option<String> = None;
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
    let mut assistant_text = String::new();
    let mut text_seen = false;
    let mut reasoning_text = String::new();
    let mut reasoning_seen = false;
    let mut step_started = false;
    let mut usage: Option<TokenUsage> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = writer.error("request cancelled");
                if step_started {
                    let _ = writer.finish_step();
                }
                return StopReason {
                    kind: Some(StopKind::Canceled),
                    error_type: Some("cancelled".to_string()),
                    error_text: Some("request cancelled".to_string()),
                    message_id,
                    model,
                    ..Default::default()
                };
            }
            next = events.next() => next,
        };

        let Some(event) = next else {
            // Transport EOF without message_stop: normal end (§4.2 edge case).
            break;
        };

        let event = match event {
            Ok(event) => event,
            Err(err) => {
                let _ = writer.error(format!("stream error: {err}"));
                if step_started {
                    let _ = writer.finish_step();
                }
                return StopReason {
                    kind: Some(StopKind::Error),
                    error_type: Some("stream".to_string()),
                    error_text: Some(err.to_string()),
                    message_id,
                    model,
                    ..Default::default()
                };
            }
        };

        if event.data.trim().is_empty() {
            continue;
        }

        match event.event.as_str() {
            "message_start" => {
                let Ok(payload) = serde_json::from_str::<MessageStart>(&event.data) else {
                    return decode_error(writer, step_started, message_id, model);
                };
                message_id = Some(payload.message.id.clone());
                model = Some(payload.message.model.clone());
                usage = Some(TokenUsage {
                    input_tokens: payload.message.usage.input_tokens,
                    output_tokens: payload.message.usage.output_tokens,
                    cached_tokens: payload.message.usage.cached_tokens(),
                });
                if !is_continuation {
                    let _ = writer.start(payload.message.id);
                }
                let _ = writer.start_step();
                step_started = true;
            }
            "content_block_start" => {
                let Ok(payload) = serde_json::from_str::<ContentBlockStart>(&event.data) else {
                    return decode_error(writer, step_started, message_id, model);
                };
                match payload.content_block {
                    AnthropicBlock::Text { .. } => {
                        let id = format!("blk{}", payload.index);
                        let _ = writer.text_start(&id);
                        blocks.insert(payload.index, BlockState::Text { id });
                    }
                    AnthropicBlock::Thinking { .. } => {
                        let id = format!("blk{}", payload.index);
                        let _ = writer.reasoning_start(&id);
                        blocks.insert(payload.index, BlockState::Reasoning { id });
                    }
                    AnthropicBlock::ToolUse { id, name, .. } => {
                        let _ = writer.tool_input_start(&id, &name);
                        blocks.insert(
                            payload.index,
                            BlockState::ToolUse {
                                id,
                                name,
                                acc: JsonAccumulator::new(),
                            },
                        );
                    }
                    AnthropicBlock::Unknown => {}
                }
            }
            "content_block_delta" => {
                let Ok(payload) = serde_json::from_str::<ContentBlockDelta>(&event.data) else {
                    return decode_error(writer, step_started, message_id, model);
                };
                let Some(block) = blocks.get_mut(&payload.index) else {
                    continue;
                };
                match (block, payload.delta) {
                    (BlockState::Text { id }, ContentDelta::Text { text }) => {
                        assistant_text.push_str(&text);
                        text_seen = true;
                        let _ = writer.text_delta(id.clone(), text);
                    }
                    (BlockState::Reasoning { id }, ContentDelta::Thinking { thinking }) => {
                        reasoning_text.push_str(&thinking);
                        reasoning_seen = true;
                        let _ = writer.reasoning_delta(id.clone(), thinking);
                    }
                    (BlockState::ToolUse { id, acc, .. }, ContentDelta::InputJson { partial_json }) => {
                        acc.append(&partial_json);
                        let _ = writer.tool_input_delta(id.clone(), partial_json);
                    }
                    // signature_delta and cross-kind mismatches are ignored (§4.2 point 3, §8 B2).
                    _ => {}
                }
            }
            "content_block_stop" => {
                let Ok(payload) = serde_json::from_str::<ContentBlockStop>(&event.data) else {
                    return decode_error(writer, step_started, message_id, model);
                };
                let Some(block) = blocks.remove(&payload.index) else {
                    continue;
                };
                match block {
                    BlockState::Text { id } => {
                        let _ = writer.text_end(id);
                    }
                    BlockState::Reasoning { id } => {
                        let _ = writer.reasoning_end(id);
                    }
                    BlockState::ToolUse { id, name, mut acc } => match acc.finalize() {
                        Ok(raw) => {
                            let input: serde_json::Value =
                                serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null);
                            tool_calls.push(ToolCallRequest {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            });
                            let _ = writer.tool_input_available(id, name, input);
                        }
                        Err(finalize_err) => {
                            let _ = writer.error(finalize_err.to_string());
                            if step_started {
                                let _ = writer.finish_step();
                            }
                            return StopReason {
                                kind: Some(StopKind::Error),
                                error_type: Some("parse".to_string()),
                                error_text: Some(finalize_err.to_string()),
                                message_id,
                                model,
                                ..Default::default()
                            };
                        }
                    },
                }
            }
            "message_delta" => {
                if let Ok(payload) = serde_json::from_str::<MessageDelta>(&event.data) {
                    if payload.delta.stop_reason.is_some() {
                        stop_from_delta = payload.delta.stop_reason;
                    }
                    if let Some(delta_usage) = payload.usage {
                        let u = usage.get_or_insert_with(TokenUsage::default);
                        u.output_tokens = delta_usage.output_tokens;
                    }
                }
            }
            "message_stop" => break,
            "error" => {
                let (error_type, error_text) = serde_json::from_str::<ErrorEvent>(&event.data)
                    .map(|e| (e.error.error_type, e.error.message))
                    .unwrap_or_else(|_| ("error".to_string(), "upstream error".to_string()));
                let _ = writer.error(error_text.clone());
                if step_started {
                    let _ = writer.finish_step();
                }
                return StopReason {
                    kind: Some(StopKind::Error),
                    error_type: Some(error_type),
                    error_text: Some(error_text),
                    message_id,
                    model,
                    ..Default::default()
                };
            }
            // "ping" and any future event names are forward-compatible no-ops.
            _ => {}
        }
    }

    let kind = match stop_from_delta.as_deref() {
        Some("tool_use") => StopKind::ToolUse,
        Some("max_tokens") => StopKind::MaxTokens,
        Some("refusal") => StopKind::ContentFilter,
        Some("pause_turn") => StopKind::PauseTurn,
        _ => StopKind::Done,
    };

    StopReason {
        kind: Some(kind),
        model,
        message_id,
        tool_calls,
        assistant_text: text_seen.then_some(assistant_text),
        assistant_reasoning: reasoning_seen.then_some(reasoning_text),
        usage,
        ..Default::default()
    }
}

fn decode_error(
    writer: &Writer,
    step_started: bool,
    message_id: Option<String>,
    model: Option<String>,
) -> StopReason {
    let _ = writer.error("failed to decode upstream event");
    if step_started {
        let _ = writer.finish_step();
    }
    StopReason {
        kind: Some(StopKind::Error),
        error_type: Some("decode".to_string()),
        error_text: Some("failed to decode upstream event".to_string()),
        message_id,
        model,
        ..Default::default()
    }
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Debug, Deserialize)]
struct MessageStartInner {
    id: String,
    model: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: Option<u32>,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
}

impl AnthropicUsage {
    fn cached_tokens(&self) -> u32 {
        self.cache_creation_input_tokens.unwrap_or(0) + self.cache_read_input_tokens.unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: AnthropicBlock,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: ContentDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
    #[serde(rename = "signature_delta")]
    Signature { #[serde(default)] signature: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStop {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    #[serde(default)]
    usage: Option<MessageDeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaUsage {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ErrorEventInner,
}

#[derive(Debug, Deserialize)]
struct ErrorEventInner {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::Writer;
    use futures::stream;

    fn sse_bytes(event: &str, data: &str) -> Result<bytes::Bytes, reqwest::Error> {
        Ok(bytes::Bytes::from(format!("event: {event}\ndata: {data}\n\n")))
    }

    #[tokio::test]
    async fn text_only_stream_matches_scenario_one() {
        let writer = Writer::new(16);
        let mut lines = writer.setup().await;

        let chunks = vec![
            sse_bytes(
                "message_start",
                r#"{"message":{"id":"m1","model":"x","usage":{"input_tokens":1,"output_tokens":0}}}"#,
            ),
            sse_bytes("content_block_start", r#"{"index":0,"content_block":{"type":"text","text":""}}"#),
            sse_bytes(
                "content_block_delta",
                r#"{"index":0,"delta":{"type":"text_delta","text":"Hello "}}"#,
            ),
            sse_bytes(
                "content_block_delta",
                r#"{"index":0,"delta":{"type":"text_delta","text":"world"}}"#,
            ),
            sse_bytes("content_block_stop", r#"{"index":0}"#),
            sse_bytes("message_delta", r#"{"delta":{"stop_reason":"end_turn"}}"#),
            sse_bytes("message_stop", r#"{}"#),
        ];
        let cancel = CancellationToken::new();
        let stop = run(stream::iter(chunks), &writer, &cancel, false).await;

        assert_eq!(stop.kind(), StopKind::Done);
        assert_eq!(stop.model.as_deref(), Some("x"));
        assert_eq!(stop.message_id.as_deref(), Some("m1"));
        assert_eq!(stop.assistant_text.as_deref(), Some("Hello world"));

        writer.finish_step().unwrap();
        writer.finish().unwrap();
        writer.close().await;

        let mut out = Vec::new();
        while let Some(line) = futures::StreamExt::next(&mut lines).await {
            out.push(line);
        }
        assert!(out.iter().any(|l| l.contains("\"type\":\"start\"") && l.contains("m1")));
        assert!(out.iter().any(|l| l.contains("\"type\":\"text-end\"")));
        assert_eq!(out.last().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn malformed_tool_json_emits_parse_error() {
        let writer = Writer::new(16);
        let _lines = writer.setup().await;

        let chunks = vec![
            sse_bytes(
                "message_start",
                r#"{"message":{"id":"m1","model":"x","usage":{"input_tokens":0,"output_tokens":0}}}"#,
            ),
            sse_bytes(
                "content_block_start",
                r#"{"index":0,"content_block":{"type":"tool_use","id":"tu1","name":"lookup"}}"#,
            ),
            sse_bytes(
                "content_block_delta",
                r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"{\"q\":}"}}"#,
            ),
            sse_bytes("content_block_stop", r#"{"index":0}"#),
        ];
        let cancel = CancellationToken::new();
        let stop = run(stream::iter(chunks), &writer, &cancel, false).await;

        assert_eq!(stop.kind(), StopKind::Error);
        assert_eq!(stop.error_type.as_deref(), Some("parse"));
    }

    #[tokio::test]
    async fn unknown_block_and_delta_kinds_are_ignored() {
        let writer = Writer::new(16);
        let _lines = writer.setup().await;

        let chunks = vec![
            sse_bytes(
                "message_start",
                r#"{"message":{"id":"m1","model":"x","usage":{"input_tokens":0,"output_tokens":0}}}"#,
            ),
            sse_bytes(
                "content_block_start",
                r#"{"index":0,"content_block":{"type":"redacted_thinking"}}"#,
            ),
            sse_bytes(
                "content_block_delta",
                r#"{"index":0,"delta":{"type":"some_future_delta"}}"#,
            ),
            sse_bytes("content_block_stop", r#"{"index":0}"#),
            sse_bytes("message_delta", r#"{"delta":{"stop_reason":"end_turn"}}"#),
            sse_bytes("message_stop", r#"{}"#),
        ];
        let cancel = CancellationToken::new();
        let stop = run(stream::iter(chunks), &writer, &cancel, false).await;
        assert_eq!(stop.kind(), StopKind::Done);
    }
}
