//! Dialect-B (OpenAI-style) event parser (C3, spec §4.3).
//!
//! Grounded on the teacher's `llm/openai.rs` streaming loop (same
//! `eventsource_stream::Eventsource` + `choices[0].delta` dispatch over
//! anonymous chunks), generalized to accumulate `tool_calls[]` fragments
//! by position rather than flattening them into a single `ToolCall` list
//! as the teacher's `chat_loop` did, so sparse/interleaved indices survive
//! (spec §9 open question).

use std::sync::atomic::{AtomicU64, Ordering};

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::StopReason;
use crate::error::StopKind;
use crate::model::{TokenUsage, ToolCallRequest};
use crate::sse::Writer;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> String {
    format!("msg-b-{}", NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
}

struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Runs the Dialect-B parser to completion. Unlike `anthropic::run`, this
/// parser emits `finish-step`/`finish` itself at EOF regardless of stop
/// kind (spec §4.3 point 3, confirmed by scenario 5 in §8) — the Step
/// Runner must not re-emit them for this dialect.
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

    let message_id = next_message_id();
    if !is_continuation {
        let _ = writer.start(&message_id);
    }
    let _ = writer.start_step();

    let mut text_id: Option<String> = None;
    let mut assistant_text = String::new();
    let mut finish_reason: Option<String> = None;
    let mut tool_frags: Vec<Option<PartialToolCall>> = Vec::new();
    let mut usage: Option<TokenUsage> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = writer.error("request cancelled");
                let _ = writer.finish_step();
                return StopReason {
                    kind: Some(StopKind::Canceled),
                    error_type: Some("cancelled".to_string()),
                    error_text: Some("request cancelled".to_string()),
                    message_id: Some(message_id),
                    ..Default::default()
                };
            }
            next = events.next() => next,
        };

        let Some(event) = next else {
            break;
        };

        let event = match event {
            Ok(event) => event,
            Err(err) => {
                let _ = writer.error(format!("stream error: {err}"));
                let _ = writer.finish_step();
                return StopReason {
                    kind: Some(StopKind::Error),
                    error_type: Some("stream".to_string()),
                    error_text: Some(err.to_string()),
                    message_id: Some(message_id),
                    ..Default::default()
                };
            }
        };

        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }

        let chunk = match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                log::warn!("skipping unparseable chat-completions chunk: {err}");
                continue;
            }
        };

        if let Some(chunk_usage) = chunk.usage {
            usage = Some(TokenUsage {
                input_tokens: chunk_usage.prompt_tokens,
                output_tokens: chunk_usage.completion_tokens,
                cached_tokens: 0,
            });
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    if text_id.is_none() {
                        let _ = writer.text_start(&message_id);
                        text_id = Some(message_id.clone());
                    }
                    assistant_text.push_str(&content);
                    let _ = writer.text_delta(&message_id, content);
                }
            }
            for frag in choice.delta.tool_calls {
                let idx = frag.index.unwrap_or(0);
                if tool_frags.len() <= idx {
                    tool_frags.resize_with(idx + 1, || None);
                }
                let entry = tool_frags[idx].get_or_insert_with(|| PartialToolCall {
                    id: None,
                    name: String::new(),
                    arguments: String::new(),
                });
                if let Some(id) = frag.id {
                    entry.id = Some(id);
                }
                if let Some(function) = frag.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                if !reason.is_empty() {
                    finish_reason = Some(reason);
                }
            }
        }
    }

    if text_id.is_some() {
        let _ = writer.text_end(&message_id);
    }
    let _ = writer.finish_step();
    let _ = writer.finish();

    let mut tool_calls = Vec::new();
    for (idx, frag) in tool_frags.into_iter().enumerate() {
        let Some(frag) = frag else { continue };
        if frag.arguments.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(&frag.arguments) {
            Ok(input) => tool_calls.push(ToolCallRequest {
                id: frag.id.unwrap_or_else(|| format!("call_{idx}")),
                name: frag.name,
                input,
            }),
            Err(err) => {
                log::warn!("skipping tool call with unparseable arguments: {err}");
            }
        }
    }

    let kind = match finish_reason.as_deref() {
        Some("length") => StopKind::MaxTokens,
        Some("tool_calls") => StopKind::ToolUse,
        _ => StopKind::Done,
    };

    StopReason {
        kind: Some(kind),
        message_id: Some(message_id),
        tool_calls,
        assistant_text: (!assistant_text.is_empty()).then_some(assistant_text),
        usage,
        ..Default::default()
    }
}

#[derive(Debug, Deserialize, Default)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize, Default)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallFragment>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize, Default)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::Writer;
    use futures::stream;

    fn sse_bytes(data: &str) -> Result<bytes::Bytes, reqwest::Error> {
        Ok(bytes::Bytes::from(format!("data: {data}\n\n")))
    }

    #[tokio::test]
    async fn text_and_tool_call_matches_scenario_five() {
        let writer = Writer::new(16);
        let mut lines = writer.setup().await;

        let chunks = vec![
            sse_bytes(r#"{"choices":[{"delta":{"content":"hi"}}]}"#),
            sse_bytes(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tc1","function":{"name":"add","arguments":"{\"a\":1"}}]}}]}"#,
            ),
            sse_bytes(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":",\"b\":2}"}}]}}]}"#,
            ),
            sse_bytes(r#"{"choices":[{"finish_reason":"tool_calls"}]}"#),
        ];
        let cancel = CancellationToken::new();
        let stop = run(stream::iter(chunks), &writer, &cancel, false).await;

        assert_eq!(stop.kind(), StopKind::ToolUse);
        assert_eq!(stop.tool_calls.len(), 1);
        assert_eq!(stop.tool_calls[0].id, "tc1");
        assert_eq!(stop.tool_calls[0].name, "add");
        assert_eq!(stop.tool_calls[0].input, serde_json::json!({"a": 1, "b": 2}));
        assert_eq!(stop.assistant_text.as_deref(), Some("hi"));

        writer.close().await;
        let mut out = Vec::new();
        while let Some(line) = lines.next().await {
            out.push(line);
        }
        assert!(out.iter().any(|l| l.contains("\"type\":\"finish\"")));
        assert_eq!(out.last().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn sparse_tool_call_indices_skip_empty_slots() {
        let writer = Writer::new(16);
        let _lines = writer.setup().await;

        let chunks = vec![sse_bytes(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":2,"id":"tc3","function":{"name":"f","arguments":"{}"}}]}}]}"#,
        )];
        let cancel = CancellationToken::new();
        let stop = run(stream::iter(chunks), &writer, &cancel, false).await;
        assert_eq!(stop.tool_calls.len(), 1);
        assert_eq!(stop.tool_calls[0].id, "tc3");
    }

    #[tokio::test]
    async fn unparseable_chunk_is_skipped_not_fatal() {
        let writer = Writer::new(16);
        let _lines = writer.setup().await;

        let chunks = vec![
            sse_bytes("not json"),
            sse_bytes(r#"{"choices":[{"delta":{"content":"ok"}}]}"#),
        ];
        let cancel = CancellationToken::new();
        let stop = run(stream::iter(chunks), &writer, &cancel, false).await;
        assert_eq!(stop.assistant_text.as_deref(), Some("ok"));
    }
}
