//! Step Runner (C6, spec §4.6).
//!
//! Grounded on the teacher's `chat_loop` per-request open/stream/close cycle
//! in `llm/anthropic.rs` (HTTP send, non-200 handling, `bytes_stream()` into
//! the dialect decoder), lifted out of the provider struct into a standalone
//! function over both dialect parsers. `sse.Setup` itself is owned by the
//! Chat Loop Controller (C8), called exactly once before the first step, so
//! this module never touches it — that already satisfies "first step only".

use std::time::Duration;

use futures::StreamExt;

use crate::config::{ApiType, ChatOpts};
use crate::error::{ChatError, StopKind};
use crate::model::{ContentBlock, Message, RateLimitInfo, ToolDefinition};
use crate::parser::{anthropic, openai, StopReason};
use crate::request;
use crate::sse::Writer;
use tokio_util::sync::CancellationToken;

/// Marks a step as the continuation of a prior tool-use pause (spec §4.6
/// input: "optional `continue` marker").
#[derive(Debug, Clone)]
pub struct Continuation {
    pub message_id: Option<String>,
    pub model: Option<String>,
}

pub struct StepOutput {
    pub stop: StopReason,
    pub native_messages: Vec<Message>,
    pub rate_limit: RateLimitInfo,
}

/// Runs one upstream request/response for one chat step (spec §4.6
/// algorithm points 1-8). `err` is reserved for pre-stream failures only;
/// once streaming begins, everything is folded into `stop.Kind = error`.
pub async fn run(
    client: &reqwest::Client,
    opts: &ChatOpts,
    writer: &Writer,
    cancel: &CancellationToken,
    history: &[Message],
    tools: &[ToolDefinition],
    continuation: Option<&Continuation>,
) -> Result<StepOutput, ChatError> {
    let prepared = request::build(opts, history, tools)?;

    let mut req = client.post(&prepared.url);
    for (name, value) in &prepared.headers {
        req = req.header(*name, value);
    }
    req = req.json(&prepared.body);
    if opts.timeout_ms > 0 {
        req = req.timeout(Duration::from_millis(opts.timeout_ms));
    }

    let response = req.send().await?;
    let rate_limit = extract_rate_limit(response.headers());
    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !status.is_success() {
        let prefix = read_bounded_prefix(response, 500).await;
        return Err(decode_http_error(status.as_u16(), &prefix));
    }
    if !content_type.as_deref().is_some_and(|ct| ct.starts_with("text/event-stream")) {
        let prefix = read_bounded_prefix(response, 500).await;
        return Err(ChatError::NotEventStream {
            content_type,
            body: extract_envelope_message(&prefix),
        });
    }

    let is_continuation = continuation.is_some();
    let byte_stream = response.bytes_stream();

    let stop = match opts.api_type {
        ApiType::Anthropic => anthropic::run(byte_stream, writer, cancel, is_continuation).await,
        ApiType::OpenAiCompatible => openai::run(byte_stream, writer, cancel, is_continuation).await,
    };

    // Dialect-A defers finish-step/finish to the step runner on every path
    // except cancel/error (where it already bracketed the step itself).
    // Dialect-B always brackets the step itself (spec §4.3 point 3,
    // confirmed by scenario 5 in §8) — nothing left for us to emit there.
    if matches!(opts.api_type, ApiType::Anthropic)
        && !matches!(stop.kind(), StopKind::Canceled | StopKind::Error)
    {
        let _ = writer.finish_step();
        if stop.kind() != StopKind::ToolUse {
            let _ = writer.finish();
        }
    }

    let native_messages = to_native_messages(&stop);

    Ok(StepOutput {
        stop,
        native_messages,
        rate_limit,
    })
}

fn to_native_messages(stop: &StopReason) -> Vec<Message> {
    let mut content = Vec::new();
    if let Some(text) = &stop.assistant_text {
        content.push(ContentBlock::Text { text: text.clone() });
    }
    if let Some(reasoning) = &stop.assistant_reasoning {
        content.push(ContentBlock::Reasoning {
            text: reasoning.clone(),
        });
    }
    for call in &stop.tool_calls {
        content.push(ContentBlock::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }
    if content.is_empty() {
        return Vec::new();
    }
    vec![Message {
        id: stop.message_id.clone().unwrap_or_default(),
        role: crate::model::Role::Assistant,
        content,
        usage: stop.usage,
    }]
}

async fn read_bounded_prefix(response: reqwest::Response, limit: usize) -> String {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::with_capacity(limit);
    while buf.len() < limit {
        match stream.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(limit);
    String::from_utf8_lossy(&buf).into_owned()
}

fn decode_http_error(status: u16, body_prefix: &str) -> ChatError {
    ChatError::Http {
        status,
        body: extract_envelope_message(body_prefix),
    }
}

/// Decodes a provider error envelope (`{"error": {"message": ...}}`) out of
/// a bounded body prefix if possible (spec §4.6 point 3), falling back to
/// the raw prefix otherwise.
fn extract_envelope_message(body_prefix: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body_prefix) {
        if let Some(message) = value.pointer("/error/message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    body_prefix.to_string()
}

/// Best-effort passthrough of provider rate-limit headers (SPEC_FULL.md §C
/// "Rate-limit plumbing"). Never drives retry policy here.
fn extract_rate_limit(headers: &reqwest::header::HeaderMap) -> RateLimitInfo {
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
    };

    RateLimitInfo {
        retry_after_ms: header_u64("retry-after").map(|secs| secs * 1000),
        requests_remaining: header_u64("anthropic-ratelimit-requests-remaining")
            .or_else(|| header_u64("x-ratelimit-remaining-requests")),
        tokens_remaining: header_u64("anthropic-ratelimit-tokens-remaining")
            .or_else(|| header_u64("x-ratelimit-remaining-tokens")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_http_error_extracts_provider_envelope_message() {
        let err = decode_http_error(400, r#"{"error":{"message":"bad request"}}"#);
        match err {
            ChatError::Http { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad request");
            }
            _ => panic!("expected Http error"),
        }
    }

    #[test]
    fn decode_http_error_falls_back_to_raw_body() {
        let err = decode_http_error(500, "internal server error");
        match err {
            ChatError::Http { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "internal server error");
            }
            _ => panic!("expected Http error"),
        }
    }

    #[test]
    fn extract_rate_limit_reads_known_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "2".parse().unwrap());
        headers.insert(
            "anthropic-ratelimit-requests-remaining",
            "10".parse().unwrap(),
        );
        let info = extract_rate_limit(&headers);
        assert_eq!(info.retry_after_ms, Some(2000));
        assert_eq!(info.requests_remaining, Some(10));
    }

    #[test]
    fn extract_envelope_message_used_by_not_event_stream_path_too() {
        assert_eq!(
            extract_envelope_message(r#"{"error":{"message":"not json lines"}}"#),
            "not json lines"
        );
        assert_eq!(extract_envelope_message("<html>502</html>"), "<html>502</html>");
    }
}
