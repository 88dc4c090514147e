//! Error taxonomy for the streaming core (spec §7).
//!
//! `StopKind` is the normalized terminal verdict for a step (§7 table);
//! `ChatError` covers everything that can go wrong before a stream is even
//! opened. Once streaming has begun, failures are folded into a `StopKind`
//! and surfaced as a downstream `error` part instead of a Rust `Err` — see
//! `step::run`.

use std::fmt;

/// Pre-stream or fatal construction failures.
///
/// Anything reaching this point has not yet opened an SSE response (or, for
/// a continuation step, is reported as a downstream `error` part instead of
/// returned here — see spec §7 "Propagation policy").
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    Build(String),

    #[error("upstream returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("upstream response was not an event stream (content-type: {content_type:?}): {body}")]
    NotEventStream {
        content_type: Option<String>,
        body: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("approval registry error: {0}")]
    Approval(String),

    #[error("sse writer closed")]
    WriterClosed,

    #[error("sse frame queue full")]
    QueueFull,
}

/// The kind half of a normalized stop reason (spec §3 `stopFromDelta`, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Done,
    ToolUse,
    MaxTokens,
    ContentFilter,
    PauseTurn,
    Canceled,
    Error,
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopKind::Done => "done",
            StopKind::ToolUse => "tool_use",
            StopKind::MaxTokens => "max_tokens",
            StopKind::ContentFilter => "content_filter",
            StopKind::PauseTurn => "pause_turn",
            StopKind::Canceled => "canceled",
            StopKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Subtype carried by `StopKind::Error` (spec §7 taxonomy table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSubtype {
    Decode,
    Parse,
    Stream,
    Http,
    Build,
}

impl fmt::Display for ErrorSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSubtype::Decode => "decode",
            ErrorSubtype::Parse => "parse",
            ErrorSubtype::Stream => "stream",
            ErrorSubtype::Http => "http",
            ErrorSubtype::Build => "build",
        };
        f.write_str(s)
    }
}
