//! Uniform message/part model (C9, spec §3 "Conversation" + §4.9).
//!
//! `Message` is the canonical, dialect-agnostic conversation history entry
//! (spec's "native message", generalized to a single shared shape rather
//! than one type per dialect — both wire dialects can be built from and
//! collapsed into the same block list, see `request::build`). `UiPart` is
//! the downstream part taxonomy the SSE writer (`sse::Writer`) serializes.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type MessageId = String;
pub type ToolCallId = String;

/// Message role in conversation (spec §3 "UI Message": role ∈
/// {system, user, assistant}; `Tool` is the internal history-only role
/// used for tool-result messages, never rendered as a UI message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// Where an image's bytes live (spec §4.5 "Image parts ... Source
/// variants: url, base64, file").
#[derive(Debug, Clone)]
pub enum ImageSource {
    Url(String),
    Base64 { data: String, media_type: String },
    File { file_id: String },
}

/// A single block of message content. This is the "native" content a
/// history entry carries; `request::build` maps it onto each dialect's
/// wire shape and `Message::to_ui_parts` maps it onto the UI taxonomy.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text { text: String },
    Reasoning { text: String },
    Image { source: ImageSource },
    ToolCall {
        id: ToolCallId,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: ToolCallId,
        content: ToolResultContent,
        is_error: bool,
    },
}

/// Tool-result payload (spec §4.5: "single text result collapses to a
/// string; otherwise an array of content blocks").
#[derive(Debug, Clone)]
pub enum ToolResultContent {
    Text(String),
    Json(serde_json::Value),
}

/// Token usage snapshot (spec §4.9 `Usage()`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
}

/// Best-effort rate-limit info surfaced from provider response headers
/// (SPEC_FULL.md §C). Never drives retry policy here.
#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    pub retry_after_ms: Option<u64>,
    pub requests_remaining: Option<u64>,
    pub tokens_remaining: Option<u64>,
}

/// One entry in conversation history (spec §3 "Chat ... ordered sequence
/// of native messages").
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn message_id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// Deep copy suitable for edit-before-send (spec §4.9 `Copy()`).
    pub fn copy(&self) -> Message {
        self.clone()
    }

    /// True if this message carries any tool-call blocks.
    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall { .. }))
    }

    /// Conversion to the UI-chat view (spec §4.9): assistant text,
    /// reasoning, and tool-use blocks become UI parts in `done` state.
    /// Tool-result messages (`role == Tool`) are internal history only and
    /// render as nothing.
    pub fn to_ui_parts(&self) -> Vec<UiPart> {
        if self.role != Role::Assistant {
            return Vec::new();
        }
        let mut parts = Vec::new();
        for block in &self.content {
            match block {
                ContentBlock::Text { text } => {
                    parts.push(UiPart::TextStart { id: self.id.clone() });
                    parts.push(UiPart::TextDelta {
                        id: self.id.clone(),
                        delta: text.clone(),
                    });
                    parts.push(UiPart::TextEnd { id: self.id.clone() });
                }
                ContentBlock::Reasoning { text } => {
                    parts.push(UiPart::ReasoningStart { id: self.id.clone() });
                    parts.push(UiPart::ReasoningDelta {
                        id: self.id.clone(),
                        delta: text.clone(),
                    });
                    parts.push(UiPart::ReasoningEnd { id: self.id.clone() });
                }
                ContentBlock::ToolCall { id, name, input } => {
                    parts.push(UiPart::ToolInputAvailable {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                        input: input.clone(),
                    });
                }
                ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
            }
        }
        parts
    }
}

/// Downstream SSE part taxonomy (spec §3 "UI Part", §4.1 typed helpers).
/// `data-<Tag>` parts carry a caller-supplied dynamic tag and are built
/// directly by `sse::Writer::data` rather than through this enum.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum UiPart {
    #[serde(rename = "start")]
    Start { message_id: MessageId },
    #[serde(rename = "start-step")]
    StartStep,
    #[serde(rename = "text-start")]
    TextStart { id: String },
    #[serde(rename = "text-delta")]
    TextDelta { id: String, delta: String },
    #[serde(rename = "text-end")]
    TextEnd { id: String },
    #[serde(rename = "reasoning-start")]
    ReasoningStart { id: String },
    #[serde(rename = "reasoning-delta")]
    ReasoningDelta { id: String, delta: String },
    #[serde(rename = "reasoning-end")]
    ReasoningEnd { id: String },
    #[serde(rename = "tool-input-start")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename = "tool-input-delta")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    #[serde(rename = "tool-input-available")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool-output-available")]
    ToolOutputAvailable {
        tool_call_id: String,
        output: serde_json::Value,
    },
    #[serde(rename = "tool-output-error")]
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    #[serde(rename = "file")]
    File {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    #[serde(rename = "source-url")]
    SourceUrl { url: String },
    #[serde(rename = "source-document")]
    SourceDocument { source_id: String },
    #[serde(rename = "finish-step")]
    FinishStep,
    #[serde(rename = "finish")]
    Finish,
    #[serde(rename = "error")]
    Error { error_text: String },
}

/// Future returned by a `ToolExecutor`.
pub type ToolExecFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>;

/// In-process callback a `ToolDefinition` uses to execute a call once
/// approved (spec §3 "The definition carries an in-process callback").
pub trait ToolExecutor: Send + Sync {
    fn call(&self, call: ToolCallRequest) -> ToolExecFuture;
}

impl<F> ToolExecutor for F
where
    F: Fn(ToolCallRequest) -> ToolExecFuture + Send + Sync,
{
    fn call(&self, call: ToolCallRequest) -> ToolExecFuture {
        (self)(call)
    }
}

/// Whether a tool call must go through the approval registry (C7) before
/// running (spec §4.8 "ExecuteOrApprove dispatches on the tool's declared
/// policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    Auto,
    RequireApproval,
}

/// A tool call requested by the model mid-stream (spec §3 `toolCalls`
/// entries, §4.8 `stop.ToolCalls`).
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: ToolCallId,
    pub name: String,
    pub input: serde_json::Value,
}

/// Tool definition (spec §3 "Tool definition").
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub required_capabilities: HashSet<String>,
    pub display_hint: Option<serde_json::Value>,
    pub approval: ApprovalPolicy,
    pub executor: Arc<dyn ToolExecutor>,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("approval", &self.approval)
            .finish()
    }
}

impl ToolDefinition {
    /// True iff every required capability is present in `available`
    /// (spec §3 "a tool is offered to the upstream only if all its
    /// required capabilities are present").
    pub fn available_with(&self, available: &HashSet<String>) -> bool {
        self.required_capabilities.is_subset(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: Vec<ContentBlock>) -> Message {
        Message {
            id: "m1".to_string(),
            role,
            content,
            usage: None,
        }
    }

    #[test]
    fn tool_messages_render_no_ui_parts() {
        let m = msg(
            Role::Tool,
            vec![ContentBlock::ToolResult {
                tool_use_id: "tc1".to_string(),
                content: ToolResultContent::Text("42".to_string()),
                is_error: false,
            }],
        );
        assert!(m.to_ui_parts().is_empty());
    }

    #[test]
    fn assistant_text_becomes_start_delta_end() {
        let m = msg(
            Role::Assistant,
            vec![ContentBlock::Text {
                text: "hi".to_string(),
            }],
        );
        let parts = m.to_ui_parts();
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[0], UiPart::TextStart { .. }));
        assert!(matches!(parts[1], UiPart::TextDelta { .. }));
        assert!(matches!(parts[2], UiPart::TextEnd { .. }));
    }

    #[test]
    fn capability_gating_requires_full_subset() {
        let mut required = HashSet::new();
        required.insert("fs".to_string());
        required.insert("net".to_string());

        let tool = ToolDefinition {
            name: "t".to_string(),
            description: String::new(),
            input_schema: serde_json::json!({}),
            required_capabilities: required,
            display_hint: None,
            approval: ApprovalPolicy::Auto,
            executor: Arc::new(|_: ToolCallRequest| -> ToolExecFuture {
                Box::pin(async { Ok(serde_json::json!(null)) })
            }),
        };

        let mut available = HashSet::new();
        available.insert("fs".to_string());
        assert!(!tool.available_with(&available));

        available.insert("net".to_string());
        assert!(tool.available_with(&available));
    }
}
