//! Request Builder (C5, spec §4.5).
//!
//! Grounded on the teacher's `build_request_body`/`build_create_message_request`
//! (`llm/anthropic.rs`) and `ChatCompletionRequest` construction
//! (`llm/openai.rs`), generalized from a fixed one-shot `prompt: &str` to the
//! uniform `&[Message]` history + `&[ToolDefinition]` the Chat Loop
//! Controller (C8) produces.

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{ApiType, ChatOpts};
use crate::error::ChatError;
use crate::model::{ContentBlock, ImageSource, Message, Role, ToolDefinition, ToolResultContent};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A fully-built outbound request, ready for `step::run` to hand to
/// `reqwest::Client::post(..).headers(..).json(..)`.
pub struct PreparedRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

pub fn build(
    opts: &ChatOpts,
    history: &[Message],
    tools: &[ToolDefinition],
) -> Result<PreparedRequest, ChatError> {
    let available_tools: Vec<&ToolDefinition> = tools
        .iter()
        .filter(|t| t.available_with(&opts.capabilities))
        .collect();

    match opts.api_type {
        ApiType::Anthropic => build_anthropic(opts, history, &available_tools),
        ApiType::OpenAiCompatible => build_openai(opts, history, &available_tools),
    }
}

fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("gpt-5") || model.starts_with("o1") || model.starts_with("gpt-4o")
}

// ---------------------------------------------------------------------
// Dialect-A (Anthropic-style)
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    #[serde(rename = "image")]
    Image { source: Value },
}

fn anthropic_image_source(source: &ImageSource) -> Result<Value, ChatError> {
    match source {
        ImageSource::Url(url) => Ok(json!({"type": "url", "url": url})),
        ImageSource::Base64 { data, media_type } => {
            if media_type.is_empty() {
                return Err(ChatError::Build(
                    "base64 image source requires media_type".to_string(),
                ));
            }
            Ok(json!({"type": "base64", "media_type": media_type, "data": data}))
        }
        ImageSource::File { file_id } => {
            if file_id.is_empty() {
                return Err(ChatError::Build(
                    "file image source requires file_id".to_string(),
                ));
            }
            Ok(json!({"type": "file", "file_id": file_id}))
        }
    }
}

fn tool_result_content(content: &ToolResultContent) -> Value {
    match content {
        ToolResultContent::Text(text) => Value::String(text.clone()),
        ToolResultContent::Json(value) => {
            json!([{"type": "text", "text": value.to_string()}])
        }
    }
}

fn build_anthropic(
    opts: &ChatOpts,
    history: &[Message],
    tools: &[&ToolDefinition],
) -> Result<PreparedRequest, ChatError> {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for msg in history {
        match msg.role {
            Role::System => {
                for block in &msg.content {
                    if let ContentBlock::Text { text } = block {
                        system_parts.push(text.clone());
                    }
                }
            }
            Role::User | Role::Assistant => {
                let mut blocks = Vec::new();
                for block in &msg.content {
                    match block {
                        ContentBlock::Text { text } => {
                            blocks.push(AnthropicBlock::Text { text: text.clone() });
                        }
                        ContentBlock::Image { source } => {
                            if msg.role == Role::Assistant {
                                log::warn!("dropping image part on assistant message {}", msg.id);
                                continue;
                            }
                            blocks.push(AnthropicBlock::Image {
                                source: anthropic_image_source(source)?,
                            });
                        }
                        ContentBlock::ToolCall { id, name, input } => {
                            if msg.role != Role::Assistant {
                                log::warn!("dropping tool-call part on non-assistant message {}", msg.id);
                                continue;
                            }
                            blocks.push(AnthropicBlock::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            });
                        }
                        ContentBlock::Reasoning { .. } => {
                            log::debug!("dropping reasoning part from native replay for {}", msg.id);
                        }
                        ContentBlock::ToolResult { .. } => {
                            log::warn!("dropping stray tool-result part on {} message {}", msg.role, msg.id);
                        }
                    }
                }
                if !blocks.is_empty() {
                    messages.push(AnthropicMessage {
                        role: if msg.role == Role::User { "user" } else { "assistant" },
                        content: blocks,
                    });
                }
            }
            Role::Tool => {
                let mut blocks = Vec::new();
                for block in &msg.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        blocks.push(AnthropicBlock::ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            content: tool_result_content(content),
                            is_error: *is_error,
                        });
                    }
                }
                if !blocks.is_empty() {
                    messages.push(AnthropicMessage {
                        role: "user",
                        content: blocks,
                    });
                }
            }
        }
    }

    let mut body = json!({
        "model": opts.model,
        "max_tokens": opts.effective_max_tokens(),
        "stream": true,
        "messages": messages,
    });

    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n"));
    }

    if !tools.is_empty() {
        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = json!(wire_tools);
        body["tool_choice"] = json!({"type": "auto"});
    }

    if let Some(budget) = opts.thinking_budget() {
        body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }

    let mut headers = vec![
        ("content-type", "application/json".to_string()),
        ("accept", "text/event-stream".to_string()),
    ];
    if let Some(token) = &opts.api_token {
        headers.push(("x-api-key", token.clone()));
    }
    headers.push((
        "anthropic-version",
        opts.api_version
            .clone()
            .unwrap_or_else(|| ANTHROPIC_VERSION.to_string()),
    ));

    Ok(PreparedRequest {
        url: format!("{}/v1/messages", opts.base_url.trim_end_matches('/')),
        headers,
        body,
    })
}

// ---------------------------------------------------------------------
// Dialect-B (OpenAI-style)
// ---------------------------------------------------------------------

fn openai_image_part(source: &ImageSource) -> Result<Value, ChatError> {
    let url = match source {
        ImageSource::Url(url) => url.clone(),
        ImageSource::Base64 { data, media_type } => {
            if media_type.is_empty() {
                return Err(ChatError::Build(
                    "base64 image source requires media_type".to_string(),
                ));
            }
            format!("data:{media_type};base64,{data}")
        }
        ImageSource::File { file_id } => {
            if file_id.is_empty() {
                return Err(ChatError::Build(
                    "file image source requires file_id".to_string(),
                ));
            }
            return Ok(json!({"type": "file", "file": {"file_id": file_id}}));
        }
    };
    Ok(json!({"type": "image_url", "image_url": {"url": url}}))
}

fn build_openai(
    opts: &ChatOpts,
    history: &[Message],
    tools: &[&ToolDefinition],
) -> Result<PreparedRequest, ChatError> {
    let mut messages = Vec::new();

    for msg in history {
        match msg.role {
            Role::System => {
                for block in &msg.content {
                    if let ContentBlock::Text { text } = block {
                        messages.push(json!({"role": "system", "content": text}));
                    }
                }
            }
            Role::User => {
                let mut text = String::new();
                let mut parts: Vec<Value> = Vec::new();
                for block in &msg.content {
                    match block {
                        ContentBlock::Text { text: t } => text.push_str(t),
                        ContentBlock::Image { source } => parts.push(openai_image_part(source)?),
                        _ => log::warn!("dropping unsupported part on user message {}", msg.id),
                    }
                }
                if parts.is_empty() {
                    messages.push(json!({"role": "user", "content": text}));
                } else {
                    if !text.is_empty() {
                        parts.insert(0, json!({"type": "text", "text": text}));
                    }
                    messages.push(json!({"role": "user", "content": parts}));
                }
            }
            Role::Assistant => {
                let mut text = String::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                for block in &msg.content {
                    match block {
                        ContentBlock::Text { text: t } => text.push_str(t),
                        ContentBlock::Reasoning { .. } => {
                            log::debug!("dropping reasoning part from native replay for {}", msg.id);
                        }
                        ContentBlock::ToolCall { id, name, input } => {
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": input.to_string()},
                            }));
                        }
                        ContentBlock::Image { .. } => {
                            log::warn!("dropping image part on assistant message {}", msg.id);
                        }
                        ContentBlock::ToolResult { .. } => {
                            log::warn!("dropping stray tool-result part on assistant message {}", msg.id);
                        }
                    }
                }
                let mut entry = json!({"role": "assistant"});
                entry["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = json!(tool_calls);
                }
                messages.push(entry);
            }
            Role::Tool => {
                for block in &msg.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        let text = match content {
                            ToolResultContent::Text(text) => text.clone(),
                            ToolResultContent::Json(value) => value.to_string(),
                        };
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": text,
                        }));
                    }
                }
            }
        }
    }

    let mut body = json!({
        "model": opts.model,
        "messages": messages,
        "stream": true,
    });

    if is_reasoning_model(&opts.model) {
        body["max_completion_tokens"] = json!(opts.effective_max_tokens());
    } else {
        body["max_tokens"] = json!(opts.effective_max_tokens());
    }

    if !tools.is_empty() {
        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        body["tools"] = json!(wire_tools);
    }

    let mut headers = vec![
        ("content-type", "application/json".to_string()),
        ("accept", "text/event-stream".to_string()),
    ];
    if let Some(token) = &opts.api_token {
        headers.push(("authorization", format!("Bearer {token}")));
    }

    Ok(PreparedRequest {
        url: opts.base_url.clone(),
        headers,
        body,
    })
}
