//! Chat Loop Controller (C8, spec §4.8).
//!
//! Grounded on the teacher's `chat_loop_with_tools` (`llm/helpers.rs`) round
//! loop shape (run a step, dispatch pending tool calls, append results,
//! repeat until a non-tool-use terminal) and `prune_message_tool_turns`
//! (`llm/anthropic.rs`) for the tool-turn pruning between rounds. Owns
//! `sse::Writer::setup` (called exactly once, before the first step) since
//! that is the point genuinely scoped to "one client HTTP request" — see
//! `step::run`'s module doc comment for why the Step Runner itself does not
//! call it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::approval::{self, ApprovalRegistry};
use crate::config::ChatOpts;
use crate::error::{ChatError, StopKind};
use crate::model::{
    ApprovalPolicy, ContentBlock, Message, RateLimitInfo, Role, ToolCallRequest, ToolDefinition,
    ToolResultContent,
};
use crate::sse::{Lines, Writer};
use crate::step::{self, Continuation};

/// Everything the loop accumulated over the life of one client request
/// (spec §4.9 `Chat.NativeMessages`).
pub struct ChatResult {
    pub native_messages: Vec<Message>,
    pub stop_kind: StopKind,
    pub rate_limit: RateLimitInfo,
}

/// Sets up the SSE writer and spawns the loop for one client HTTP request,
/// returning the `Lines` stream the caller's HTTP layer should drive and a
/// handle resolving once the loop (and so the SSE response) has finished.
///
/// `writer.setup()` is called here, once, before the first step runs —
/// that is this function's entire contribution to "first step only"
/// beyond what the Step Runner already does per-dialect.
pub async fn start(
    client: reqwest::Client,
    opts: ChatOpts,
    history: Vec<Message>,
    tools: Vec<ToolDefinition>,
    registry: Arc<ApprovalRegistry>,
    cancel: CancellationToken,
) -> (Lines, tokio::task::JoinHandle<Result<ChatResult, ChatError>>) {
    let writer = Writer::default();
    let lines = writer.setup().await;

    let handle = tokio::spawn(async move {
        run(&client, &opts, &writer, &tools, &registry, &cancel, history).await
    });

    (lines, handle)
}

/// The loop body itself (spec §4.8 pseudocode), separated from `start` so
/// tests can drive it directly against an already-set-up `Writer`.
pub async fn run(
    client: &reqwest::Client,
    opts: &ChatOpts,
    writer: &Writer,
    tools: &[ToolDefinition],
    registry: &Arc<ApprovalRegistry>,
    cancel: &CancellationToken,
    mut history: Vec<Message>,
) -> Result<ChatResult, ChatError> {
    // `history` is what gets sent to the next step, and is the only thing
    // `max_tool_turns` ever prunes. `native_messages` is the append-only
    // record of everything this request produced (spec §3/§4.9
    // `Chat.NativeMessages`) and is never pruned, so replay still sees the
    // full conversation even once old tool turns drop out of the context
    // window sent upstream.
    let mut native_messages = Vec::new();
    let mut continuation: Option<Continuation> = None;
    let mut rate_limit = RateLimitInfo::default();

    loop {
        let output = step::run(
            client,
            opts,
            writer,
            cancel,
            &history,
            tools,
            continuation.as_ref(),
        )
        .await?;

        rate_limit = output.rate_limit;
        history.extend(output.native_messages.iter().cloned());
        native_messages.extend(output.native_messages);

        match output.stop.kind() {
            StopKind::ToolUse => {
                for call in &output.stop.tool_calls {
                    let result = execute_or_approve(writer, tools, registry, cancel, call).await;
                    history.push(result.clone());
                    native_messages.push(result);
                }
                if let Some(max_turns) = opts.max_tool_turns {
                    prune_tool_turns(&mut history, max_turns);
                }
                continuation = Some(Continuation {
                    message_id: output.stop.message_id.clone(),
                    model: output.stop.model.clone(),
                });
            }
            kind => {
                return Ok(ChatResult {
                    native_messages,
                    stop_kind: kind,
                    rate_limit,
                });
            }
        }
    }
}

/// Dispatches one tool call on its declared approval policy (spec §4.8
/// `ExecuteOrApprove`) and returns the `tool` message to append to history.
async fn execute_or_approve(
    writer: &Writer,
    tools: &[ToolDefinition],
    registry: &Arc<ApprovalRegistry>,
    cancel: &CancellationToken,
    call: &ToolCallRequest,
) -> Message {
    let Some(tool) = tools.iter().find(|t| t.name == call.name) else {
        let text = format!("unknown tool: {}", call.name);
        let _ = writer.tool_output_error(call.id.as_str(), text.as_str());
        return tool_result_message(call, ToolResultContent::Text(text), true);
    };

    if tool.approval == ApprovalPolicy::RequireApproval {
        let hint = tool
            .display_hint
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        let _ = writer.data(
            "data-approval-request",
            call.id.as_str(),
            serde_json::json!({
                "toolCallId": call.id,
                "toolName": call.name,
                "input": call.input,
                "displayHint": hint,
            }),
        );

        registry.register(call.id.clone(), writer);
        let decision = registry
            .wait(&call.id, cancel)
            .await
            .unwrap_or_else(|_| approval::TIMEOUT.to_string());

        if decision != approval::APPROVED {
            let reason = match decision.as_str() {
                approval::DENIED => "denied",
                approval::TIMEOUT => "timed out",
                "" => "cancelled",
                other => other,
            };
            let _ = writer.tool_output_error(call.id.as_str(), reason);
            return tool_result_message(call, ToolResultContent::Text(reason.to_string()), true);
        }
    }

    match tool.executor.call(call.clone()).await {
        Ok(output) => {
            let _ = writer.tool_output_available(call.id.as_str(), output.clone());
            tool_result_message(call, ToolResultContent::Json(output), false)
        }
        Err(err) => {
            let _ = writer.tool_output_error(call.id.as_str(), err.as_str());
            tool_result_message(call, ToolResultContent::Text(err), true)
        }
    }
}

fn tool_result_message(call: &ToolCallRequest, content: ToolResultContent, is_error: bool) -> Message {
    Message {
        id: format!("tool-result-{}", call.id),
        role: Role::Tool,
        content: vec![ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content,
            is_error,
        }],
        usage: None,
    }
}

/// Bounds the number of tool-call/tool-result turns kept in history
/// (SPEC_FULL.md §C "Tool call loop-turn pruning"), generalized from the
/// teacher's `prune_message_tool_turns`/`prune_tool_turns` (same
/// assistant-with-tool-calls-then-following-tool-messages range detection,
/// drop the oldest ranges first).
fn prune_tool_turns(history: &mut Vec<Message>, max_turns: usize) {
    if max_turns == 0 {
        return;
    }

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < history.len() {
        if history[i].role() == Role::Assistant && history[i].has_tool_calls() {
            let start = i;
            i += 1;
            while i < history.len() && history[i].role() == Role::Tool {
                i += 1;
            }
            ranges.push((start, i));
        } else {
            i += 1;
        }
    }

    if ranges.len() > max_turns {
        let to_remove = ranges.len() - max_turns;
        for &(start, end) in ranges.iter().take(to_remove).rev() {
            history.drain(start..end);
        }
    }
}
