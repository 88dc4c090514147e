//! End-to-end exercise of the `ToolExecutor` seam and the chat loop's
//! approval path (spec §4.7/§4.8, scenario 6 in §8), driven over a mocked
//! upstream rather than a real provider.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chatrelay::approval::{self, ApprovalRegistry};
use chatrelay::chat_loop;
use chatrelay::config::{ApiType, ChatOpts};
use chatrelay::model::{
    ApprovalPolicy, ContentBlock, ToolCallRequest, ToolDefinition, ToolExecFuture, ToolExecutor,
    ToolResultContent,
};
use chatrelay::sse::Writer;
use chatrelay::{ChatError, StopKind};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Counts calls it receives and echoes its input back as `{"sum": a+b}`.
struct Calculator {
    calls: Arc<AtomicU32>,
}

impl ToolExecutor for Calculator {
    fn call(&self, call: ToolCallRequest) -> ToolExecFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let a = call.input.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
            let b = call.input.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!({ "sum": a + b }))
        })
    }
}

fn calculator_tool(calls: Arc<AtomicU32>) -> ToolDefinition {
    ToolDefinition {
        name: "calculator".to_string(),
        description: "adds two integers".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": { "a": {"type": "integer"}, "b": {"type": "integer"} },
        }),
        required_capabilities: HashSet::new(),
        display_hint: None,
        approval: ApprovalPolicy::RequireApproval,
        executor: Arc::new(Calculator { calls }),
    }
}

fn sse_body(events: &[&str]) -> String {
    events.iter().map(|e| format!("data: {e}\n\n")).collect::<Vec<_>>().join("")
}

#[tokio::test]
async fn approved_tool_call_executes_and_feeds_result_into_next_step() -> Result<(), ChatError> {
    let server = MockServer::start().await;

    let tool_call_step = sse_body(&[
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call1","function":{"name":"calculator","arguments":"{\"a\":2,\"b\":3}"}}]}}]}"#,
        r#"{"choices":[{"finish_reason":"tool_calls"}]}"#,
    ]);
    let final_step = sse_body(&[
        r#"{"choices":[{"delta":{"content":"5"}}]}"#,
        r#"{"choices":[{"finish_reason":"stop"}]}"#,
    ]);

    let n = Arc::new(AtomicU32::new(0));
    let n_responder = n.clone();
    Mock::given(method("POST"))
        .respond_with(move |_: &wiremock::Request| {
            let i = n_responder.fetch_add(1, Ordering::SeqCst);
            let body = if i == 0 { tool_call_step.clone() } else { final_step.clone() };
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(body, "text/event-stream")
        })
        .mount(&server)
        .await;

    let mut opts = ChatOpts::default();
    opts.api_type = ApiType::OpenAiCompatible;
    opts.base_url = server.uri();
    opts.model = "gpt-test".to_string();

    let calls = Arc::new(AtomicU32::new(0));
    let tools = vec![calculator_tool(calls.clone())];

    let writer = Writer::new(32);
    let mut lines = writer.setup().await;
    let registry = ApprovalRegistry::new();
    let cancel = CancellationToken::new();

    let registry_for_decision = registry.clone();
    let decide = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        registry_for_decision.update("call1", approval::APPROVED);
    });

    let result = chat_loop::run(
        &reqwest::Client::new(),
        &opts,
        &writer,
        &tools,
        &registry,
        &cancel,
        Vec::new(),
    )
    .await?;
    decide.await.unwrap();

    assert_eq!(result.stop_kind, StopKind::Done);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let tool_result = result
        .native_messages
        .iter()
        .find(|m| {
            matches!(
                m.content.first(),
                Some(ContentBlock::ToolResult { is_error: false, .. })
            )
        })
        .expect("a successful tool-result message");
    match &tool_result.content[0] {
        ContentBlock::ToolResult {
            content: ToolResultContent::Json(v),
            ..
        } => assert_eq!(v["sum"], 5),
        _ => panic!("expected json tool-result content"),
    }

    writer.close().await;
    let mut out = Vec::new();
    while let Some(line) = lines.next().await {
        out.push(line);
    }
    assert!(out.iter().any(|l| l.contains("\"type\":\"data-approval-request\"")));
    assert!(out.iter().any(|l| l.contains("\"type\":\"tool-output-available\"")));
    assert_eq!(out.last().unwrap(), "data: [DONE]\n\n");

    Ok(())
}
