//! SSE Writer (C1, spec §4.1).
//!
//! Grounded on the axum `Sse` + channel idiom seen in
//! `other_examples/3dba0cf8_ConaryLabs-Mira__mira-chat-src-server.rs.rs`
//! (`chat_stream_handler`: an `mpsc` channel feeding an `async_stream`
//! turned into `Sse<impl Stream<...>>`), generalized so the writer owns a
//! single background task (the "single writer goroutine" of spec §4.1)
//! that both serializes producer frames and interleaves the keepalive
//! ticker, rather than delegating keepalive to the HTTP framework. The
//! output is a plain `Stream<Item = String>` of rendered SSE lines so this
//! module stays decoupled from any particular HTTP server crate — an axum
//! (or other) handler adapts `Lines` into its own response type.

use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::error::ChatError;
use crate::model::{MessageId, UiPart};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_FRAME_QUEUE: usize = 32;
const DEFAULT_OUTPUT_QUEUE: usize = 32;

/// Protocol-version header value carried on the downstream response
/// (spec §6).
pub const PROTOCOL_VERSION: &str = "1";

/// The response headers the downstream SSE connection should carry
/// (spec §6). Framework-agnostic: callers attach these to whatever HTTP
/// response type they use.
pub fn response_headers() -> Vec<(&'static str, &'static str)> {
    vec![
        ("content-type", "text/event-stream"),
        (
            "cache-control",
            "no-cache, no-store, must-revalidate, no-transform",
        ),
        ("connection", "keep-alive"),
        ("x-accel-buffering", "no"),
        ("x-chatrelay-protocol-version", PROTOCOL_VERSION),
    ]
}

enum Frame {
    Part(UiPart),
    Raw(Value),
}

fn render(frame: &Frame) -> String {
    match frame {
        Frame::Part(part) => format!(
            "data: {}\n\n",
            serde_json::to_string(part).unwrap_or_else(|_| "{}".to_string())
        ),
        Frame::Raw(value) => format!("data: {value}\n\n"),
    }
}

/// Opaque id returned by `register_on_close`, used to unregister without
/// holding a pointer to the handler itself (spec §9 "arena+id").
pub type OnCloseId = u64;

#[derive(Default)]
struct OnCloseRegistry {
    next_id: u64,
    handlers: HashMap<u64, Box<dyn FnOnce() + Send>>,
}

impl OnCloseRegistry {
    fn register(&mut self, f: Box<dyn FnOnce() + Send>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers.insert(id, f);
        id
    }

    fn unregister(&mut self, id: u64) {
        self.handlers.remove(&id);
    }

    fn run_all(&mut self) {
        for (_, handler) in self.handlers.drain() {
            handler();
        }
    }
}

/// Handle producers (C2/C3/C6/C8) enqueue typed UI parts through. Cheap to
/// clone; every clone shares the same queue, close state, and onClose
/// registry.
#[derive(Clone)]
pub struct Writer {
    frame_tx: mpsc::Sender<Frame>,
    frame_rx: Arc<AsyncMutex<Option<mpsc::Receiver<Frame>>>>,
    set_up: Arc<AtomicBool>,
    close_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    join: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    on_close: Arc<Mutex<OnCloseRegistry>>,
}

/// The rendered SSE byte-line stream; whatever drives the HTTP response
/// body polls this.
pub struct Lines(mpsc::Receiver<String>);

impl Stream for Lines {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.0.poll_recv(cx)
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_QUEUE)
    }
}

impl Writer {
    pub fn new(queue_capacity: usize) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            frame_tx,
            frame_rx: Arc::new(AsyncMutex::new(Some(frame_rx))),
            set_up: Arc::new(AtomicBool::new(false)),
            close_tx: Arc::new(Mutex::new(None)),
            join: Arc::new(Mutex::new(None)),
            on_close: Arc::new(Mutex::new(OnCloseRegistry::default())),
        }
    }

    /// One-time setup (spec §4.1): writes the initial `: stream-start`
    /// comment, spawns the single writer loop, and returns the `Lines`
    /// stream the HTTP layer should drive. Panics if called twice.
    pub async fn setup(&self) -> Lines {
        if self.set_up.swap(true, Ordering::SeqCst) {
            panic!("sse::Writer::setup called more than once");
        }

        let mut frame_rx = self
            .frame_rx
            .lock()
            .await
            .take()
            .expect("frame_rx already taken");

        let (out_tx, out_rx) = mpsc::channel::<String>(DEFAULT_OUTPUT_QUEUE);
        let (close_tx, mut close_rx) = oneshot::channel();
        *self.close_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(close_tx);

        let on_close = self.on_close.clone();

        let handle = tokio::spawn(async move {
            if out_tx.send(": stream-start\n\n".to_string()).await.is_err() {
                run_on_close(&on_close);
                return;
            }

            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            keepalive.tick().await; // the first tick fires immediately; consume it

            loop {
                tokio::select! {
                    frame = frame_rx.recv() => {
                        match frame {
                            Some(f) => {
                                if out_tx.send(render(&f)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = out_tx.send("data: [DONE]\n\n".to_string()).await;
                                break;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        if out_tx.send(": keepalive\n\n".to_string()).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut close_rx => {
                        while let Ok(f) = frame_rx.try_recv() {
                            if out_tx.send(render(&f)).await.is_err() {
                                break;
                            }
                        }
                        let _ = out_tx.send("data: [DONE]\n\n".to_string()).await;
                        break;
                    }
                }
            }

            run_on_close(&on_close);
        });

        *self.join.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Lines(out_rx)
    }

    /// Signals the writer loop to drain and close without waiting for it
    /// to finish (used by `error`, which must return immediately per the
    /// typed-helper contract).
    fn fire_close_signal(&self) {
        if let Some(tx) = self
            .close_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
    }

    /// Idempotent close: signals the writer loop to drain and emit
    /// `[DONE]`, then blocks until it exits (spec §4.1 "Close ... blocks
    /// until the writer goroutine exits").
    pub async fn close(&self) {
        self.fire_close_signal();
        let handle = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Register a handler that runs once, whenever the writer stops for
    /// any reason (normal close, write error, or queue-receiver dropped).
    /// Used by C7 to auto-resolve pending approvals as "timeout".
    pub fn register_on_close<F>(&self, f: F) -> OnCloseId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut reg = self.on_close.lock().unwrap_or_else(|e| e.into_inner());
        reg.register(Box::new(f))
    }

    pub fn unregister_on_close(&self, id: OnCloseId) {
        let mut reg = self.on_close.lock().unwrap_or_else(|e| e.into_inner());
        reg.unregister(id);
    }

    fn enqueue(&self, part: UiPart) -> Result<(), ChatError> {
        if !self.set_up.load(Ordering::SeqCst) {
            return Err(ChatError::WriterClosed);
        }
        self.frame_tx.try_send(Frame::Part(part)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChatError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChatError::WriterClosed,
        })
    }

    pub fn start(&self, message_id: impl Into<MessageId>) -> Result<(), ChatError> {
        self.enqueue(UiPart::Start {
            message_id: message_id.into(),
        })
    }

    pub fn start_step(&self) -> Result<(), ChatError> {
        self.enqueue(UiPart::StartStep)
    }

    pub fn text_start(&self, id: impl Into<String>) -> Result<(), ChatError> {
        self.enqueue(UiPart::TextStart { id: id.into() })
    }

    pub fn text_delta(&self, id: impl Into<String>, delta: impl Into<String>) -> Result<(), ChatError> {
        self.enqueue(UiPart::TextDelta {
            id: id.into(),
            delta: delta.into(),
        })
    }

    pub fn text_end(&self, id: impl Into<String>) -> Result<(), ChatError> {
        self.enqueue(UiPart::TextEnd { id: id.into() })
    }

    pub fn reasoning_start(&self, id: impl Into<String>) -> Result<(), ChatError> {
        self.enqueue(UiPart::ReasoningStart { id: id.into() })
    }

    pub fn reasoning_delta(
        &self,
        id: impl Into<String>,
        delta: impl Into<String>,
    ) -> Result<(), ChatError> {
        self.enqueue(UiPart::ReasoningDelta {
            id: id.into(),
            delta: delta.into(),
        })
    }

    pub fn reasoning_end(&self, id: impl Into<String>) -> Result<(), ChatError> {
        self.enqueue(UiPart::ReasoningEnd { id: id.into() })
    }

    pub fn tool_input_start(
        &self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Result<(), ChatError> {
        self.enqueue(UiPart::ToolInputStart {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        })
    }

    pub fn tool_input_delta(
        &self,
        tool_call_id: impl Into<String>,
        input_text_delta: impl Into<String>,
    ) -> Result<(), ChatError> {
        self.enqueue(UiPart::ToolInputDelta {
            tool_call_id: tool_call_id.into(),
            input_text_delta: input_text_delta.into(),
        })
    }

    pub fn tool_input_available(
        &self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Result<(), ChatError> {
        self.enqueue(UiPart::ToolInputAvailable {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
        })
    }

    pub fn tool_output_available(
        &self,
        tool_call_id: impl Into<String>,
        output: Value,
    ) -> Result<(), ChatError> {
        self.enqueue(UiPart::ToolOutputAvailable {
            tool_call_id: tool_call_id.into(),
            output,
        })
    }

    pub fn tool_output_error(
        &self,
        tool_call_id: impl Into<String>,
        error_text: impl Into<String>,
    ) -> Result<(), ChatError> {
        self.enqueue(UiPart::ToolOutputError {
            tool_call_id: tool_call_id.into(),
            error_text: error_text.into(),
        })
    }

    pub fn finish_step(&self) -> Result<(), ChatError> {
        self.enqueue(UiPart::FinishStep)
    }

    pub fn finish(&self) -> Result<(), ChatError> {
        self.enqueue(UiPart::Finish)
    }

    /// Emits an `error` part and signals the writer to close (spec §4.1
    /// table: "and closes the writer"). Returns immediately; callers that
    /// still need to enqueue a trailing `finish-step` may do so right
    /// after — the close drain picks up anything queued before it runs
    /// (see scenario 3/4 ordering in spec §8). Call `close().await`
    /// afterwards to block until the writer has actually exited.
    pub fn error(&self, error_text: impl Into<String>) -> Result<(), ChatError> {
        let res = self.enqueue(UiPart::Error {
            error_text: error_text.into(),
        });
        self.fire_close_signal();
        res
    }

    /// `data-<Tag>` part (spec §4.1). Panics if `tag` does not start with
    /// `data-`, matching the teacher-style "programmer error" contract
    /// used for internal-API misuse elsewhere in the spec.
    pub fn data(&self, tag: impl Into<String>, id: impl Into<String>, data: Value) -> Result<(), ChatError> {
        let tag = tag.into();
        assert!(
            tag.starts_with("data-"),
            "data part tag must start with \"data-\", got {tag:?}"
        );
        if !self.set_up.load(Ordering::SeqCst) {
            return Err(ChatError::WriterClosed);
        }
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), Value::String(tag));
        obj.insert("id".to_string(), Value::String(id.into()));
        obj.insert("data".to_string(), data);
        self.frame_tx
            .try_send(Frame::Raw(Value::Object(obj)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChatError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ChatError::WriterClosed,
            })
    }
}

fn run_on_close(on_close: &Arc<Mutex<OnCloseRegistry>>) {
    let mut reg = on_close.lock().unwrap_or_else(|e| e.into_inner());
    reg.run_all();
}
