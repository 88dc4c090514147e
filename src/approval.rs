//! Tool Approval Registry (C7, spec §4.7).
//!
//! No direct teacher precedent — `llm/provider.rs`'s `ChatLoopHandle` has a
//! single loop-wide `submit_tool_results` channel, not a per-call-id
//! rendezvous. Built from the rendezvous shape spec §4.7 describes, reusing
//! the teacher's shared-state idiom (`Arc<RwLock<_>>` in `ProviderState`)
//! generalized to a `Mutex<HashMap<_>>` keyed registry plus a
//! `tokio::sync::oneshot` per pending call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::sse::{OnCloseId, Writer};

/// A tool-approval decision (spec §4.7: "domain tags, not strings of the
/// protocol"). Empty string means "no decision / treat as not approved".
pub type Decision = String;

pub const APPROVED: &str = "approved";
pub const DENIED: &str = "denied";
pub const TIMEOUT: &str = "timeout";

struct Entry {
    done_tx: Option<oneshot::Sender<Decision>>,
    done_rx: Option<oneshot::Receiver<Decision>>,
    on_close_id: Option<OnCloseId>,
    writer: Writer,
}

/// Process-wide registry, scoped logically to live SSE connections via each
/// entry's `onClose` hook (spec §3 "Approval rendezvous").
#[derive(Default)]
pub struct ApprovalRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ApprovalRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a fresh pending approval for `tool_call_id` and arranges for
    /// it to auto-resolve to `timeout` if `writer` closes before a decision
    /// arrives (spec §4.7 `Register`).
    pub fn register(self: &Arc<Self>, tool_call_id: impl Into<String>, writer: &Writer) {
        let tool_call_id = tool_call_id.into();
        let (done_tx, done_rx) = oneshot::channel();

        let registry = Arc::clone(self);
        let id_for_close = tool_call_id.clone();
        let on_close_id = writer.register_on_close(move || {
            registry.update(&id_for_close, TIMEOUT);
        });

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            tool_call_id,
            Entry {
                done_tx: Some(done_tx),
                done_rx: Some(done_rx),
                on_close_id: Some(on_close_id),
                writer: writer.clone(),
            },
        );
    }

    /// Idempotent transition to done (spec §4.7 `Update`). Silently a
    /// no-op if no such request is registered, or if it already resolved.
    pub fn update(&self, tool_call_id: &str, decision: impl Into<String>) {
        let decision = decision.into();
        let to_unregister = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(tool_call_id) {
                Some(entry) => {
                    if let Some(tx) = entry.done_tx.take() {
                        let _ = tx.send(decision);
                    }
                    entry.on_close_id.take().map(|id| (entry.writer.clone(), id))
                }
                None => None,
            }
        };
        if let Some((writer, id)) = to_unregister {
            writer.unregister_on_close(id);
        }
    }

    /// Used when the SSE closes before the loop reaches `wait` (spec §4.7
    /// `Unregister`): an implicit `Update("")`.
    pub fn unregister(&self, tool_call_id: &str) {
        self.update(tool_call_id, "");
    }

    /// Waits for a decision (spec §4.7 `Wait`). No pending approval is a
    /// valid state, not an error: returns `Ok("")` immediately. Cancellation
    /// returns `Err` without touching the registry entry — it remains for
    /// the SSE's `onClose` hook to resolve as `timeout` (spec §5
    /// "Cancellation").
    pub async fn wait(
        &self,
        tool_call_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Decision, ChatError> {
        let mut rx = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(tool_call_id).and_then(|e| e.done_rx.take()) {
                Some(rx) => rx,
                None => return Ok(String::new()),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Put the receiver back: the entry is still "registered", it
                // just didn't resolve on this wait. The onClose hook (or a
                // later wait) will still observe its eventual resolution.
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = entries.get_mut(tool_call_id) {
                    entry.done_rx = Some(rx);
                }
                Err(ChatError::Approval("approval wait cancelled".to_string()))
            }
            res = &mut rx => {
                self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(tool_call_id);
                Ok(res.unwrap_or_default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_update_resolves_wait() {
        let registry = ApprovalRegistry::new();
        let writer = Writer::new(4);
        registry.register("tc1", &writer);

        registry.update("tc1", APPROVED);

        let cancel = CancellationToken::new();
        let decision = registry.wait("tc1", &cancel).await.unwrap();
        assert_eq!(decision, APPROVED);
    }

    #[tokio::test]
    async fn wait_without_register_returns_empty_immediately() {
        let registry = ApprovalRegistry::new();
        let cancel = CancellationToken::new();
        let decision = registry.wait("missing", &cancel).await.unwrap();
        assert_eq!(decision, "");
    }

    #[tokio::test]
    async fn writer_close_resolves_pending_wait_as_timeout() {
        let registry = ApprovalRegistry::new();
        let writer = Writer::new(4);
        let _lines = writer.setup().await;
        registry.register("tc1", &writer);

        writer.close().await;

        let cancel = CancellationToken::new();
        let decision = registry.wait("tc1", &cancel).await.unwrap();
        assert_eq!(decision, TIMEOUT);
    }

    #[tokio::test]
    async fn double_update_is_idempotent() {
        let registry = ApprovalRegistry::new();
        let writer = Writer::new(4);
        registry.register("tc1", &writer);

        registry.update("tc1", APPROVED);
        registry.update("tc1", DENIED); // second call must not panic or overwrite

        let cancel = CancellationToken::new();
        let decision = registry.wait("tc1", &cancel).await.unwrap();
        assert_eq!(decision, APPROVED);
    }

    #[tokio::test]
    async fn cancellation_leaves_entry_for_onclose_to_resolve() {
        let registry = ApprovalRegistry::new();
        let writer = Writer::new(4);
        let _lines = writer.setup().await;
        registry.register("tc1", &writer);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = registry.wait("tc1", &cancel).await;
        assert!(result.is_err());

        writer.close().await;
        let fresh_cancel = CancellationToken::new();
        let decision = registry.wait("tc1", &fresh_cancel).await.unwrap();
        assert_eq!(decision, TIMEOUT);
    }
}
