//! Dialect parsers (C2/C3, spec §4.2/§4.3, §9 "shared downstream").
//!
//! Both dialects are state machines over `map<index, BlockState>` that
//! dispatch into the small `Emitter` capability set spec §9 describes —
//! here, simply `sse::Writer`'s typed helper methods. This module holds
//! the shared `StopReason` result type; `anthropic` and `openai` hold the
//! per-dialect event dispatch.

pub mod anthropic;
pub mod openai;

use crate::error::StopKind;
use crate::model::{TokenUsage, ToolCallRequest};

/// Normalized result of running one dialect parser to completion (spec §7
/// `StopKind` table, §4.2 point 6, §4.3 point 3).
#[derive(Debug, Clone, Default)]
pub struct StopReason {
    pub kind: Option<StopKind>,
    pub model: Option<String>,
    pub message_id: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub error_type: Option<String>,
    pub error_text: Option<String>,
    pub assistant_text: Option<String>,
    pub assistant_reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl StopReason {
    pub fn kind(&self) -> StopKind {
        self.kind.unwrap_or(StopKind::Done)
    }
}
