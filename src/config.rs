//! Per-call configuration (spec §6). Deliberately not sourced from a file
//! or environment — those belong to an external collaborator.

use std::collections::HashSet;

/// Which wire dialect an upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    /// Dialect-A: Anthropic-style named SSE events.
    Anthropic,
    /// Dialect-B: OpenAI-style chat-completions chunks.
    OpenAiCompatible,
}

/// Requested reasoning/thinking depth (spec §4.5, §B3/§B4 boundary rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Default max output tokens, applied when the caller supplies `<= 0`
/// (spec §8 B4).
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Minimum thinking budget Dialect-A will accept (spec §4.5).
pub const MIN_THINKING_BUDGET: u32 = 1024;

/// Default thinking budget, capped to 75% of `max_tokens` (spec §4.5).
pub const DEFAULT_THINKING_BUDGET: u32 = 8192;

#[derive(Debug, Clone)]
pub struct ChatOpts {
    pub api_type: ApiType,
    pub model: String,
    pub api_token: Option<String>,
    pub org_id: Option<String>,
    pub api_version: Option<String>,
    pub base_url: String,
    pub proxy_url: Option<String>,
    pub max_tokens: i64,
    /// 0 = no timeout.
    pub timeout_ms: u64,
    pub thinking_level: ThinkingLevel,
    pub capabilities: HashSet<String>,
    /// Bound on tool-call/result turns kept in `Chat.NativeMessages`
    /// (SPEC_FULL.md §C "Tool call loop-turn pruning"). `None` = unbounded.
    pub max_tool_turns: Option<usize>,
}

impl ChatOpts {
    /// `max_tokens`, normalized per spec §8 B4 (`<= 0` becomes the default).
    pub fn effective_max_tokens(&self) -> u32 {
        if self.max_tokens <= 0 {
            DEFAULT_MAX_TOKENS
        } else {
            self.max_tokens as u32
        }
    }

    /// Thinking budget if thinking should be enabled for this request, per
    /// spec §4.5: level must be medium/high, and 75% of max_tokens must
    /// clear the minimum budget; §8 B3 says `low` (or missing) always
    /// disables it regardless of `max_tokens`.
    pub fn thinking_budget(&self) -> Option<u32> {
        match self.thinking_level {
            ThinkingLevel::Low => None,
            ThinkingLevel::Medium | ThinkingLevel::High => {
                let cap = (self.effective_max_tokens() as f64 * 0.75) as u32;
                if cap >= MIN_THINKING_BUDGET {
                    Some(DEFAULT_THINKING_BUDGET.min(cap))
                } else {
                    None
                }
            }
        }
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }
}

impl Default for ChatOpts {
    fn default() -> Self {
        Self {
            api_type: ApiType::Anthropic,
            model: String::new(),
            api_token: None,
            org_id: None,
            api_version: None,
            base_url: String::new(),
            proxy_url: None,
            max_tokens: DEFAULT_MAX_TOKENS as i64,
            timeout_ms: 0,
            thinking_level: ThinkingLevel::Low,
            capabilities: HashSet::new(),
            max_tool_turns: Some(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_tokens_defaults_on_non_positive() {
        let mut opts = ChatOpts::default();
        opts.max_tokens = 0;
        assert_eq!(opts.effective_max_tokens(), DEFAULT_MAX_TOKENS);
        opts.max_tokens = -5;
        assert_eq!(opts.effective_max_tokens(), DEFAULT_MAX_TOKENS);
        opts.max_tokens = 100;
        assert_eq!(opts.effective_max_tokens(), 100);
    }

    #[test]
    fn thinking_disabled_when_low_regardless_of_max_tokens() {
        let mut opts = ChatOpts::default();
        opts.thinking_level = ThinkingLevel::Low;
        opts.max_tokens = 1_000_000;
        assert_eq!(opts.thinking_budget(), None);
    }

    #[test]
    fn thinking_enabled_when_budget_clears_minimum() {
        let mut opts = ChatOpts::default();
        opts.thinking_level = ThinkingLevel::High;
        opts.max_tokens = 4096;
        // 75% of 4096 = 3072 >= 1024
        assert_eq!(opts.thinking_budget(), Some(3072.min(DEFAULT_THINKING_BUDGET)));
    }

    #[test]
    fn thinking_disabled_when_budget_too_small() {
        let mut opts = ChatOpts::default();
        opts.thinking_level = ThinkingLevel::Medium;
        opts.max_tokens = 1000; // 75% = 750 < 1024
        assert_eq!(opts.thinking_budget(), None);
    }
}
