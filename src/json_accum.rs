//! Partial-JSON accumulator (C4, spec §4.4).
//!
//! Append-only byte buffer for streamed `input_json_delta`/tool-call
//! `arguments` fragments, grounded on the teacher's `ToolCallAssembler`
//! (`src/llm/provider.rs`), generalized so finalize can be called exactly
//! once and distinguishes "empty" from "invalid" (the teacher always
//! parses at `into_tool_calls` time and never special-cased the empty
//! case).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeError {
    /// The buffer was non-empty but did not parse as JSON at all.
    Decode,
    /// The buffer parsed but the top-level value was not a JSON object.
    NotAnObject,
    /// `finalize` was called more than once on the same accumulator.
    AlreadyFinalized,
}

impl fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeError::Decode => write!(f, "partial JSON did not parse"),
            FinalizeError::NotAnObject => write!(f, "tool input must be a JSON object"),
            FinalizeError::AlreadyFinalized => write!(f, "accumulator already finalized"),
        }
    }
}

impl std::error::Error for FinalizeError {}

/// Append-only accumulator for one tool call's streamed input.
#[derive(Debug, Default)]
pub struct JsonAccumulator {
    buf: String,
    finalized: bool,
}

impl JsonAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Empty fragments are ignored (spec §8 B1).
    pub fn append(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.buf.push_str(fragment);
    }

    pub fn raw(&self) -> &str {
        &self.buf
    }

    /// Finalize: whitespace-only buffers become `{}`; otherwise the buffer
    /// must parse as a JSON object. Returns the original bytes, not a
    /// re-serialization (spec §4.4). May be called at most once.
    pub fn finalize(&mut self) -> Result<String, FinalizeError> {
        if self.finalized {
            return Err(FinalizeError::AlreadyFinalized);
        }
        self.finalized = true;

        if self.buf.trim().is_empty() {
            return Ok("{}".to_string());
        }

        match serde_json::from_str::<serde_json::Value>(&self.buf) {
            Ok(serde_json::Value::Object(_)) => Ok(self.buf.clone()),
            Ok(_) => Err(FinalizeError::NotAnObject),
            Err(_) => Err(FinalizeError::Decode),
        }
    }
}

/// Best-effort lenient repair for rendering *partial* tool input mid-flight.
/// Never used on the authoritative finalize path (spec §4.4, §9).
pub fn lenient_repair(partial: &str) -> String {
    let mut out = String::with_capacity(partial.len() + 4);
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = partial.chars().peekable();

    while let Some(c) = chars.next() {
        out.push(c);
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if in_string {
        out.push('"');
    }

    let trimmed = out.trim_end();
    let trailing_comma = trimmed.ends_with(',');
    if trailing_comma {
        out.truncate(out.trim_end().len() - 1);
    }

    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fragments_ignored() {
        let mut acc = JsonAccumulator::new();
        acc.append("");
        acc.append("{}");
        acc.append("");
        assert_eq!(acc.raw(), "{}");
    }

    #[test]
    fn whitespace_only_finalizes_to_empty_object() {
        let mut acc = JsonAccumulator::new();
        acc.append("   \n\t");
        assert_eq!(acc.finalize().unwrap(), "{}");
    }

    #[test]
    fn valid_object_round_trips_raw_bytes() {
        let mut acc = JsonAccumulator::new();
        acc.append(r#"{"q":"#);
        acc.append(r#""alpha""#);
        acc.append("}");
        let raw = acc.finalize().unwrap();
        assert_eq!(raw, r#"{"q":"alpha"}"#);
    }

    #[test]
    fn array_top_level_is_rejected() {
        let mut acc = JsonAccumulator::new();
        acc.append("[1,2,3]");
        assert_eq!(acc.finalize().unwrap_err(), FinalizeError::NotAnObject);
    }

    #[test]
    fn scalar_top_level_is_rejected() {
        let mut acc = JsonAccumulator::new();
        acc.append("42");
        assert_eq!(acc.finalize().unwrap_err(), FinalizeError::NotAnObject);
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let mut acc = JsonAccumulator::new();
        acc.append(r#"{"q":}"#);
        assert_eq!(acc.finalize().unwrap_err(), FinalizeError::Decode);
    }

    #[test]
    fn finalize_twice_errors() {
        let mut acc = JsonAccumulator::new();
        acc.append("{}");
        acc.finalize().unwrap();
        assert_eq!(acc.finalize().unwrap_err(), FinalizeError::AlreadyFinalized);
    }

    #[test]
    fn lenient_repair_closes_open_braces_and_quotes() {
        let partial = r#"{"q":"alph"#;
        let repaired = lenient_repair(partial);
        let parsed: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(parsed["q"], "alph");
    }

    #[test]
    fn lenient_repair_drops_trailing_comma() {
        let partial = r#"{"a":1,"#;
        let repaired = lenient_repair(partial);
        let parsed: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(parsed["a"], 1);
    }
}
