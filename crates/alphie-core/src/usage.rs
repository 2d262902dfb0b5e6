//! Token-usage extraction from raw runner event lines.

use serde_json::Value;

use crate::tokens::TokenUsage;

/// Usage found in one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageReport {
    pub usage: TokenUsage,
    /// `result` events report session totals rather than per-message deltas.
    pub cumulative: bool,
}

/// Pull `usage.{input_tokens,output_tokens}` from a raw event line. The
/// block may sit at the top level or under `message`.
pub fn extract_usage(raw: &str) -> Option<UsageReport> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let usage = value
        .get("usage")
        .or_else(|| value.get("message").and_then(|m| m.get("usage")))?;
    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    if input == 0 && output == 0 {
        return None;
    }
    let cumulative = value.get("type").and_then(Value::as_str) == Some("result");
    Some(UsageReport {
        usage: TokenUsage::new(input, output),
        cumulative,
    })
}

/// Rough token estimate for text that arrived without usage data.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_usage() {
        let raw = r#"{"type":"assistant","usage":{"input_tokens":10,"output_tokens":5}}"#;
        let report = extract_usage(raw).unwrap();
        assert_eq!(report.usage, TokenUsage::new(10, 5));
        assert!(!report.cumulative);
    }

    #[test]
    fn nested_usage_under_message() {
        let raw = r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":7,"output_tokens":3}}}"#;
        assert_eq!(extract_usage(raw).unwrap().usage, TokenUsage::new(7, 3));
    }

    #[test]
    fn result_usage_is_cumulative() {
        let raw = r#"{"type":"result","usage":{"input_tokens":100,"output_tokens":50}}"#;
        assert!(extract_usage(raw).unwrap().cumulative);
    }

    #[test]
    fn missing_or_zero_usage() {
        assert!(extract_usage(r#"{"type":"assistant"}"#).is_none());
        assert!(extract_usage(r#"{"usage":{"input_tokens":0,"output_tokens":0}}"#).is_none());
        assert!(extract_usage("not json").is_none());
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
