//! Token usage and cost accounting for agent runs.
//!
//! Agent CLIs typically stream JSONL where usage numbers show up on
//! whichever lines happen to carry a `usage` object — the exact shape
//! varies between providers. [`accumulate_from_jsonl`] extracts what it can
//! recognize and ignores everything else, so a single worker run built from
//! many output lines converges on one [`TokenUsage`] total.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::types::TokenUsage;

/// Parse each line of `jsonl` as JSON and fold any usage objects found into
/// a running total. Lines that fail to parse, or parse but carry no
/// recognizable usage shape, are skipped.
#[must_use]
pub fn accumulate_from_jsonl(jsonl: &str) -> TokenUsage {
    let mut total = TokenUsage::default();
    for line in jsonl.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(usage) = extract_usage(&value) {
            total = total.add(usage);
        }
    }
    total
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage").or_else(|| value.get("message").and_then(|m| m.get("usage")))?;
    let input = first_u64(usage, &["input_tokens", "prompt_tokens"]);
    let output = first_u64(usage, &["output_tokens", "completion_tokens"]);
    let total = first_u64(usage, &["total_tokens"]);

    if input.is_none() && output.is_none() && total.is_none() {
        return None;
    }

    let input = input.unwrap_or(0);
    let output = output.unwrap_or(0);
    let total = total.unwrap_or(input + output);
    Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total,
        cost_milli_cents: None,
    })
}

fn first_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| value.get(k).and_then(Value::as_u64))
}

/// A per-model price table, in milli-cents per 1000 tokens (input, output).
pub type PricingTable = BTreeMap<String, (u64, u64)>;

/// Attach a cost estimate to `usage` for `model`, using exact-then-substring
/// matching against `table`'s keys (so `"claude-3-5-sonnet"` matches a
/// pricing entry for `"claude-3-5"`).
#[must_use]
pub fn price(usage: TokenUsage, model: &str, table: &PricingTable) -> TokenUsage {
    let rate = table.get(model).copied().or_else(|| {
        table
            .iter()
            .find(|(key, _)| model.contains(key.as_str()))
            .map(|(_, rate)| *rate)
    });

    let Some((input_rate, output_rate)) = rate else {
        return usage;
    };

    let cost = (usage.input_tokens * input_rate + usage.output_tokens * output_rate) / 1000;
    TokenUsage {
        cost_milli_cents: Some(cost),
        ..usage
    }
}
