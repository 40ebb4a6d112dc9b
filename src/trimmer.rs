//! Context trimmer (spec.md §4.8): fits a message list into a token
//! budget by evicting the oldest non-pinned messages first. The system
//! message(s) and the final user message are always pinned.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, Role, ToolSchema};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimConfig {
    pub max_input_tokens: u64,
    /// Tokens reserved for the model's output. If `None`, a predicted
    /// output reserve is used instead (spec.md §4.8).
    pub reserve_for_output: Option<u64>,
    pub predicted_output_reserve: u64,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: 128_000,
            reserve_for_output: None,
            predicted_output_reserve: 1_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrimResult {
    pub messages: Vec<ChatMessage>,
    pub evicted_count: usize,
    pub evicted_tokens: u64,
}

/// Trim `messages` to fit the configured input budget, given `tool_tokens`
/// already spent on tool-schema overhead (subtracted from the budget
/// first) and an `estimate` function for message text.
pub fn trim(
    messages: &[ChatMessage],
    tools: &[ToolSchema],
    config: &TrimConfig,
    estimate: impl Fn(&str) -> u64,
) -> TrimResult {
    let reserve = config.reserve_for_output.unwrap_or(config.predicted_output_reserve);
    let tool_tokens: u64 = tools
        .iter()
        .map(|t| {
            // Invalid/empty schemas still cost something to serialize; we
            // tolerate them rather than erroring, per spec.md §4.8.
            let mut text = t.name.clone();
            if let Some(d) = &t.description {
                text.push_str(d);
            }
            estimate(&text)
        })
        .sum();

    let budget = config.max_input_tokens.saturating_sub(reserve).saturating_sub(tool_tokens);

    let token_costs: Vec<u64> = messages.iter().map(|m| estimate(&m.text())).collect();
    let total: u64 = token_costs.iter().sum();
    if total <= budget {
        return TrimResult {
            messages: messages.to_vec(),
            evicted_count: 0,
            evicted_tokens: 0,
        };
    }

    let last_user_idx = messages.iter().rposition(|m| m.role == Role::User);
    let is_pinned = |i: usize| -> bool {
        messages[i].role == Role::System || Some(i) == last_user_idx
    };

    let mut kept_indices: Vec<usize> = (0..messages.len()).collect();
    let mut running_total = total;
    let mut evicted_count = 0;
    let mut evicted_tokens = 0;

    while running_total > budget {
        let evict_at = kept_indices
            .iter()
            .position(|&i| !is_pinned(i));
        match evict_at {
            Some(pos) => {
                let idx = kept_indices.remove(pos);
                running_total = running_total.saturating_sub(token_costs[idx]);
                evicted_count += 1;
                evicted_tokens += token_costs[idx];
            }
            None => break, // only pinned messages remain; can't trim further
        }
    }

    TrimResult {
        messages: kept_indices.into_iter().map(|i| messages[i].clone()).collect(),
        evicted_count,
        evicted_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_len(text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }

    #[test]
    fn no_trim_when_under_budget() {
        let messages = vec![ChatMessage::system("be terse"), ChatMessage::user("hi")];
        let config = TrimConfig {
            max_input_tokens: 1000,
            ..TrimConfig::default()
        };
        let result = trim(&messages, &[], &config, token_len);
        assert_eq!(result.evicted_count, 0);
        assert_eq!(result.messages.len(), 2);
    }

    #[test]
    fn evicts_oldest_non_pinned_first() {
        let messages = vec![
            ChatMessage::system("system prompt here"),
            ChatMessage::user("turn one message body padded out"),
            ChatMessage::assistant("turn one reply padded out further"),
            ChatMessage::user("final user turn"),
        ];
        let config = TrimConfig {
            max_input_tokens: 12,
            reserve_for_output: Some(0),
            ..TrimConfig::default()
        };
        let result = trim(&messages, &[], &config, token_len);
        assert!(result.evicted_count > 0);
        // system and last-user message must always survive
        assert!(result.messages.iter().any(|m| m.role == Role::System));
        assert_eq!(result.messages.last().unwrap().text(), "final user turn");
    }

    #[test]
    fn tool_schema_overhead_is_subtracted_first() {
        let messages = vec![ChatMessage::user("hello")];
        let tools = vec![ToolSchema {
            name: "search".to_string(),
            description: Some("a fairly verbose tool description".to_string()),
            parameters: None,
        }];
        let config = TrimConfig {
            max_input_tokens: 3,
            reserve_for_output: Some(0),
            ..TrimConfig::default()
        };
        let result = trim(&messages, &tools, &config, token_len);
        // last user message is always pinned, even if the budget is blown
        assert_eq!(result.messages.len(), 1);
    }
}
