use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use conclave_core::config::WindowConfig;
use conclave_core::types::ChatMessage;

/// Get or initialize the cl100k_base tokenizer (works for Claude and GPT-4).
fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer")
    })
}

/// Accurate token count using BPE tokenization.
pub fn estimate_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

/// Token estimate for a message, with a small per-message overhead.
pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    estimate_tokens(&msg.text) + 4
}

/// Result of windowing: what the worker sees, and what fell off the
/// front (oldest first) for optional compaction.
#[derive(Debug)]
pub struct WindowedHistory {
    pub kept: Vec<ChatMessage>,
    pub dropped: Vec<ChatMessage>,
}

/// Trims conversation history to an agent's budget. Always keeps the
/// most recent messages, drops the oldest first, and never drops
/// synthetic summary turns.
pub struct HistoryWindower {
    config: WindowConfig,
}

impl HistoryWindower {
    pub fn new(config: WindowConfig) -> Self {
        Self { config }
    }

    pub fn window(&self, history: &[ChatMessage]) -> WindowedHistory {
        match self.config {
            WindowConfig::FixedCount { max_messages } => self.by_count(history, max_messages),
            WindowConfig::TokenBudget { max_tokens } => self.by_tokens(history, max_tokens),
        }
    }

    fn by_count(&self, history: &[ChatMessage], max_messages: usize) -> WindowedHistory {
        if history.len() <= max_messages {
            return WindowedHistory {
                kept: history.to_vec(),
                dropped: vec![],
            };
        }
        self.split_keeping_tail(history, history.len() - max_messages)
    }

    fn by_tokens(&self, history: &[ChatMessage], max_tokens: usize) -> WindowedHistory {
        let mut budget = max_tokens as i64;
        // Synthetic summaries are always kept; charge them up front.
        for msg in history.iter().filter(|m| m.synthetic) {
            budget -= estimate_message_tokens(msg) as i64;
        }

        // Walk backwards from the newest message, keeping what fits. The
        // newest non-synthetic message is kept even when it alone
        // overflows the budget: a window that drops everything would
        // leave the worker blind to the current turn.
        let newest = history.iter().rposition(|m| !m.synthetic);
        let mut cut = history.len();
        for (idx, msg) in history.iter().enumerate().rev() {
            if msg.synthetic {
                continue;
            }
            let cost = estimate_message_tokens(msg) as i64;
            if budget - cost < 0 && Some(idx) != newest {
                break;
            }
            budget -= cost;
            cut = idx;
        }

        self.split_keeping_tail(history, cut)
    }

    /// Split at `cut`: messages before it are dropped unless synthetic.
    fn split_keeping_tail(&self, history: &[ChatMessage], cut: usize) -> WindowedHistory {
        let mut kept = Vec::with_capacity(history.len());
        let mut dropped = Vec::new();
        for (idx, msg) in history.iter().enumerate() {
            if idx >= cut || msg.synthetic {
                kept.push(msg.clone());
            } else {
                dropped.push(msg.clone());
            }
        }
        WindowedHistory { kept, dropped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| ChatMessage::user(format!("message number {}", i)))
            .collect()
    }

    #[test]
    fn token_estimates_are_nonzero_for_text() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("hello world") >= 2);
        assert!(estimate_message_tokens(&ChatMessage::user("hi")) > 4);
    }

    #[test]
    fn fixed_count_keeps_newest() {
        let history = msgs(10);
        let windower = HistoryWindower::new(WindowConfig::FixedCount { max_messages: 3 });
        let result = windower.window(&history);

        assert_eq!(result.kept.len(), 3);
        assert_eq!(result.dropped.len(), 7);
        assert_eq!(result.kept[0].text, "message number 7");
        assert_eq!(result.dropped[0].text, "message number 0");
    }

    #[test]
    fn fixed_count_no_trim_when_under_limit() {
        let history = msgs(2);
        let windower = HistoryWindower::new(WindowConfig::FixedCount { max_messages: 5 });
        let result = windower.window(&history);
        assert_eq!(result.kept.len(), 2);
        assert!(result.dropped.is_empty());
    }

    #[test]
    fn token_budget_drops_oldest_first() {
        let history = msgs(20);
        let per_msg = estimate_message_tokens(&history[0]);
        let windower = HistoryWindower::new(WindowConfig::TokenBudget {
            max_tokens: per_msg * 5,
        });
        let result = windower.window(&history);

        assert!(result.kept.len() <= 5);
        assert!(!result.kept.is_empty());
        // The newest message always survives.
        assert_eq!(result.kept.last().unwrap().text, "message number 19");
        // Dropped prefix is in original (oldest-first) order.
        assert_eq!(result.dropped[0].text, "message number 0");
    }

    #[test]
    fn token_budget_never_drops_the_newest_message() {
        let history = msgs(2);
        let windower = HistoryWindower::new(WindowConfig::TokenBudget { max_tokens: 1 });
        let result = windower.window(&history);

        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.kept[0].text, "message number 1");
        assert_eq!(result.dropped.len(), 1);

        // A synthetic summary eating the whole budget does not evict the
        // newest message either.
        let mut history = vec![ChatMessage::summary("earlier context, at length")];
        history.push(ChatMessage::user("latest question"));
        let result = windower.window(&history);
        assert_eq!(result.kept.len(), 2);
        assert_eq!(result.kept[1].text, "latest question");
    }

    #[test]
    fn synthetic_summary_survives_both_strategies() {
        let mut history = vec![ChatMessage::summary("earlier: a and b agreed")];
        history.extend(msgs(10));

        let by_count = HistoryWindower::new(WindowConfig::FixedCount { max_messages: 2 });
        let result = by_count.window(&history);
        assert!(result.kept.iter().any(|m| m.synthetic));
        assert!(!result.dropped.iter().any(|m| m.synthetic));

        let by_tokens = HistoryWindower::new(WindowConfig::TokenBudget { max_tokens: 40 });
        let result = by_tokens.window(&history);
        assert!(result.kept.iter().any(|m| m.synthetic));
    }
}
