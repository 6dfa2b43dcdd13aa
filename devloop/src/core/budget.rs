//! Conversation token budget tracking for context handoffs.
//!
//! The monitor never compacts a conversation. When the remaining budget drops
//! under the threshold the engine commits work in progress, asks for a
//! continuation summary, resets the session, and reseeds the task.

use serde::{Deserialize, Serialize};

use crate::core::types::TokenUsage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfiguration {
    /// Size of the agent's conversation window in tokens.
    pub window_tokens: u64,
    /// Hand off once the remaining budget falls under this percentage.
    pub low_budget_percent: f64,
}

impl Default for BudgetConfiguration {
    fn default() -> Self {
        Self {
            window_tokens: 200_000,
            low_budget_percent: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBudgetMonitor {
    config: BudgetConfiguration,
    /// Window occupancy reported by the most recent message carrying usage.
    latest_context_tokens: u64,
    /// Sum of all usage since the session started.
    cumulative: TokenUsage,
}

impl ContextBudgetMonitor {
    pub fn new(config: BudgetConfiguration) -> Self {
        Self {
            config,
            latest_context_tokens: 0,
            cumulative: TokenUsage::default(),
        }
    }

    /// Record usage reported mid-stream or on call completion.
    pub fn record(&mut self, usage: &TokenUsage) {
        self.latest_context_tokens = usage.context_tokens();
        self.cumulative.input_tokens += usage.input_tokens;
        self.cumulative.output_tokens += usage.output_tokens;
        self.cumulative.cache_read_input_tokens += usage.cache_read_input_tokens;
        self.cumulative.cache_creation_input_tokens += usage.cache_creation_input_tokens;
    }

    pub fn used_tokens(&self) -> u64 {
        self.latest_context_tokens
    }

    pub fn cumulative(&self) -> TokenUsage {
        self.cumulative
    }

    pub fn remaining_percent(&self) -> f64 {
        if self.config.window_tokens == 0 {
            return 0.0;
        }
        let remaining = self
            .config
            .window_tokens
            .saturating_sub(self.latest_context_tokens);
        remaining as f64 * 100.0 / self.config.window_tokens as f64
    }

    pub fn needs_handoff(&self) -> bool {
        self.remaining_percent() < self.config.low_budget_percent
    }

    /// Forget usage after the session id is discarded.
    pub fn reset(&mut self) {
        self.latest_context_tokens = 0;
        self.cumulative = TokenUsage::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            ..TokenUsage::default()
        }
    }

    fn monitor() -> ContextBudgetMonitor {
        ContextBudgetMonitor::new(BudgetConfiguration {
            window_tokens: 1_000,
            low_budget_percent: 25.0,
        })
    }

    #[test]
    fn fresh_monitor_has_full_budget() {
        let m = monitor();
        assert_eq!(m.remaining_percent(), 100.0);
        assert!(!m.needs_handoff());
    }

    #[test]
    fn latest_usage_drives_remaining_percent() {
        let mut m = monitor();
        m.record(&usage(300, 100));
        assert_eq!(m.remaining_percent(), 60.0);
        m.record(&usage(700, 100));
        assert_eq!(m.remaining_percent(), 20.0);
        assert!(m.needs_handoff());
        assert_eq!(m.cumulative().input_tokens, 1_000);
    }

    #[test]
    fn overflow_saturates_at_zero() {
        let mut m = monitor();
        m.record(&usage(5_000, 0));
        assert_eq!(m.remaining_percent(), 0.0);
    }

    #[test]
    fn reset_restores_budget() {
        let mut m = monitor();
        m.record(&usage(900, 0));
        m.reset();
        assert!(!m.needs_handoff());
        assert_eq!(m.cumulative(), TokenUsage::default());
    }
}
