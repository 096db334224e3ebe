//! Token budgets and the assembled request payload.

use serde::{Deserialize, Serialize};

use crate::api::ModelLimits;

use super::Message;

/// Default context window when no per-model limits are known.
pub const DEFAULT_MODEL_LIMIT: usize = 8_192;

/// Tokens held back for the reply when no per-model limits are known.
pub const DEFAULT_RESERVED_FOR_RESPONSE: usize = 1_024;

/// Token budget for one request against one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub model_limit: usize,
    pub reserved_for_response: usize,
}

impl ContextBudget {
    pub fn new(model_limit: usize, reserved_for_response: usize) -> Self {
        Self {
            model_limit,
            reserved_for_response,
        }
    }

    /// Budget from limits reported by the models endpoint.
    ///
    /// `max_prompt_tokens` already excludes output tokens, so nothing extra
    /// is reserved.
    pub fn from_limits(limits: &ModelLimits) -> Self {
        Self::new(limits.max_prompt_tokens, 0)
    }

    /// Tokens the prompt may use: `model_limit - reserved_for_response`.
    pub fn available(&self) -> usize {
        self.model_limit.saturating_sub(self.reserved_for_response)
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_LIMIT, DEFAULT_RESERVED_FOR_RESPONSE)
    }
}

/// The trimmed payload for one send. Produced fresh by the assembler and
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledRequest {
    pub(crate) system_prompt: Option<String>,
    pub(crate) messages: Vec<Message>,
    pub(crate) total_token_count: usize,
    pub(crate) dropped: usize,
}

impl AssembledRequest {
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Included history, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Total token cost of the system prompt, messages, and request framing.
    pub fn total_token_count(&self) -> usize {
        self.total_token_count
    }

    /// Number of older history messages left out.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// The newest history message did not fit on its own, so no history
    /// is included at all.
    pub fn is_newest_dropped(&self) -> bool {
        self.messages.is_empty() && self.dropped > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_saturates() {
        assert_eq!(ContextBudget::new(1000, 100).available(), 900);
        assert_eq!(ContextBudget::new(100, 1000).available(), 0);
        assert_eq!(ContextBudget::default().available(), 7_168);
    }

    #[test]
    fn test_from_limits_uses_prompt_tokens() {
        let limits = ModelLimits {
            max_context_window_tokens: 128_000,
            max_prompt_tokens: 64_000,
            max_output_tokens: 4_096,
        };
        let budget = ContextBudget::from_limits(&limits);
        assert_eq!(budget.model_limit, 64_000);
        assert_eq!(budget.available(), 64_000);
    }
}
