//! Fits conversation history into a model's context window.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{AssembledRequest, ContextBudget, Message};

use super::TokenCodec;

/// The system prompt and reply priming alone do not fit the budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Request overhead (system prompt and reply priming) needs {required} tokens but only {available} are available")]
pub struct ContextOverflowError {
    pub required: usize,
    pub available: usize,
}

/// Builds trimmed request payloads from conversation history.
///
/// The system prompt is always included. History is taken newest-first and
/// stops at the first message that does not fit, so the result is always a
/// contiguous suffix of the history. Messages are never truncated.
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    codec: TokenCodec,
}

impl ContextAssembler {
    pub fn new(codec: TokenCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn build(
        &self,
        history: &[Message],
        system_prompt: Option<&str>,
        budget: ContextBudget,
    ) -> Result<AssembledRequest, ContextOverflowError> {
        let available = budget.available();

        let prompt_tokens = system_prompt
            .map(|p| self.codec.count_system_prompt(p))
            .unwrap_or(0);
        let reserved = prompt_tokens + self.codec.reply_priming();
        if reserved > available {
            return Err(ContextOverflowError {
                required: reserved,
                available,
            });
        }

        let mut total = reserved;
        let mut kept = 0usize;
        for message in history.iter().rev() {
            let cost = message.token_count(&self.codec);
            if total + cost > available {
                if kept == 0 {
                    warn!(
                        tokens = cost,
                        remaining = available - total,
                        "Newest message does not fit the context window, sending without history"
                    );
                }
                break;
            }
            total += cost;
            kept += 1;
        }

        let start = history.len() - kept;
        let dropped = start;
        if dropped > 0 {
            info!(
                dropped,
                kept,
                total_tokens = total,
                available,
                "Trimmed conversation history to fit context window"
            );
        } else {
            debug!(kept, total_tokens = total, available, "Assembled request");
        }

        Ok(AssembledRequest {
            system_prompt: system_prompt.map(str::to_string),
            messages: history[start..].to_vec(),
            total_token_count: total,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Framing;
    use crate::models::{Attachment, Role};

    fn bare_assembler() -> ContextAssembler {
        ContextAssembler::new(TokenCodec::approximate().with_framing(Framing::none()))
    }

    /// A message that costs exactly `tokens` under the bare approximate codec.
    fn sized(role: Role, tag: char, tokens: usize) -> Message {
        Message::new(role, tag.to_string().repeat(tokens * 3))
    }

    fn history(sizes: &[usize]) -> Vec<Message> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &tokens)| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                sized(role, (b'a' + (i % 26) as u8) as char, tokens)
            })
            .collect()
    }

    #[test]
    fn test_drops_oldest_first() {
        let assembler = bare_assembler();
        let history = history(&[180, 180, 180, 180, 180]);
        let prompt = "p".repeat(150);

        let request = assembler
            .build(&history, Some(prompt.as_str()), ContextBudget::new(1000, 100))
            .unwrap();

        assert_eq!(request.messages(), &history[1..]);
        assert_eq!(request.dropped(), 1);
        assert_eq!(request.total_token_count(), 50 + 4 * 180);
        assert_eq!(request.system_prompt(), Some(prompt.as_str()));
    }

    #[test]
    fn test_everything_fits() {
        let assembler = bare_assembler();
        let history = history(&[10, 20, 30]);
        let request = assembler
            .build(&history, None, ContextBudget::new(100, 0))
            .unwrap();
        assert_eq!(request.messages(), &history[..]);
        assert_eq!(request.dropped(), 0);
        assert_eq!(request.total_token_count(), 60);
        assert!(request.system_prompt().is_none());
    }

    #[test]
    fn test_framing_counts_towards_budget() {
        let assembler = ContextAssembler::new(TokenCodec::approximate());
        let history = history(&[10, 10]);
        // Each message costs 14, priming 3; prompt "abc" costs 1 + 4
        let request = assembler
            .build(&history, Some("abc"), ContextBudget::new(25, 0))
            .unwrap();
        assert_eq!(request.messages().len(), 1);
        assert_eq!(request.total_token_count(), 3 + 5 + 14);
    }

    #[test]
    fn test_system_prompt_overflow() {
        let assembler = bare_assembler();
        let prompt = "p".repeat(300);
        let err = assembler
            .build(&[], Some(prompt.as_str()), ContextBudget::new(150, 60))
            .unwrap_err();
        assert_eq!(
            err,
            ContextOverflowError {
                required: 100,
                available: 90
            }
        );
    }

    #[test]
    fn test_system_prompt_exactly_fills_budget() {
        let assembler = bare_assembler();
        let history = history(&[1]);
        let prompt = "p".repeat(270);
        let request = assembler
            .build(&history, Some(prompt.as_str()), ContextBudget::new(100, 10))
            .unwrap();
        assert!(request.messages().is_empty());
        assert_eq!(request.total_token_count(), 90);
    }

    #[test]
    fn test_oversized_single_message_is_dropped() {
        let assembler = bare_assembler();
        let history = history(&[500]);
        let request = assembler
            .build(&history, Some("system"), ContextBudget::new(200, 0))
            .unwrap();
        assert!(request.messages().is_empty());
        assert_eq!(request.dropped(), 1);
        assert_eq!(request.total_token_count(), 2);
    }

    #[test]
    fn test_oversized_newest_message_drops_all_history() {
        let assembler = bare_assembler();
        let history = history(&[10, 10, 500]);
        let request = assembler
            .build(&history, None, ContextBudget::new(100, 0))
            .unwrap();
        // No gaps: the small older messages are not pulled in past the big one
        assert!(request.messages().is_empty());
        assert_eq!(request.dropped(), 3);
        assert!(request.is_newest_dropped());
    }

    #[test]
    fn test_newest_kept_is_not_reported_dropped() {
        let assembler = bare_assembler();
        let request = assembler
            .build(&history(&[500, 10]), None, ContextBudget::new(100, 0))
            .unwrap();
        assert_eq!(request.messages().len(), 1);
        assert!(!request.is_newest_dropped());

        let empty = assembler.build(&[], None, ContextBudget::new(100, 0)).unwrap();
        assert!(!empty.is_newest_dropped());
    }

    #[test]
    fn test_reply_priming_overflow_without_system_prompt() {
        // Default framing reserves 3 tokens of reply priming
        let assembler = ContextAssembler::new(TokenCodec::approximate());
        let err = assembler
            .build(&[], None, ContextBudget::new(2, 0))
            .unwrap_err();
        assert_eq!(
            err,
            ContextOverflowError {
                required: 3,
                available: 2
            }
        );
        assert!(err.to_string().contains("reply priming"));
    }

    #[test]
    fn test_empty_history() {
        let assembler = bare_assembler();
        let request = assembler
            .build(&[], Some("hello"), ContextBudget::default())
            .unwrap();
        assert!(request.messages().is_empty());
        assert_eq!(request.dropped(), 0);
        assert_eq!(request.total_token_count(), 2);
    }

    #[test]
    fn test_images_use_surcharge() {
        let assembler = bare_assembler();
        let with_image = Message::user("look").with_attachment(Attachment::image(
            "big.png",
            "image/png",
            "A".repeat(100_000),
        ));
        let history = vec![Message::user("older"), with_image.clone()];
        let request = assembler
            .build(&history, None, ContextBudget::new(300, 0))
            .unwrap();
        assert_eq!(request.messages().len(), 2);
        assert_eq!(request.messages()[1], with_image);
    }

    #[test]
    fn test_invariants_hold_across_budgets() {
        let assembler = ContextAssembler::new(TokenCodec::approximate());
        let sizes = [7, 130, 2, 45, 300, 12, 88, 1, 64, 19];
        let history = history(&sizes);

        for limit in (0..1200).step_by(7) {
            for reserved in [0, 10, 100, 500] {
                let budget = ContextBudget::new(limit, reserved);
                let request = match assembler.build(&history, Some("be brief"), budget) {
                    Ok(request) => request,
                    Err(err) => {
                        assert!(err.required > budget.available());
                        continue;
                    }
                };

                assert!(request.total_token_count() <= budget.available());

                // Contiguous suffix, byte-identical to the source
                let kept = request.messages().len();
                assert_eq!(request.dropped() + kept, history.len());
                assert_eq!(request.messages(), &history[history.len() - kept..]);

                // Deterministic
                let again = assembler.build(&history, Some("be brief"), budget).unwrap();
                assert_eq!(again, request);
            }
        }
    }
}
