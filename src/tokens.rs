//! Token accounting for working memory
//!
//! Counts are estimates, deterministic per model profile: ASCII text is
//! charged by the provider's characters-per-token ratio, every other
//! character as a full token. Each message carries a fixed framing overhead
//! (role markers), so appending a message can never lower the total.

use crate::error::{MemoryError, Result};
use crate::models::{ModelProfile, ModelProvider};
use crate::types::{Message, Role};

/// Tokens spent on role/separator framing per message
const MESSAGE_OVERHEAD: usize = 4;
/// Tokens spent priming the reply once any content is present
const REPLY_PRIMING: usize = 3;

#[derive(Debug, Clone)]
pub struct TokenAccountant {
    profile: ModelProfile,
    ascii_chars_per_token: f64,
}

impl TokenAccountant {
    pub fn new(profile: ModelProfile) -> Self {
        let ascii_chars_per_token = match profile.provider {
            ModelProvider::OpenAi => 4.0,
            ModelProvider::Anthropic => 3.5,
        };
        Self {
            profile,
            ascii_chars_per_token,
        }
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    /// Estimated tokens for a bare piece of text
    pub fn count_text(&self, text: &str) -> usize {
        let (ascii, other) = text.chars().fold((0usize, 0usize), |(a, o), c| {
            if c.is_ascii() {
                (a + 1, o)
            } else {
                (a, o + 1)
            }
        });
        (ascii as f64 / self.ascii_chars_per_token).ceil() as usize + other
    }

    pub fn count_message(&self, role: Role, content: &str) -> usize {
        MESSAGE_OVERHEAD + self.count_text(role.as_str()) + self.count_text(content)
    }

    /// Cost of a context plus message sequence
    pub fn count(&self, messages: &[Message], context: Option<&str>) -> Result<usize> {
        let mut total = 0;
        for message in messages {
            if message.content.is_empty() {
                return Err(MemoryError::Validation(format!(
                    "message {} has empty content",
                    message.id
                )));
            }
            total += self.count_message(message.role, &message.content);
        }
        if let Some(context) = context.filter(|c| !c.is_empty()) {
            total += MESSAGE_OVERHEAD + self.count_text(context);
        }
        if total > 0 {
            total += REPLY_PRIMING;
        }
        Ok(total)
    }

    /// Largest single-message cost that keeps a lone message within `budget`
    pub fn message_allowance(&self, budget: usize) -> usize {
        budget.saturating_sub(REPLY_PRIMING)
    }

    /// Longest prefix of `content` whose message cost fits in `max_tokens`
    pub fn truncate_to_fit(&self, role: Role, content: &str, max_tokens: usize) -> String {
        if self.count_message(role, content) <= max_tokens {
            return content.to_string();
        }

        let boundaries: Vec<usize> = content
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(content.len()))
            .collect();

        // Binary search over char boundaries; cost is monotonic in prefix length.
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.count_message(role, &content[..boundaries[mid]]) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        content[..boundaries[lo]].to_string()
    }
}
