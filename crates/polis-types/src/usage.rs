//! Structured token accounting for worker calls.

use serde::{Deserialize, Serialize};

/// Token counts reported by a worker backend, when available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// Total tokens, computed from the parts when the backend omits it.
    pub fn total(&self) -> Option<u64> {
        self.total_tokens.or_else(|| {
            match (self.prompt_tokens, self.completion_tokens) {
                (Some(p), Some(c)) => p.checked_add(c),
                (Some(v), None) | (None, Some(v)) => Some(v),
                (None, None) => None,
            }
        })
    }

    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        fn sum(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (Some(a), Some(b)) => a.checked_add(b),
                (Some(v), None) | (None, Some(v)) => Some(v),
                (None, None) => None,
            }
        }
        self.prompt_tokens = sum(self.prompt_tokens, other.prompt_tokens);
        self.completion_tokens = sum(self.completion_tokens, other.completion_tokens);
        self.total_tokens = sum(self.total(), other.total());
    }
}
