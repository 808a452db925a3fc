//! The policy question under analysis.

use crate::context::JurisdictionContext;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Which analysis pipeline a trace belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Research,
    Analysis,
    Evolution,
    Integrated,
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::Research => write!(f, "research"),
            PolicyType::Analysis => write!(f, "analysis"),
            PolicyType::Evolution => write!(f, "evolution"),
            PolicyType::Integrated => write!(f, "integrated"),
        }
    }
}

impl std::str::FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "research" => Ok(PolicyType::Research),
            "analysis" => Ok(PolicyType::Analysis),
            "evolution" => Ok(PolicyType::Evolution),
            "integrated" => Ok(PolicyType::Integrated),
            other => Err(format!("unknown policy type: {}", other)),
        }
    }
}

/// An immutable natural-language policy question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyQuery {
    text: String,
}

impl PolicyQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Deterministic fingerprint of the normalized query plus the
    /// jurisdiction context it was asked against.
    ///
    /// Two runs over the same question and context share a fingerprint
    /// regardless of casing or whitespace in the raw query.
    pub fn fingerprint(&self, context: &JurisdictionContext) -> String {
        let normalized = normalize(&self.text);
        let context_json =
            serde_json::to_string(context).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(context_json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for PolicyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
