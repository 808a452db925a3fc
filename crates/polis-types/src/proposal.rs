//! Policy proposals and the pairwise comparison records that rank them.

use crate::ids::ProposalId;
use crate::usage::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Starting Elo rating for a freshly generated proposal.
pub const INITIAL_ELO: f64 = 1200.0;

/// A candidate policy recommendation.
///
/// Proposals are created by the generator or the evolver and are never
/// deleted within a run; only the rating and the `superseded` flag change
/// after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub title: String,
    pub description: String,
    pub rationale: String,
    #[serde(default)]
    pub implementation_notes: String,
    /// How many evolution steps produced this proposal (0 = original).
    pub generation: u32,
    /// The proposal this one was evolved from, if any.
    pub parent_id: Option<ProposalId>,
    pub elo: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub superseded: bool,
    /// Per-stakeholder-group impact notes, when the worker supplied them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stakeholder_impacts: BTreeMap<String, String>,
}

impl Proposal {
    /// Normalized title used for verdict matching: lowercased with
    /// whitespace collapsed.
    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }

    /// Case-insensitive check for a mention of the jurisdiction name
    /// anywhere in the proposal text.
    pub fn mentions(&self, jurisdiction: &str) -> bool {
        let needle = jurisdiction.to_lowercase();
        if needle.is_empty() {
            return false;
        }
        [&self.title, &self.description, &self.rationale, &self.implementation_notes]
            .iter()
            .any(|text| text.to_lowercase().contains(&needle))
    }
}

/// Lowercase and collapse whitespace for tolerant title matching.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonicalize an unordered pair so that the smaller ID comes first.
pub fn canonical_pair(a: ProposalId, b: ProposalId) -> (ProposalId, ProposalId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// How a single comparison resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComparisonOutcome {
    /// A winner was identified; ratings were updated.
    Decisive {
        winner: ProposalId,
        loser: ProposalId,
    },
    /// The verdict could not be matched to either proposal; ratings
    /// unchanged.
    Inconclusive,
}

impl ComparisonOutcome {
    pub fn is_decisive(&self) -> bool {
        matches!(self, ComparisonOutcome::Decisive { .. })
    }
}

/// Attribution for the worker call that produced a verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMeta {
    pub model: String,
    pub response_id: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Append-only record of one pairwise comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    pub round: u32,
    /// Canonical pair: the lexicographically smaller ID first.
    pub pair: (ProposalId, ProposalId),
    pub outcome: ComparisonOutcome,
    pub rationale: String,
    pub worker: WorkerMeta,
    /// True for the second, position-swapped evaluation of a pair in
    /// double-blind mode.
    #[serde(default)]
    pub position_swapped: bool,
    pub created_at: DateTime<Utc>,
}

impl ComparisonRecord {
    /// The winner, if the comparison was decisive.
    pub fn winner(&self) -> Option<&ProposalId> {
        match &self.outcome {
            ComparisonOutcome::Decisive { winner, .. } => Some(winner),
            ComparisonOutcome::Inconclusive => None,
        }
    }
}
