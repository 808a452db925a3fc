//! Structured hand-off to the external report renderer.

use polis_types::{ComparisonRecord, ContextBundle, PolicyQuery, Proposal, ProposalId};
use serde::{Deserialize, Serialize};

/// One line of the final ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub rank: u32,
    pub id: ProposalId,
    pub title: String,
    pub elo: f64,
    pub generation: u32,
    pub superseded: bool,
}

/// Everything the external renderer needs; formatting is its problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportHandoff {
    pub top_proposals: Vec<Proposal>,
    pub rankings: Vec<RankingEntry>,
    pub comparison_records: Vec<ComparisonRecord>,
    pub context_bundle: ContextBundle,
    /// Executive-summary request assembled from the top proposals; the
    /// renderer's input, not a rendered report.
    pub summary_request: String,
    /// Worker-synthesized overview of the leaders, when the synthesis
    /// call succeeded.
    pub executive_summary: Option<String>,
    /// Set when generation flagged a localization deficit: the renderer
    /// is asked to name the jurisdiction explicitly.
    pub localization_directive: Option<String>,
    pub converged: bool,
    /// True when the run terminated early; the ranking covers whatever
    /// completed.
    pub partial: bool,
    /// One-line failure reason on fatal termination.
    pub failure: Option<String>,
}

impl ReportHandoff {
    /// Build ranking entries from an already-sorted proposal list.
    pub fn rankings_from(sorted: &[Proposal]) -> Vec<RankingEntry> {
        sorted
            .iter()
            .enumerate()
            .map(|(i, p)| RankingEntry {
                rank: (i + 1) as u32,
                id: p.id.clone(),
                title: p.title.clone(),
                elo: p.elo,
                generation: p.generation,
                superseded: p.superseded,
            })
            .collect()
    }
}

/// Assemble the executive-summary request the renderer (or a synthesis
/// worker) answers.
pub fn summary_request(query: &PolicyQuery, top: &[Proposal]) -> String {
    let mut lines = vec![format!(
        "Summarize the strongest policy options for \"{}\" into a concise executive overview.",
        query.text()
    )];
    for (i, proposal) in top.iter().enumerate() {
        lines.push(format!(
            "{}. {} (rating {:.1})",
            i + 1,
            proposal.title,
            proposal.elo
        ));
        lines.push(format!("   {}", proposal.description));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use polis_types::INITIAL_ELO;

    fn proposal(title: &str, elo: f64) -> Proposal {
        Proposal {
            id: ProposalId::new("prop-0001"),
            title: title.to_string(),
            description: format!("{} description", title),
            rationale: "why".to_string(),
            implementation_notes: String::new(),
            generation: 0,
            parent_id: None,
            elo,
            created_at: Utc::now(),
            superseded: false,
            stakeholder_impacts: Default::default(),
        }
    }

    #[test]
    fn summary_request_names_query_and_leaders() {
        let query = PolicyQuery::new("Ban on single-use plastic bags");
        let top = vec![
            proposal("Bag Fee Ordinance", 1240.5),
            proposal("Outreach Campaign", INITIAL_ELO),
        ];

        let request = summary_request(&query, &top);
        assert!(request.contains("Ban on single-use plastic bags"));
        assert!(request.contains("1. Bag Fee Ordinance (rating 1240.5)"));
        assert!(request.contains("2. Outreach Campaign (rating 1200.0)"));
        assert!(request.contains("Bag Fee Ordinance description"));
    }
}
