//! In-memory proposal store.
//!
//! The repository is the sole mutator of proposal state and the sole
//! owner of comparison records. All cross-component references use IDs.
//! Proposals are never deleted within a run; evolution marks parents
//! superseded but leaves them rankable and comparable.

use crate::elo;
use crate::error::RepositoryError;
use chrono::Utc;
use parking_lot::Mutex;
use polis_types::{ComparisonRecord, Proposal, ProposalId, INITIAL_ELO};
use std::collections::{BTreeMap, HashSet};

/// Field set for a proposal about to enter the repository.
#[derive(Debug, Clone)]
pub struct DraftProposal {
    pub title: String,
    pub description: String,
    pub rationale: String,
    pub implementation_notes: String,
    pub stakeholder_impacts: std::collections::BTreeMap<String, String>,
}

struct RepoState {
    proposals: BTreeMap<ProposalId, Proposal>,
    comparisons: Vec<ComparisonRecord>,
    compared_pairs: HashSet<(ProposalId, ProposalId)>,
    next_seq: u64,
}

pub struct ProposalRepository {
    state: Mutex<RepoState>,
    k_factor: f64,
}

impl ProposalRepository {
    pub fn new(k_factor: f64) -> Self {
        Self {
            state: Mutex::new(RepoState {
                proposals: BTreeMap::new(),
                comparisons: Vec::new(),
                compared_pairs: HashSet::new(),
                next_seq: 0,
            }),
            k_factor,
        }
    }

    /// Add a generation-0 proposal. IDs are minted sequentially so a
    /// rerun with identical inputs yields an identical ID sequence.
    pub fn add_root(&self, draft: DraftProposal) -> ProposalId {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let id = ProposalId::minted(state.next_seq);
        let proposal = Proposal {
            id: id.clone(),
            title: draft.title,
            description: draft.description,
            rationale: draft.rationale,
            implementation_notes: draft.implementation_notes,
            generation: 0,
            parent_id: None,
            elo: INITIAL_ELO,
            created_at: Utc::now(),
            superseded: false,
            stakeholder_impacts: draft.stakeholder_impacts,
        };
        state.proposals.insert(id.clone(), proposal);
        id
    }

    /// Add an evolved child. The parent must exist; the child enters at
    /// the parent's generation + 1 with the parent's current rating, and
    /// the parent is marked superseded.
    pub fn add_child(
        &self,
        parent_id: &ProposalId,
        draft: DraftProposal,
    ) -> Result<ProposalId, RepositoryError> {
        let mut state = self.state.lock();
        let (parent_generation, parent_elo) = {
            let parent = state
                .proposals
                .get(parent_id)
                .ok_or_else(|| RepositoryError::UnknownParent(parent_id.clone()))?;
            (parent.generation, parent.elo)
        };

        state.next_seq += 1;
        let id = ProposalId::minted(state.next_seq);
        let proposal = Proposal {
            id: id.clone(),
            title: draft.title,
            description: draft.description,
            rationale: draft.rationale,
            implementation_notes: draft.implementation_notes,
            generation: parent_generation + 1,
            parent_id: Some(parent_id.clone()),
            elo: parent_elo,
            created_at: Utc::now(),
            superseded: false,
            stakeholder_impacts: draft.stakeholder_impacts,
        };
        state.proposals.insert(id.clone(), proposal);

        let parent = state
            .proposals
            .get_mut(parent_id)
            .expect("parent presence checked above");
        parent.superseded = true;
        Ok(id)
    }

    pub fn get(&self, id: &ProposalId) -> Option<Proposal> {
        self.state.lock().proposals.get(id).cloned()
    }

    /// All proposals of the run. Nothing is ever deleted; superseded
    /// parents stay rankable and comparable.
    pub fn all_active(&self) -> Vec<Proposal> {
        self.state.lock().proposals.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top `n` proposals by rating. Ties break toward the higher
    /// generation, then the earlier creation time, then the smaller ID,
    /// for stable enumeration across runs.
    pub fn top(&self, n: usize) -> Vec<Proposal> {
        let mut proposals = self.all_active();
        proposals.sort_by(|a, b| {
            b.elo
                .partial_cmp(&a.elo)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.generation.cmp(&a.generation))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        proposals.truncate(n);
        proposals
    }

    /// Overwrite a rating. Ratings are real-valued with no lower bound.
    pub fn update_elo(&self, id: &ProposalId, new_rating: f64) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        let proposal = state
            .proposals
            .get_mut(id)
            .ok_or_else(|| RepositoryError::UnknownProposal(id.clone()))?;
        proposal.elo = new_rating;
        Ok(())
    }

    /// Apply one decisive comparison outcome to both ratings.
    pub fn apply_outcome(
        &self,
        winner_id: &ProposalId,
        loser_id: &ProposalId,
    ) -> Result<(f64, f64), RepositoryError> {
        let mut state = self.state.lock();
        let winner_elo = state
            .proposals
            .get(winner_id)
            .ok_or_else(|| RepositoryError::UnknownProposal(winner_id.clone()))?
            .elo;
        let loser_elo = state
            .proposals
            .get(loser_id)
            .ok_or_else(|| RepositoryError::UnknownProposal(loser_id.clone()))?
            .elo;

        let delta = elo::rating_delta(winner_elo, loser_elo, self.k_factor);
        let new_winner = winner_elo + delta;
        let new_loser = loser_elo - delta;

        state.proposals.get_mut(winner_id).expect("checked above").elo = new_winner;
        state.proposals.get_mut(loser_id).expect("checked above").elo = new_loser;
        Ok((new_winner, new_loser))
    }

    pub fn mark_superseded(&self, id: &ProposalId) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        let proposal = state
            .proposals
            .get_mut(id)
            .ok_or_else(|| RepositoryError::UnknownProposal(id.clone()))?;
        proposal.superseded = true;
        Ok(())
    }

    /// Append a comparison record. Records are write-once.
    pub fn record_comparison(&self, record: ComparisonRecord) {
        let mut state = self.state.lock();
        state.compared_pairs.insert(record.pair.clone());
        state.comparisons.push(record);
    }

    /// Whether the canonical pair has been compared at any point in the
    /// run (used by the scheduler to prioritize fresh pairs).
    pub fn has_compared(&self, pair: &(ProposalId, ProposalId)) -> bool {
        self.state.lock().compared_pairs.contains(pair)
    }

    pub fn comparisons(&self) -> Vec<ComparisonRecord> {
        self.state.lock().comparisons.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(title: &str) -> DraftProposal {
        DraftProposal {
            title: title.to_string(),
            description: "desc".to_string(),
            rationale: "why".to_string(),
            implementation_notes: String::new(),
            stakeholder_impacts: Default::default(),
        }
    }

    #[test]
    fn minted_ids_are_sequential() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("A"));
        let b = repo.add_root(draft("B"));
        assert_eq!(a.as_str(), "prop-0001");
        assert_eq!(b.as_str(), "prop-0002");
    }

    #[test]
    fn child_generation_and_rating_follow_parent() {
        let repo = ProposalRepository::new(32.0);
        let parent = repo.add_root(draft("A"));
        repo.update_elo(&parent, 1260.0).unwrap();

        let child = repo.add_child(&parent, draft("A refined")).unwrap();
        let child_proposal = repo.get(&child).unwrap();
        assert_eq!(child_proposal.generation, 1);
        assert_eq!(child_proposal.parent_id, Some(parent.clone()));
        assert_eq!(child_proposal.elo, 1260.0);

        // Parent is superseded but still present.
        let parent_proposal = repo.get(&parent).unwrap();
        assert!(parent_proposal.superseded);
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn add_child_requires_existing_parent() {
        let repo = ProposalRepository::new(32.0);
        let err = repo
            .add_child(&ProposalId::new("prop-9999"), draft("orphan"))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::UnknownParent(_)));
    }

    #[test]
    fn lineage_is_a_forest() {
        // generation(child) = generation(parent) + 1 and parent ids only
        // point at pre-existing proposals, so no cycles can form.
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("A"));
        let b = repo.add_child(&a, draft("A2")).unwrap();
        let c = repo.add_child(&b, draft("A3")).unwrap();

        let mut cursor = repo.get(&c).unwrap();
        let mut hops = 0;
        while let Some(parent_id) = cursor.parent_id.clone() {
            let parent = repo.get(&parent_id).unwrap();
            assert_eq!(cursor.generation, parent.generation + 1);
            cursor = parent;
            hops += 1;
        }
        assert_eq!(hops, 2);
    }

    #[test]
    fn outcome_application_conserves_rating() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("A"));
        let b = repo.add_root(draft("B"));

        let before: f64 = repo.all_active().iter().map(|p| p.elo).sum();
        let (new_winner, new_loser) = repo.apply_outcome(&a, &b).unwrap();
        let after: f64 = repo.all_active().iter().map(|p| p.elo).sum();

        assert!((before - after).abs() < 1e-9);
        assert!(new_winner > INITIAL_ELO);
        assert!(new_loser < INITIAL_ELO);
        assert_eq!(new_winner, repo.get(&a).unwrap().elo);
    }

    #[test]
    fn top_breaks_ties_by_generation_then_age_then_id() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("A"));
        let b = repo.add_root(draft("B"));
        let c = repo.add_child(&a, draft("A2")).unwrap();
        // All three share the initial rating; the higher-generation child
        // ranks first, then the earlier-created root.
        let top = repo.top(3);
        assert_eq!(top[0].id, c);
        assert_eq!(top[1].id, a);
        assert_eq!(top[2].id, b);
    }

    #[test]
    fn superseded_proposals_still_rank() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("A"));
        let b = repo.add_root(draft("B"));
        repo.update_elo(&a, 1400.0).unwrap();
        repo.mark_superseded(&a).unwrap();

        let top = repo.top(2);
        assert_eq!(top[0].id, a);
        assert_eq!(top[1].id, b);
    }

    #[test]
    fn ratings_have_no_floor() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("A"));
        repo.update_elo(&a, -250.0).unwrap();
        assert_eq!(repo.get(&a).unwrap().elo, -250.0);
    }
}
