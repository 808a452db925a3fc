//! Tournament rounds of pairwise comparisons.
//!
//! Pairs are planned deterministically (fresh pairs first, then closest
//! ratings, ties lexicographic), evaluated concurrently through the
//! worker gateway, and their Elo updates applied serially in completion
//! order. Rate limits abort the round cleanly, preserving whatever was
//! already recorded.

use crate::error::EngineError;
use crate::repository::ProposalRepository;
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use polis_gateway::{WorkerError, WorkerErrorKind, WorkerGateway, WorkerResult, WorkerRole};
use polis_trace::{SpanOutput, SpanType, TraceStore};
use polis_types::{
    canonical_pair, proposal::normalize_title, ComparisonOutcome, ComparisonRecord, Proposal,
    ProposalId, SpanId, TraceId, WorkerMeta,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const AGENT_NAME: &str = "policy-tournament";
const INCONCLUSIVE_WARNING_RATE: f64 = 0.2;

const COMPARISON_SCHEMA: &str = r#"{
  "winner_title": "the full title of the winning proposal",
  "rationale": "one paragraph explaining the verdict"
}"#;

/// Per-round lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Planned,
    Running,
    Completed,
    Aborted,
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoundState::Planned => write!(f, "planned"),
            RoundState::Running => write!(f, "running"),
            RoundState::Completed => write!(f, "completed"),
            RoundState::Aborted => write!(f, "aborted"),
        }
    }
}

/// What a round produced.
#[derive(Debug)]
pub struct RoundOutcome {
    pub state: RoundState,
    pub records: Vec<ComparisonRecord>,
    /// Pairs scheduled; this is what counts against the run budget.
    pub pairs_scheduled: u32,
    pub inconclusive: u32,
    pub dropped: u32,
    pub aborted_by: Option<WorkerErrorKind>,
}

struct Evaluation {
    pair: (ProposalId, ProposalId),
    swapped: bool,
    started_at: DateTime<Utc>,
    prompt: String,
    result: Result<WorkerResult, WorkerError>,
}

pub struct TournamentScheduler {
    worker: Arc<WorkerGateway>,
    double_blind: bool,
}

impl TournamentScheduler {
    pub fn new(worker: Arc<WorkerGateway>, double_blind: bool) -> Self {
        Self { worker, double_blind }
    }

    /// Run one round of up to `budget_pairs` comparisons over the
    /// repository's proposals.
    pub async fn run_round(
        &self,
        round_index: u32,
        repo: &ProposalRepository,
        budget_pairs: u32,
        trace: &TraceStore,
        trace_id: &TraceId,
        parent_span: &SpanId,
    ) -> Result<RoundOutcome, EngineError> {
        let proposals = repo.all_active();
        let by_id: HashMap<ProposalId, Proposal> =
            proposals.iter().map(|p| (p.id.clone(), p.clone())).collect();

        let round_span =
            trace.open_span(trace_id, Some(parent_span), SpanType::Round, AGENT_NAME)?;

        // The round is Planned until its evaluations are in flight.
        let pairs = plan_pairs(&proposals, repo, budget_pairs);
        if pairs.is_empty() {
            // Fewer than two proposals, or no budget: an empty round is
            // not an error.
            debug!(round_index, "round has no pairs to compare");
            let outcome = RoundOutcome {
                state: RoundState::Completed,
                records: Vec::new(),
                pairs_scheduled: 0,
                inconclusive: 0,
                dropped: 0,
                aborted_by: None,
            };
            self.close_round_span(trace, &round_span, round_index, &outcome).await?;
            return Ok(outcome);
        }

        let mut evaluations: Vec<((ProposalId, ProposalId), bool)> = Vec::new();
        for pair in &pairs {
            evaluations.push((pair.clone(), false));
            if self.double_blind {
                evaluations.push((pair.clone(), true));
            }
        }

        let mut state = RoundState::Running;
        let mut inflight: FuturesUnordered<_> = evaluations
            .into_iter()
            .map(|(pair, swapped)| {
                let worker = self.worker.clone();
                let a = by_id[&pair.0].clone();
                let b = by_id[&pair.1].clone();
                async move {
                    let (first, second) = if swapped { (&b, &a) } else { (&a, &b) };
                    let prompt = comparison_prompt(first, second);
                    let started_at = Utc::now();
                    let result = worker
                        .invoke(WorkerRole::Comparison, &prompt, Some(COMPARISON_SCHEMA))
                        .await;
                    Evaluation { pair, swapped, started_at, prompt, result }
                }
            })
            .collect();

        let mut records = Vec::new();
        let mut inconclusive = 0u32;
        let mut dropped = 0u32;
        let mut aborted_by = None;

        while let Some(eval) = inflight.next().await {
            match eval.result {
                Ok(result) => {
                    let a = &by_id[&eval.pair.0];
                    let b = &by_id[&eval.pair.1];
                    let (outcome, rationale) = resolve_verdict(result.structured.as_ref(), a, b);

                    if let ComparisonOutcome::Decisive { winner, loser } = &outcome {
                        repo.apply_outcome(winner, loser)?;
                    } else {
                        inconclusive += 1;
                    }

                    let record = ComparisonRecord {
                        round: round_index,
                        pair: eval.pair.clone(),
                        outcome,
                        rationale,
                        worker: WorkerMeta {
                            model: result.model.clone(),
                            response_id: result.response_id.clone(),
                            usage: result.usage.clone(),
                        },
                        position_swapped: eval.swapped,
                        created_at: Utc::now(),
                    };
                    repo.record_comparison(record.clone());

                    trace
                        .record_span(
                            trace_id,
                            Some(&round_span),
                            SpanType::Comparison,
                            AGENT_NAME,
                            SpanOutput::default()
                                .started(eval.started_at)
                                .with_input(eval.prompt)
                                .with_output(result.raw_text)
                                .with_model(result.model)
                                .with_tokens(result.usage)
                                .with_meta("pair_a", eval.pair.0.to_string())
                                .with_meta("pair_b", eval.pair.1.to_string())
                                .with_meta("position_swapped", eval.swapped)
                                .with_meta(
                                    "winner",
                                    record
                                        .winner()
                                        .map(|id| id.to_string())
                                        .unwrap_or_else(|| "inconclusive".to_string()),
                                ),
                        )
                        .await?;
                    records.push(record);
                }
                Err(err) => match err.kind {
                    WorkerErrorKind::RateLimited | WorkerErrorKind::Fatal => {
                        warn!(round_index, kind = %err.kind, "aborting round: {}", err);
                        aborted_by = Some(err.kind);
                        state = RoundState::Aborted;
                        // Dropping the stream cancels in-flight work; no
                        // further Elo updates are applied.
                        drop(inflight);
                        break;
                    }
                    WorkerErrorKind::Malformed | WorkerErrorKind::Transient => {
                        dropped += 1;
                        trace
                            .record_span(
                                trace_id,
                                Some(&round_span),
                                SpanType::Comparison,
                                AGENT_NAME,
                                SpanOutput::default()
                                    .started(eval.started_at)
                                    .with_input(eval.prompt)
                                    .with_output(err.to_string())
                                    .with_meta("dropped", true),
                            )
                            .await?;
                    }
                },
            }
        }

        if state == RoundState::Running {
            state = RoundState::Completed;
        }

        let evaluated = records.len() as u32;
        if evaluated > 0 && f64::from(inconclusive) / f64::from(evaluated) > INCONCLUSIVE_WARNING_RATE
        {
            trace
                .warning(
                    trace_id,
                    Some(&round_span),
                    AGENT_NAME,
                    format!(
                        "round {}: {} of {} comparisons were inconclusive",
                        round_index, inconclusive, evaluated
                    ),
                )
                .await?;
        }

        let outcome = RoundOutcome {
            state,
            records,
            pairs_scheduled: pairs.len() as u32,
            inconclusive,
            dropped,
            aborted_by,
        };
        self.close_round_span(trace, &round_span, round_index, &outcome).await?;
        Ok(outcome)
    }

    async fn close_round_span(
        &self,
        trace: &TraceStore,
        round_span: &SpanId,
        round_index: u32,
        outcome: &RoundOutcome,
    ) -> Result<(), EngineError> {
        let mut output = SpanOutput::default()
            .with_output(format!(
                "{} comparison(s), {} inconclusive, {} dropped",
                outcome.records.len(),
                outcome.inconclusive,
                outcome.dropped
            ))
            .with_meta("round_index", round_index)
            .with_meta("state", outcome.state.to_string())
            .with_meta("pairs_scheduled", outcome.pairs_scheduled);
        if outcome.state == RoundState::Aborted {
            output = output.with_meta("partial_round", true);
            if let Some(kind) = outcome.aborted_by {
                output = output.with_meta("aborted_by", kind.to_string());
            }
        }
        trace.close_span(round_span, output).await?;
        Ok(())
    }
}

/// Plan up to `budget` canonical pairs: pairs never compared in this run
/// first, then the smallest rating gap, ties in lexicographic pair
/// order.
fn plan_pairs(
    proposals: &[Proposal],
    repo: &ProposalRepository,
    budget: u32,
) -> Vec<(ProposalId, ProposalId)> {
    let mut sorted: Vec<&Proposal> = proposals.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut pairs = Vec::new();
    for (i, a) in sorted.iter().enumerate() {
        for b in sorted.iter().skip(i + 1) {
            let pair = canonical_pair(a.id.clone(), b.id.clone());
            let elo_gap = (a.elo - b.elo).abs();
            let compared = repo.has_compared(&pair);
            pairs.push((pair, compared, elo_gap));
        }
    }

    pairs.sort_by(|(pair_x, compared_x, gap_x), (pair_y, compared_y, gap_y)| {
        compared_x
            .cmp(compared_y)
            .then_with(|| gap_x.partial_cmp(gap_y).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| pair_x.cmp(pair_y))
    });
    pairs.truncate(budget as usize);
    pairs.into_iter().map(|(pair, _, _)| pair).collect()
}

fn comparison_prompt(first: &Proposal, second: &Proposal) -> String {
    format!(
        "Policy Comparison:\n\n\
         Proposal A\n\
         Title: {}\n\
         Description: {}\n\
         Rationale: {}\n\n\
         Proposal B\n\
         Title: {}\n\
         Description: {}\n\
         Rationale: {}\n\n\
         Which proposal is more effective and equitable overall? \
         Identify the winner by its full title.",
        first.title,
        first.description,
        first.rationale,
        second.title,
        second.description,
        second.rationale,
    )
}

/// Match the verdict's winner text to one of the two proposals: exact
/// title first, then normalized title, otherwise inconclusive.
fn resolve_verdict(
    structured: Option<&Value>,
    a: &Proposal,
    b: &Proposal,
) -> (ComparisonOutcome, String) {
    let rationale = structured
        .and_then(|v| v.get("rationale"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let winner_text = structured
        .and_then(|v| v.get("winner_title"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let outcome = if winner_text == a.title {
        decisive(a, b)
    } else if winner_text == b.title {
        decisive(b, a)
    } else {
        let normalized = normalize_title(winner_text);
        if !normalized.is_empty() && normalized == a.normalized_title() {
            decisive(a, b)
        } else if !normalized.is_empty() && normalized == b.normalized_title() {
            decisive(b, a)
        } else {
            ComparisonOutcome::Inconclusive
        }
    };
    (outcome, rationale)
}

fn decisive(winner: &Proposal, loser: &Proposal) -> ComparisonOutcome {
    ComparisonOutcome::Decisive {
        winner: winner.id.clone(),
        loser: loser.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DraftProposal;
    use async_trait::async_trait;
    use polis_gateway::{
        LexicalJudgeWorker, ScriptedWorker, WorkerBackend, WorkerFailure, WorkerGatewayConfig,
        WorkerRequest, WorkerResponse,
    };
    use parking_lot::Mutex;

    fn draft(title: &str) -> DraftProposal {
        DraftProposal {
            title: title.to_string(),
            description: format!("{} description", title),
            rationale: format!("{} rationale", title),
            implementation_notes: String::new(),
            stakeholder_impacts: Default::default(),
        }
    }

    async fn trace_handles() -> (TraceStore, TraceId, SpanId) {
        let trace = TraceStore::disabled();
        let trace_id = trace
            .start_trace(polis_trace::TraceMeta::new(
                "bag ban",
                polis_types::PolicyType::Evolution,
            ))
            .await
            .unwrap();
        let root = trace
            .open_span(&trace_id, None, SpanType::Run, "orchestrator")
            .unwrap();
        (trace, trace_id, root)
    }

    fn lexical_scheduler() -> TournamentScheduler {
        let worker = Arc::new(WorkerGateway::new(
            Arc::new(LexicalJudgeWorker::new()),
            WorkerGatewayConfig::default(),
        ));
        TournamentScheduler::new(worker, false)
    }

    #[test]
    fn planning_prefers_fresh_then_close_pairs() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("A"));
        let b = repo.add_root(draft("B"));
        let c = repo.add_root(draft("C"));
        repo.update_elo(&a, 1300.0).unwrap();
        repo.update_elo(&b, 1290.0).unwrap();
        repo.update_elo(&c, 1100.0).unwrap();

        // Mark (a, b) as already compared.
        repo.record_comparison(ComparisonRecord {
            round: 1,
            pair: canonical_pair(a.clone(), b.clone()),
            outcome: ComparisonOutcome::Inconclusive,
            rationale: String::new(),
            worker: WorkerMeta::default(),
            position_swapped: false,
            created_at: Utc::now(),
        });

        let pairs = plan_pairs(&repo.all_active(), &repo, 3);
        // Fresh pairs first: (a, c) has gap 200, (b, c) has gap 190, so
        // (b, c) leads; the already-compared (a, b) comes last.
        assert_eq!(pairs[0], canonical_pair(b.clone(), c.clone()));
        assert_eq!(pairs[1], canonical_pair(a.clone(), c.clone()));
        assert_eq!(pairs[2], canonical_pair(a, b));
    }

    #[tokio::test]
    async fn single_proposal_round_is_empty_without_error() {
        let repo = ProposalRepository::new(32.0);
        repo.add_root(draft("Only Option"));
        let (trace, trace_id, root) = trace_handles().await;

        let outcome = lexical_scheduler()
            .run_round(1, &repo, 5, &trace, &trace_id, &root)
            .await
            .unwrap();
        assert_eq!(outcome.state, RoundState::Completed);
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.pairs_scheduled, 0);
    }

    #[tokio::test]
    async fn two_proposals_with_budget_one_perform_one_comparison() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("Apple Policy"));
        let b = repo.add_root(draft("Banana Policy"));
        let (trace, trace_id, root) = trace_handles().await;

        let outcome = lexical_scheduler()
            .run_round(1, &repo, 1, &trace, &trace_id, &root)
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.pairs_scheduled, 1);
        // The lexical judge prefers the smaller title.
        assert_eq!(outcome.records[0].winner(), Some(&a));
        assert!(repo.get(&a).unwrap().elo > repo.get(&b).unwrap().elo);
    }

    #[tokio::test]
    async fn elo_is_conserved_across_a_round() {
        let repo = ProposalRepository::new(32.0);
        for title in ["A", "B", "C"] {
            repo.add_root(draft(title));
        }
        let (trace, trace_id, root) = trace_handles().await;

        let before: f64 = repo.all_active().iter().map(|p| p.elo).sum();
        lexical_scheduler()
            .run_round(1, &repo, 3, &trace, &trace_id, &root)
            .await
            .unwrap();
        let after: f64 = repo.all_active().iter().map(|p| p.elo).sum();
        assert!((before - after).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unmatchable_verdicts_record_inconclusive_and_leave_ratings() {
        let repo = ProposalRepository::new(32.0);
        repo.add_root(draft("A"));
        repo.add_root(draft("B"));
        repo.add_root(draft("C"));

        // Every verdict names a proposal that does not exist.
        let scripted = ScriptedWorker::new(vec![
            r#"{"winner_title": "Nonexistent", "rationale": "?"}"#.to_string(),
            r#"{"winner_title": "Nonexistent", "rationale": "?"}"#.to_string(),
            r#"{"winner_title": "Nonexistent", "rationale": "?"}"#.to_string(),
        ]);
        let worker = Arc::new(WorkerGateway::new(
            Arc::new(scripted),
            WorkerGatewayConfig::default(),
        ));
        let scheduler = TournamentScheduler::new(worker, false);
        let (trace, trace_id, root) = trace_handles().await;

        let outcome = scheduler
            .run_round(1, &repo, 3, &trace, &trace_id, &root)
            .await
            .unwrap();

        assert_eq!(outcome.state, RoundState::Completed);
        assert_eq!(outcome.inconclusive, 3);
        assert_eq!(outcome.records.len(), 3);
        for proposal in repo.all_active() {
            assert_eq!(proposal.elo, polis_types::INITIAL_ELO);
        }
    }

    #[tokio::test]
    async fn round_after_all_inconclusive_round_proceeds_normally() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("A"));
        repo.add_root(draft("B"));
        repo.add_root(draft("C"));
        let (trace, trace_id, root) = trace_handles().await;

        // Round 1: every verdict is unrecognizable.
        let garbage = ScriptedWorker::new(vec![
            r#"{"winner_title": "???", "rationale": "?"}"#.to_string(),
            r#"{"winner_title": "???", "rationale": "?"}"#.to_string(),
            r#"{"winner_title": "???", "rationale": "?"}"#.to_string(),
        ]);
        let round_one = TournamentScheduler::new(
            Arc::new(WorkerGateway::new(Arc::new(garbage), WorkerGatewayConfig::default())),
            false,
        );
        let outcome = round_one
            .run_round(1, &repo, 3, &trace, &trace_id, &root)
            .await
            .unwrap();
        assert_eq!(outcome.inconclusive, 3);
        assert!(repo.all_active().iter().all(|p| p.elo == polis_types::INITIAL_ELO));

        // Round 2: a cooperating judge ranks normally.
        let outcome = lexical_scheduler()
            .run_round(2, &repo, 3, &trace, &trace_id, &root)
            .await
            .unwrap();
        assert_eq!(outcome.state, RoundState::Completed);
        assert_eq!(outcome.inconclusive, 0);
        assert!(repo.get(&a).unwrap().elo > polis_types::INITIAL_ELO);
        assert_eq!(repo.comparisons().len(), 6);
    }

    #[tokio::test]
    async fn normalized_title_match_still_resolves() {
        let repo = ProposalRepository::new(32.0);
        let a = repo.add_root(draft("Bag  Fee Ordinance"));
        repo.add_root(draft("Zoning Reform"));

        let scripted = ScriptedWorker::new(vec![
            r#"{"winner_title": "bag fee   ordinance", "rationale": "cheaper"}"#.to_string(),
        ]);
        let worker = Arc::new(WorkerGateway::new(
            Arc::new(scripted),
            WorkerGatewayConfig::default(),
        ));
        let scheduler = TournamentScheduler::new(worker, false);
        let (trace, trace_id, root) = trace_handles().await;

        let outcome = scheduler
            .run_round(1, &repo, 1, &trace, &trace_id, &root)
            .await
            .unwrap();
        assert_eq!(outcome.records[0].winner(), Some(&a));
    }

    /// Backend that succeeds `successes` times, then rate-limits.
    struct RateLimitAfter {
        successes: Mutex<u32>,
    }

    #[async_trait]
    impl WorkerBackend for RateLimitAfter {
        async fn complete(
            &self,
            request: &WorkerRequest,
        ) -> Result<WorkerResponse, WorkerFailure> {
            let mut left = self.successes.lock();
            if *left == 0 {
                return Err(WorkerFailure::Status { code: 429, message: "quota".into() });
            }
            *left -= 1;
            let titles: Vec<&str> = request
                .prompt
                .lines()
                .filter_map(|l| l.trim().strip_prefix("Title: "))
                .collect();
            Ok(WorkerResponse {
                text: format!(r#"{{"winner_title": "{}", "rationale": "ok"}}"#, titles[0]),
                model: "stub-worker".to_string(),
                response_id: None,
                usage: Default::default(),
            })
        }
    }

    #[tokio::test]
    async fn rate_limit_aborts_round_preserving_partial_records() {
        let repo = ProposalRepository::new(32.0);
        for title in ["A", "B", "C", "D"] {
            repo.add_root(draft(title));
        }
        let backend = Arc::new(RateLimitAfter { successes: Mutex::new(1) });
        let mut config = WorkerGatewayConfig::default();
        config.max_inflight = 1;
        let worker = Arc::new(WorkerGateway::new(backend, config));
        let scheduler = TournamentScheduler::new(worker, false);
        let (trace, trace_id, root) = trace_handles().await;

        let outcome = scheduler
            .run_round(3, &repo, 5, &trace, &trace_id, &root)
            .await
            .unwrap();

        assert_eq!(outcome.state, RoundState::Aborted);
        assert_eq!(outcome.aborted_by, Some(WorkerErrorKind::RateLimited));
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(repo.comparisons().len(), 1);
    }

    #[tokio::test]
    async fn double_blind_records_both_positions() {
        let repo = ProposalRepository::new(32.0);
        repo.add_root(draft("A"));
        repo.add_root(draft("B"));
        let worker = Arc::new(WorkerGateway::new(
            Arc::new(LexicalJudgeWorker::new()),
            WorkerGatewayConfig::default(),
        ));
        let scheduler = TournamentScheduler::new(worker, true);
        let (trace, trace_id, root) = trace_handles().await;

        let outcome = scheduler
            .run_round(1, &repo, 1, &trace, &trace_id, &root)
            .await
            .unwrap();

        // One pair, two recorded outcomes with swapped positions.
        assert_eq!(outcome.pairs_scheduled, 1);
        assert_eq!(outcome.records.len(), 2);
        assert_ne!(outcome.records[0].position_swapped, outcome.records[1].position_swapped);
    }
}
