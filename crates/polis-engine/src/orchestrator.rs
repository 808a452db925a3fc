//! The run driver: generations, stop conditions, and the trace root.

use crate::assembler::ContextAssembler;
use crate::error::EngineError;
use crate::evolver::Evolver;
use crate::generator::Generator;
use crate::report::{summary_request, ReportHandoff};
use crate::repository::ProposalRepository;
use crate::tournament::{RoundState, TournamentScheduler};
use polis_gateway::{SearchGateway, WorkerGateway, WorkerRole};
use polis_trace::{SpanOutput, SpanType, TraceMeta, TraceStore};
use polis_types::{
    ContextBundle, EngineConfig, JurisdictionContext, PolicyQuery, PolicyType, ProposalId,
    ResearchBundle, SpanId, TraceId,
};
use std::sync::Arc;
use tracing::{error, info, warn};

const AGENT_NAME: &str = "orchestrator";
const TOP_PROPOSALS_IN_REPORT: usize = 3;

const LOCALIZATION_DIRECTIVE: &str =
    "Mention the jurisdiction by name throughout the report; the generated \
     proposals referenced it too rarely.";

/// Drives a full evolution run: context, generation, tournament rounds,
/// evolution, and the final hand-off.
pub struct Orchestrator {
    config: EngineConfig,
    worker: Arc<WorkerGateway>,
    search: Arc<SearchGateway>,
    trace: Arc<TraceStore>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        worker: Arc<WorkerGateway>,
        search: Arc<SearchGateway>,
        trace: Arc<TraceStore>,
    ) -> Self {
        Self { config, worker, search, trace }
    }

    /// Run the engine. Fatal mid-run failures still produce a hand-off
    /// with whatever ranking exists, marked `partial`, and the trace is
    /// flushed and closed either way.
    pub async fn run(
        &self,
        query: PolicyQuery,
        jurisdiction: JurisdictionContext,
        policy_type: PolicyType,
    ) -> Result<ReportHandoff, EngineError> {
        let trace_id = self
            .trace
            .start_trace(TraceMeta::new(query.text(), policy_type))
            .await?;
        let root = self
            .trace
            .open_span(&trace_id, None, SpanType::Run, AGENT_NAME)?;

        let repo = ProposalRepository::new(self.config.k_factor);
        let result = self
            .run_inner(&query, jurisdiction.clone(), &repo, &trace_id, &root)
            .await;

        match result {
            Ok(handoff) => {
                self.trace
                    .close_span(
                        &root,
                        SpanOutput::default()
                            .with_output(format!(
                                "run complete: {} proposal(s), {} comparison(s)",
                                handoff.rankings.len(),
                                handoff.comparison_records.len()
                            ))
                            .with_meta("converged", handoff.converged)
                            .with_meta("partial", handoff.partial),
                    )
                    .await?;
                self.trace.end_trace(&trace_id).await?;
                Ok(handoff)
            }
            Err(err) => {
                error!("run failed: {}", err);
                // Persist whatever ranking exists; the root span is
                // force-closed by end_trace.
                let bundle = ContextBundle::new(query, jurisdiction, ResearchBundle::default());
                let mut handoff = build_handoff(&repo, bundle, None, false, None);
                handoff.partial = true;
                handoff.failure = Some(err.to_string());
                let _ = self.trace.end_trace(&trace_id).await;
                Ok(handoff)
            }
        }
    }

    async fn run_inner(
        &self,
        query: &PolicyQuery,
        jurisdiction: JurisdictionContext,
        repo: &ProposalRepository,
        trace_id: &TraceId,
        root: &SpanId,
    ) -> Result<ReportHandoff, EngineError> {
        let assembler = ContextAssembler::new(self.search.clone());
        let generator = Generator::new(self.worker.clone());
        let tournament =
            TournamentScheduler::new(self.worker.clone(), self.config.double_blind);
        let evolver = Evolver::new(self.worker.clone());

        // Context, then the initial proposal population.
        let bundle = assembler
            .assemble(query, jurisdiction, &self.trace, trace_id, root)
            .await?;
        let generated = generator
            .generate(
                &bundle,
                self.config.initial_proposals,
                repo,
                &self.trace,
                trace_id,
                root,
            )
            .await?;
        let localization_deficit = generated.localization_deficit;

        let mut remaining_budget = self.config.total_pair_budget();
        let mut round_index = 0u32;
        let mut consecutive_aborts = 0u32;
        let mut convergence_streak = 0u32;
        let mut converged = false;
        let mut budget_exhausted = false;

        'generations: for generation in 1..=self.config.max_generations {
            info!(generation, proposals = repo.len(), "starting generation");

            for _ in 0..self.config.rounds_per_gen {
                if remaining_budget == 0 {
                    break;
                }
                round_index += 1;
                let budget_pairs =
                    self.config.pairs_for_round(repo.len()).min(remaining_budget);
                let outcome = tournament
                    .run_round(round_index, repo, budget_pairs, &self.trace, trace_id, root)
                    .await?;
                remaining_budget = remaining_budget.saturating_sub(outcome.pairs_scheduled);

                if outcome.state == RoundState::Aborted {
                    consecutive_aborts += 1;
                    if consecutive_aborts >= 2 {
                        info!("two consecutive aborted rounds; finishing with current ranking");
                        break 'generations;
                    }
                    // A single abort skips the rest of this generation's
                    // rounds and continues to evolution.
                    break;
                }
                consecutive_aborts = 0;
            }

            // The stop check uses this generation's tournament ranking;
            // evolved children inherit their parent's rating, so a gap
            // measured after evolution would always read as zero.
            let top = repo.top(self.config.top_m_evolve as usize);
            let gap = match (top.first(), top.last()) {
                (Some(first), Some(last)) if top.len() > 1 => Some(first.elo - last.elo),
                _ => None,
            };

            let top_ids: Vec<ProposalId> = top.iter().map(|p| p.id.clone()).collect();
            evolver
                .evolve(&top_ids, repo, &self.trace, trace_id, root)
                .await?;

            if remaining_budget == 0 {
                budget_exhausted = true;
                info!(generation, "pair budget exhausted; stopping");
                break;
            }
            if let Some(gap) = gap {
                if gap.abs() < self.config.convergence_epsilon {
                    convergence_streak += 1;
                } else {
                    convergence_streak = 0;
                }
                if convergence_streak >= 2 {
                    converged = true;
                    info!(generation, gap, "converged; stopping early");
                    break;
                }
            }
        }

        // Executive summary for the hand-off, synthesized best-effort.
        let request = summary_request(&bundle.query, &repo.top(TOP_PROPOSALS_IN_REPORT));
        let started = chrono::Utc::now();
        let executive_summary = match self
            .worker
            .invoke(WorkerRole::Synthesis, &request, None)
            .await
        {
            Ok(result) => {
                self.trace
                    .record_span(
                        trace_id,
                        Some(root),
                        SpanType::Synthesis,
                        AGENT_NAME,
                        SpanOutput::default()
                            .started(started)
                            .with_input(request)
                            .with_output(result.raw_text.clone())
                            .with_model(result.model)
                            .with_tokens(result.usage),
                    )
                    .await?;
                Some(result.raw_text)
            }
            Err(err) => {
                warn!("executive summary synthesis failed: {}", err);
                self.trace
                    .warning(
                        trace_id,
                        Some(root),
                        AGENT_NAME,
                        format!("executive summary synthesis failed: {}", err),
                    )
                    .await?;
                None
            }
        };

        let handoff = build_handoff(
            repo,
            bundle,
            localization_deficit.then(|| LOCALIZATION_DIRECTIVE.to_string()),
            converged,
            executive_summary,
        );

        self.trace
            .record_span(
                trace_id,
                Some(root),
                SpanType::Report,
                AGENT_NAME,
                SpanOutput::default()
                    .with_input(handoff.summary_request.clone())
                    .with_output(format!(
                        "handing {} top proposal(s) and {} comparison record(s) to the renderer",
                        handoff.top_proposals.len(),
                        handoff.comparison_records.len()
                    ))
                    .with_meta("converged", converged)
                    .with_meta("budget_exhausted", budget_exhausted)
                    .with_meta("localization_directive", handoff.localization_directive.is_some())
                    .with_meta("executive_summary", handoff.executive_summary.is_some()),
            )
            .await?;

        Ok(handoff)
    }
}

fn build_handoff(
    repo: &ProposalRepository,
    bundle: ContextBundle,
    localization_directive: Option<String>,
    converged: bool,
    executive_summary: Option<String>,
) -> ReportHandoff {
    let ranked = repo.top(repo.len().max(1));
    let top_proposals: Vec<_> = ranked
        .iter()
        .take(TOP_PROPOSALS_IN_REPORT)
        .cloned()
        .collect();
    let request = summary_request(&bundle.query, &top_proposals);
    ReportHandoff {
        top_proposals,
        rankings: ReportHandoff::rankings_from(&ranked),
        comparison_records: repo.comparisons(),
        context_bundle: bundle,
        summary_request: request,
        executive_summary,
        localization_directive,
        converged,
        partial: false,
        failure: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use polis_gateway::{
        FailingSearchProvider, LexicalJudgeWorker, WorkerBackend, WorkerFailure, WorkerGatewayConfig,
        WorkerRequest, WorkerResponse, WorkerRole,
    };
    use polis_trace::{read_trace_file, FileTraceSink};

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.max_generations = 2;
        config.rounds_per_gen = 3;
        config.initial_proposals = 3;
        config.top_m_evolve = 2;
        config.max_inflight = 1;
        config
    }

    fn elgin() -> JurisdictionContext {
        let mut ctx = JurisdictionContext::default();
        ctx.jurisdiction = Some("Elgin, Illinois".to_string());
        ctx.population = Some("115000".to_string());
        ctx
    }

    fn orchestrator_with(
        backend: Arc<dyn WorkerBackend>,
        config: EngineConfig,
        trace: Arc<TraceStore>,
    ) -> Orchestrator {
        let gateway_config = WorkerGatewayConfig {
            max_inflight: config.max_inflight,
            ..WorkerGatewayConfig::default()
        };
        Orchestrator::new(
            config,
            Arc::new(WorkerGateway::new(backend, gateway_config)),
            Arc::new(SearchGateway::offline()),
            trace,
        )
    }

    #[tokio::test]
    async fn lexical_stub_run_ranks_lexicographic_minimum_first() {
        let orchestrator = orchestrator_with(
            Arc::new(LexicalJudgeWorker::new()),
            test_config(),
            Arc::new(TraceStore::disabled()),
        );

        let handoff = orchestrator
            .run(
                PolicyQuery::new("Ban on single-use plastic bags"),
                elgin(),
                PolicyType::Evolution,
            )
            .await
            .unwrap();

        assert!(handoff.failure.is_none());
        assert!(!handoff.partial);

        // The judge always prefers the lexicographically smaller title,
        // so rank 1 is the minimum title of the whole population.
        let min_title = handoff
            .rankings
            .iter()
            .map(|r| r.title.clone())
            .min()
            .unwrap();
        assert_eq!(handoff.rankings[0].title, min_title);
        assert!(handoff.rankings[0].elo > 1200.0);

        // Evolution ran, so superseded parents remain in the ranking.
        assert!(handoff.rankings.iter().any(|r| r.superseded));
        assert!(handoff.rankings.iter().any(|r| r.generation > 0));
        assert!(!handoff.comparison_records.is_empty());

        // The hand-off carries the renderer's summary request and the
        // synthesized overview.
        assert!(handoff
            .summary_request
            .contains("Ban on single-use plastic bags"));
        assert!(handoff.executive_summary.is_some());
    }

    #[tokio::test]
    async fn degraded_search_is_recorded_and_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileTraceSink::new(dir.path()).await.unwrap());
        let trace = Arc::new(TraceStore::with_sinks(vec![sink.clone()]));
        let gateway_config = WorkerGatewayConfig::default();
        let orchestrator = Orchestrator::new(
            test_config(),
            Arc::new(WorkerGateway::new(
                Arc::new(LexicalJudgeWorker::new()),
                gateway_config,
            )),
            Arc::new(SearchGateway::new(
                Some(Arc::new(FailingSearchProvider)),
                None,
            )),
            trace,
        );

        let handoff = orchestrator
            .run(
                PolicyQuery::new("Ban on single-use plastic bags"),
                elgin(),
                PolicyType::Evolution,
            )
            .await
            .unwrap();

        assert!(handoff.context_bundle.research.degraded);
        assert!(!handoff.rankings.is_empty());

        // The context span carries the degradation marker.
        let trace_file = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let (_, spans) = read_trace_file(&trace_file).unwrap();
        let context_span = spans
            .iter()
            .find(|s| s.span_type == SpanType::Context)
            .unwrap();
        assert_eq!(
            context_span.metadata.get("search_degraded"),
            Some(&serde_json::Value::Bool(true))
        );
        assert!(spans.iter().any(|s| s.span_type == SpanType::Round));
        assert!(spans.iter().any(|s| s.span_type == SpanType::Report));
    }

    /// Delegates to the lexical judge but rate-limits the second
    /// comparison call of the run.
    struct RateLimitSecondComparison {
        inner: LexicalJudgeWorker,
        comparisons: Mutex<u32>,
    }

    #[async_trait]
    impl WorkerBackend for RateLimitSecondComparison {
        async fn complete(
            &self,
            request: &WorkerRequest,
        ) -> Result<WorkerResponse, WorkerFailure> {
            if request.role == WorkerRole::Comparison {
                let mut seen = self.comparisons.lock();
                *seen += 1;
                if *seen == 2 {
                    return Err(WorkerFailure::Status { code: 429, message: "quota".into() });
                }
            }
            self.inner.complete(request).await
        }
    }

    #[tokio::test]
    async fn rate_limited_round_aborts_but_run_continues_to_completion() {
        let backend = Arc::new(RateLimitSecondComparison {
            inner: LexicalJudgeWorker::new(),
            comparisons: Mutex::new(0),
        });
        let orchestrator = orchestrator_with(
            backend,
            test_config(),
            Arc::new(TraceStore::disabled()),
        );

        let handoff = orchestrator
            .run(
                PolicyQuery::new("Ban on single-use plastic bags"),
                elgin(),
                PolicyType::Evolution,
            )
            .await
            .unwrap();

        // The aborted round kept its single record; later rounds and
        // evolution still ran.
        assert!(handoff.failure.is_none());
        assert!(!handoff.partial);
        assert!(handoff
            .comparison_records
            .iter()
            .any(|r| r.round == 1));
        assert!(handoff.comparison_records.len() > 1);
        assert!(handoff.rankings.iter().any(|r| r.generation > 0));
    }

    /// Never picks a winner; every comparison is inconclusive.
    struct IndecisiveWorker {
        inner: LexicalJudgeWorker,
    }

    #[async_trait]
    impl WorkerBackend for IndecisiveWorker {
        async fn complete(
            &self,
            request: &WorkerRequest,
        ) -> Result<WorkerResponse, WorkerFailure> {
            if request.role == WorkerRole::Comparison {
                return Ok(WorkerResponse {
                    text: r#"{"winner_title": "Neither", "rationale": "too close to call"}"#
                        .to_string(),
                    model: "stub-worker".to_string(),
                    response_id: None,
                    usage: Default::default(),
                });
            }
            self.inner.complete(request).await
        }
    }

    #[tokio::test]
    async fn stable_gap_across_two_generations_converges() {
        let backend = Arc::new(IndecisiveWorker { inner: LexicalJudgeWorker::new() });
        let mut config = test_config();
        config.max_generations = 3;
        let orchestrator =
            orchestrator_with(backend, config, Arc::new(TraceStore::disabled()));

        let handoff = orchestrator
            .run(
                PolicyQuery::new("Ban on single-use plastic bags"),
                elgin(),
                PolicyType::Evolution,
            )
            .await
            .unwrap();

        // All comparisons inconclusive: every rating stays at 1200, the
        // top-1 vs top-M gap is 0 for two straight generations.
        assert!(handoff.converged);
        assert!(handoff.rankings.iter().all(|r| r.elo == 1200.0));
        assert!(handoff
            .comparison_records
            .iter()
            .all(|r| r.winner().is_none()));
    }

    #[tokio::test]
    async fn identical_inputs_reproduce_identical_runs() {
        let run = |_: u32| async {
            let orchestrator = orchestrator_with(
                Arc::new(LexicalJudgeWorker::new()),
                test_config(),
                Arc::new(TraceStore::disabled()),
            );
            orchestrator
                .run(
                PolicyQuery::new("Ban on single-use plastic bags"),
                elgin(),
                PolicyType::Evolution,
            )
                .await
                .unwrap()
        };

        let first = run(1).await;
        let second = run(2).await;

        let ids = |handoff: &ReportHandoff| -> Vec<(ProposalId, String, f64, u32)> {
            handoff
                .rankings
                .iter()
                .map(|r| (r.id.clone(), r.title.clone(), r.elo, r.generation))
                .collect()
        };
        assert_eq!(ids(&first), ids(&second));

        let comparisons = |handoff: &ReportHandoff| -> Vec<_> {
            handoff
                .comparison_records
                .iter()
                .map(|r| (r.round, r.pair.clone(), r.outcome.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(comparisons(&first), comparisons(&second));
    }
}
