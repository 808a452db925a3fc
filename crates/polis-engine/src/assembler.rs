//! Context bundle assembly.
//!
//! Gathers research through the search gateway and packages it with the
//! user-supplied jurisdiction context. The bundle is immutable once
//! constructed and is passed by ID across components.

use crate::error::EngineError;
use polis_gateway::SearchGateway;
use polis_trace::{SpanOutput, SpanType, TraceStore};
use polis_types::{ContextBundle, JurisdictionContext, PolicyQuery, ResearchBundle, SpanId, TraceId};
use std::sync::Arc;

const AGENT_NAME: &str = "context-assembler";
const RESULTS_PER_QUERY: usize = 3;

pub struct ContextAssembler {
    search: Arc<SearchGateway>,
}

impl ContextAssembler {
    pub fn new(search: Arc<SearchGateway>) -> Self {
        Self { search }
    }

    /// Build the bundle for a run, recording one context span with a
    /// search child span per research query.
    pub async fn assemble(
        &self,
        query: &PolicyQuery,
        jurisdiction: JurisdictionContext,
        trace: &TraceStore,
        trace_id: &TraceId,
        parent_span: &SpanId,
    ) -> Result<ContextBundle, EngineError> {
        let span = trace.open_span(trace_id, Some(parent_span), SpanType::Context, AGENT_NAME)?;

        if jurisdiction.is_empty() {
            trace
                .warning(
                    trace_id,
                    Some(&span),
                    AGENT_NAME,
                    "no jurisdiction fields supplied; proposals will not be localized",
                )
                .await?;
        }

        let mut research = ResearchBundle::default();
        for search_query in research_queries(query, &jurisdiction) {
            let outcome = self.search.search(&search_query, RESULTS_PER_QUERY).await;
            trace
                .record_span(
                    trace_id,
                    Some(&span),
                    SpanType::Search,
                    AGENT_NAME,
                    SpanOutput::default()
                        .with_input(search_query.clone())
                        .with_output(format!("{} hit(s)", outcome.hits.len()))
                        .with_meta("degraded", outcome.degraded),
                )
                .await?;
            research.degraded |= outcome.degraded;
            research.hits.extend(outcome.hits);
        }
        research.summary = synthesize_summary(&research);

        let bundle = ContextBundle::new(query.clone(), jurisdiction, research);
        trace
            .close_span(
                &span,
                SpanOutput::default()
                    .with_output(format!(
                        "bundle {} with {} research hit(s)",
                        bundle.id,
                        bundle.research.hits.len()
                    ))
                    .with_meta("search_degraded", bundle.research.degraded)
                    .with_meta("fingerprint", bundle.fingerprint()),
            )
            .await?;
        Ok(bundle)
    }
}

/// The research plan: a handful of angles that surface ordinances,
/// outcomes, and stakeholder reactions in comparable jurisdictions.
fn research_queries(query: &PolicyQuery, jurisdiction: &JurisdictionContext) -> Vec<String> {
    let topic = query.text();
    let mut queries = vec![
        format!("{} successful implementations", topic),
        format!("{} economic impact", topic),
        format!("{} stakeholder response", topic),
        format!("{} implementation challenges", topic),
    ];
    if let Some(place) = jurisdiction.jurisdiction.as_deref() {
        queries.insert(1, format!("{} ordinance example {}", topic, place));
    }
    queries
}

fn synthesize_summary(research: &ResearchBundle) -> String {
    if research.hits.is_empty() {
        return "No research results were available.".to_string();
    }
    let mut lines = vec!["Key findings from research:".to_string()];
    for hit in research.hits.iter().take(6) {
        lines.push(format!("- {}", hit.snippet));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elgin() -> JurisdictionContext {
        let mut ctx = JurisdictionContext::default();
        ctx.jurisdiction = Some("Elgin, Illinois".to_string());
        ctx.population = Some("115000".to_string());
        ctx
    }

    #[tokio::test]
    async fn offline_assembly_is_degraded_but_complete() {
        let assembler = ContextAssembler::new(Arc::new(SearchGateway::offline()));
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

        let bundle = assembler
            .assemble(
                &PolicyQuery::new("Ban on single-use plastic bags"),
                elgin(),
                &trace,
                &trace_id,
                &root,
            )
            .await
            .unwrap();

        assert!(bundle.research.degraded);
        assert!(!bundle.research.hits.is_empty());
        assert!(bundle.research.summary.contains("Key findings"));
        // Jurisdiction-specific angle included when the field is set.
        assert!(bundle
            .research
            .hits
            .iter()
            .any(|hit| hit.query.contains("ordinance example Elgin, Illinois")));
    }

    #[tokio::test]
    async fn empty_context_still_assembles() {
        let assembler = ContextAssembler::new(Arc::new(SearchGateway::offline()));
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

        let bundle = assembler
            .assemble(
                &PolicyQuery::new("Ban on single-use plastic bags"),
                JurisdictionContext::default(),
                &trace,
                &trace_id,
                &root,
            )
            .await
            .unwrap();
        assert!(bundle.jurisdiction.is_empty());
        assert_eq!(bundle.research.hits.len(), 4 * 3);
    }
}
