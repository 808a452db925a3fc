//! Proposal evolution.
//!
//! Each top-ranked proposal is handed to the worker for improvement.
//! The child enters the repository one generation deeper with its
//! parent's current rating; the parent is marked superseded but stays
//! rankable and comparable.

use crate::error::EngineError;
use crate::repository::{DraftProposal, ProposalRepository};
use polis_gateway::{WorkerErrorKind, WorkerGateway, WorkerRole};
use polis_trace::{SpanOutput, SpanType, TraceStore};
use polis_types::{Proposal, ProposalId, SpanId, TraceId};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const AGENT_NAME: &str = "policy-evolver";

const EVOLUTION_SCHEMA: &str = r#"{
  "improvements": ["each specific change made"],
  "evolved": {
    "title": "string",
    "description": "string",
    "rationale": "string",
    "implementation_notes": "string (optional)"
  }
}"#;

#[derive(Debug, Deserialize)]
struct EvolutionResult {
    #[serde(default)]
    improvements: Vec<String>,
    evolved: EvolvedProposal,
}

#[derive(Debug, Deserialize)]
struct EvolvedProposal {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    implementation_notes: String,
    #[serde(default)]
    stakeholder_impacts: BTreeMap<String, String>,
}

pub struct Evolver {
    worker: Arc<WorkerGateway>,
}

impl Evolver {
    pub fn new(worker: Arc<WorkerGateway>) -> Self {
        Self { worker }
    }

    /// Evolve each of the given proposals. Malformed results drop just
    /// that unit; a rate limit stops evolving but keeps what exists.
    pub async fn evolve(
        &self,
        top_ids: &[ProposalId],
        repo: &ProposalRepository,
        trace: &TraceStore,
        trace_id: &TraceId,
        parent_span: &SpanId,
    ) -> Result<Vec<ProposalId>, EngineError> {
        let mut children = Vec::new();

        for id in top_ids {
            let Some(parent) = repo.get(id) else {
                continue;
            };
            let started = chrono::Utc::now();
            let prompt = evolution_prompt(&parent);

            let result = match self
                .worker
                .invoke(WorkerRole::Evolution, &prompt, Some(EVOLUTION_SCHEMA))
                .await
            {
                Ok(result) => result,
                Err(err) => match err.kind {
                    WorkerErrorKind::Fatal => return Err(err.into()),
                    WorkerErrorKind::RateLimited => {
                        warn!("evolution rate limited; keeping {} evolved proposal(s)", children.len());
                        break;
                    }
                    WorkerErrorKind::Malformed | WorkerErrorKind::Transient => {
                        trace
                            .record_span(
                                trace_id,
                                Some(parent_span),
                                SpanType::Evolution,
                                AGENT_NAME,
                                SpanOutput::default()
                                    .started(started)
                                    .with_input(prompt)
                                    .with_output(err.to_string())
                                    .with_meta("dropped", true),
                            )
                            .await?;
                        continue;
                    }
                },
            };

            let parsed: Option<EvolutionResult> = result
                .structured
                .as_ref()
                .and_then(|value| serde_json::from_value(value.clone()).ok());
            let Some(evolution) = parsed.filter(|e| is_complete(&e.evolved)) else {
                trace
                    .record_span(
                        trace_id,
                        Some(parent_span),
                        SpanType::Evolution,
                        AGENT_NAME,
                        SpanOutput::default()
                            .started(started)
                            .with_input(prompt)
                            .with_output(result.raw_text)
                            .with_meta("dropped", true),
                    )
                    .await?;
                continue;
            };

            let child_id = repo.add_child(
                id,
                DraftProposal {
                    title: evolution.evolved.title.trim().to_string(),
                    description: evolution.evolved.description,
                    rationale: evolution.evolved.rationale,
                    implementation_notes: evolution.evolved.implementation_notes,
                    stakeholder_impacts: evolution.evolved.stakeholder_impacts,
                },
            )?;

            info!(parent = %id, child = %child_id, "evolved proposal");
            trace
                .record_span(
                    trace_id,
                    Some(parent_span),
                    SpanType::Evolution,
                    AGENT_NAME,
                    SpanOutput::default()
                        .started(started)
                        .with_input(prompt)
                        .with_output(result.raw_text)
                        .with_model(result.model)
                        .with_tokens(result.usage)
                        .with_meta("parent", id.to_string())
                        .with_meta("child", child_id.to_string())
                        .with_meta("improvements", evolution.improvements.len()),
                )
                .await?;
            children.push(child_id);
        }

        Ok(children)
    }
}

fn evolution_prompt(parent: &Proposal) -> String {
    format!(
        "Evolve and improve this policy proposal while preserving its core intent.\n\n\
         Title: {}\n\
         Description: {}\n\
         Rationale: {}\n\
         Implementation notes: {}\n\n\
         Enumerate the specific improvements you made, then present the improved proposal.",
        parent.title, parent.description, parent.rationale, parent.implementation_notes,
    )
}

fn is_complete(evolved: &EvolvedProposal) -> bool {
    !evolved.title.trim().is_empty()
        && !evolved.description.trim().is_empty()
        && !evolved.rationale.trim().is_empty()
}
