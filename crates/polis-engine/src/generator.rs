//! Initial proposal generation.

use crate::error::EngineError;
use crate::repository::{DraftProposal, ProposalRepository};
use polis_gateway::{WorkerGateway, WorkerResult, WorkerRole};
use polis_trace::{SpanOutput, SpanType, TraceStore};
use polis_types::{ContextBundle, ProposalId, SpanId, TraceId};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

const AGENT_NAME: &str = "policy-generator";

const GENERATION_SCHEMA: &str = r#"{
  "proposals": [
    {
      "title": "string",
      "description": "string",
      "rationale": "string",
      "implementation_notes": "string (optional)",
      "stakeholder_impacts": {"group": "impact"}
    }
  ]
}"#;

const DIVERSITY_REINFORCEMENT: &str =
    "The previous batch was too thin. Generate the full number requested and make \
     each proposal take a clearly different approach to the problem.";

#[derive(Debug, Deserialize)]
struct ProposalBatch {
    #[serde(default)]
    proposals: Vec<RawProposal>,
}

#[derive(Debug, Deserialize)]
struct RawProposal {
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

impl RawProposal {
    /// Proposals missing any of the three required fields are dropped.
    fn into_draft(self) -> Option<DraftProposal> {
        if self.title.trim().is_empty()
            || self.description.trim().is_empty()
            || self.rationale.trim().is_empty()
        {
            return None;
        }
        Some(DraftProposal {
            title: self.title.trim().to_string(),
            description: self.description,
            rationale: self.rationale,
            implementation_notes: self.implementation_notes,
            stakeholder_impacts: self.stakeholder_impacts,
        })
    }
}

/// What a generation pass produced.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub ids: Vec<ProposalId>,
    /// Fewer than half of the proposals mentioned the jurisdiction.
    pub localization_deficit: bool,
}

pub struct Generator {
    worker: std::sync::Arc<WorkerGateway>,
}

impl Generator {
    pub fn new(worker: std::sync::Arc<WorkerGateway>) -> Self {
        Self { worker }
    }

    /// Produce `n` proposals for the bundle. A thin first batch (fewer
    /// than half the requested count surviving validation) triggers one
    /// retry with an amplified diversity instruction.
    pub async fn generate(
        &self,
        bundle: &ContextBundle,
        n: u32,
        repo: &ProposalRepository,
        trace: &TraceStore,
        trace_id: &TraceId,
        parent_span: &SpanId,
    ) -> Result<GenerationOutcome, EngineError> {
        let started = chrono::Utc::now();
        let prompt = build_prompt(bundle, n);

        let result = self
            .worker
            .invoke(WorkerRole::Generation, &prompt, Some(GENERATION_SCHEMA))
            .await?;
        let mut drafts = parse_batch(&result);
        let mut retried = false;

        let minimum = n.div_ceil(2) as usize;
        if drafts.len() < minimum {
            retried = true;
            let retry_prompt = format!("{}\n\n{}", prompt, DIVERSITY_REINFORCEMENT);
            let retry = self
                .worker
                .invoke(WorkerRole::Generation, &retry_prompt, Some(GENERATION_SCHEMA))
                .await?;
            merge_drafts(&mut drafts, parse_batch(&retry), n as usize);
        }
        drafts.truncate(n as usize);

        if drafts.is_empty() {
            return Err(EngineError::NoProposals);
        }

        let ids: Vec<ProposalId> = drafts.into_iter().map(|d| repo.add_root(d)).collect();
        let localization_deficit = localization_deficit(bundle, &ids, repo);

        info!(
            count = ids.len(),
            localization_deficit, "generated initial proposals"
        );
        trace
            .record_span(
                trace_id,
                Some(parent_span),
                SpanType::Generation,
                AGENT_NAME,
                SpanOutput::default()
                    .started(started)
                    .with_input(prompt)
                    .with_output(format!("{} proposal(s)", ids.len()))
                    .with_model(result.model.clone())
                    .with_tokens(result.usage.clone())
                    .with_meta("localization_deficit", localization_deficit)
                    .with_meta("retried", retried),
            )
            .await?;

        Ok(GenerationOutcome { ids, localization_deficit })
    }
}

fn build_prompt(bundle: &ContextBundle, n: u32) -> String {
    let mut sections = vec![format!("Policy Query: {}", bundle.query.text())];

    let context_lines = bundle.jurisdiction.to_prompt_lines();
    if !context_lines.is_empty() {
        sections.push(format!("Local Context:\n{}", context_lines.join("\n")));
    }
    if !bundle.research.summary.is_empty() {
        sections.push(format!("Research Summary:\n{}", bundle.research.summary));
    }
    sections.push(format!(
        "Generate exactly {} diverse policy proposals grounded in this context.",
        n
    ));
    sections.join("\n\n")
}

fn parse_batch(result: &WorkerResult) -> Vec<DraftProposal> {
    let Some(structured) = result.structured.as_ref() else {
        return Vec::new();
    };
    let batch: ProposalBatch = match serde_json::from_value(structured.clone()) {
        Ok(batch) => batch,
        Err(_) => return Vec::new(),
    };
    batch
        .proposals
        .into_iter()
        .filter_map(RawProposal::into_draft)
        .collect()
}

/// Fold retry drafts in, skipping titles already present.
fn merge_drafts(drafts: &mut Vec<DraftProposal>, extra: Vec<DraftProposal>, cap: usize) {
    for draft in extra {
        if drafts.len() >= cap {
            break;
        }
        let duplicate = drafts.iter().any(|existing| {
            polis_types::proposal::normalize_title(&existing.title)
                == polis_types::proposal::normalize_title(&draft.title)
        });
        if !duplicate {
            drafts.push(draft);
        }
    }
}

/// True when fewer than half of the proposals mention the jurisdiction
/// identifier (case-insensitive substring). Skipped when no identifier
/// was supplied.
fn localization_deficit(
    bundle: &ContextBundle,
    ids: &[ProposalId],
    repo: &ProposalRepository,
) -> bool {
    let Some(place) = bundle.jurisdiction.jurisdiction.as_deref() else {
        return false;
    };
    let mentioning = ids
        .iter()
        .filter_map(|id| repo.get(id))
        .filter(|p| p.mentions(place))
        .count();
    mentioning * 2 < ids.len()
}
