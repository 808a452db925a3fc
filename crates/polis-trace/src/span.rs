//! Span and trace records.

use crate::error::TraceError;
use chrono::{DateTime, Utc};
use polis_types::{PolicyType, SpanId, TokenUsage, TraceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;

/// What kind of operation a span covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    /// Root span of a run.
    Run,
    /// Context bundle assembly.
    Context,
    /// A web-search call.
    Search,
    /// Initial proposal generation.
    Generation,
    /// One tournament round.
    Round,
    /// One pairwise comparison.
    Comparison,
    /// One proposal evolution.
    Evolution,
    /// Executive-summary synthesis for the report hand-off.
    Synthesis,
    /// Final report hand-off.
    Report,
    /// A recorded warning.
    Warning,
}

impl std::fmt::Display for SpanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpanType::Run => "run",
            SpanType::Context => "context",
            SpanType::Search => "search",
            SpanType::Generation => "generation",
            SpanType::Round => "round",
            SpanType::Comparison => "comparison",
            SpanType::Evolution => "evolution",
            SpanType::Synthesis => "synthesis",
            SpanType::Report => "report",
            SpanType::Warning => "warning",
        };
        write!(f, "{}", name)
    }
}

/// A timed record of one component operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    pub span_type: SpanType,
    pub agent_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub input_text: Option<String>,
    pub output_text: Option<String>,
    pub model: Option<String>,
    pub tokens_used: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Fields supplied when a span closes (or is recorded whole).
#[derive(Debug, Clone, Default)]
pub struct SpanOutput {
    pub input_text: Option<String>,
    pub output_text: Option<String>,
    pub model: Option<String>,
    pub tokens_used: Option<TokenUsage>,
    pub metadata: Map<String, Value>,
    /// Backdated start for spans recorded after the fact.
    pub started_at: Option<DateTime<Utc>>,
}

impl SpanOutput {
    pub fn with_output(mut self, text: impl Into<String>) -> Self {
        self.output_text = Some(text.into());
        self
    }

    pub fn with_input(mut self, text: impl Into<String>) -> Self {
        self.input_text = Some(text.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tokens(mut self, usage: TokenUsage) -> Self {
        self.tokens_used = Some(usage);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }
}

/// Root record aggregating all spans of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: TraceId,
    pub policy_query: String,
    pub policy_type: PolicyType,
    pub created_at: DateTime<Utc>,
    pub agent_count: u32,
    pub total_duration_ms: i64,
    pub external_trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Inputs for starting a trace.
#[derive(Debug, Clone)]
pub struct TraceMeta {
    pub policy_query: String,
    pub policy_type: PolicyType,
    pub external_trace_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl TraceMeta {
    pub fn new(policy_query: impl Into<String>, policy_type: PolicyType) -> Self {
        Self {
            policy_query: policy_query.into(),
            policy_type,
            external_trace_id: None,
            metadata: Map::new(),
        }
    }
}

/// One line of the NDJSON trace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TraceFileRecord {
    Trace(Trace),
    Span(Span),
}

/// Read a trace file back into its trace header and span set.
///
/// The header's aggregate fields (`agent_count`, `total_duration_ms`)
/// are derived from the span records, so a file written during a run
/// that ended cleanly reads back identical to the final trace.
pub fn read_trace_file(path: &Path) -> Result<(Trace, Vec<Span>), TraceError> {
    let contents = std::fs::read_to_string(path)?;
    let mut header: Option<Trace> = None;
    let mut spans = Vec::new();

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TraceFileRecord>(line)? {
            TraceFileRecord::Trace(trace) => header = Some(trace),
            TraceFileRecord::Span(span) => spans.push(span),
        }
    }

    let mut trace = header.ok_or_else(|| {
        TraceError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "trace file has no header record",
        ))
    })?;
    let (agent_count, total_duration_ms) = aggregate(&spans);
    trace.agent_count = agent_count;
    trace.total_duration_ms = total_duration_ms;
    Ok((trace, spans))
}

/// Aggregate span-derived trace fields.
pub fn aggregate(spans: &[Span]) -> (u32, i64) {
    let agents: BTreeSet<&str> = spans.iter().map(|s| s.agent_name.as_str()).collect();
    let total: i64 = spans.iter().map(|s| s.duration_ms).sum();
    (agents.len() as u32, total)
}
