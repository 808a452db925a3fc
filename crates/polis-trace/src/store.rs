//! The trace store: span lifecycle, invariants, and sink fan-out.

use crate::error::TraceError;
use crate::sink::TraceSink;
use crate::span::{aggregate, Span, SpanOutput, SpanType, Trace, TraceMeta};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use polis_types::{SpanId, TraceId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

struct OpenSpan {
    parent_span_id: Option<SpanId>,
    span_type: SpanType,
    agent_name: String,
    started_at: DateTime<Utc>,
}

struct TraceState {
    trace: Trace,
    /// Currently-open spans, newest last. Closes must match the top.
    stack: Vec<SpanId>,
    open: HashMap<SpanId, OpenSpan>,
    closed: Vec<Span>,
}

#[derive(Default)]
struct StoreState {
    traces: HashMap<TraceId, TraceState>,
    span_index: HashMap<SpanId, TraceId>,
}

/// Process-scoped span recorder with explicit lifecycle.
///
/// The store is created by the orchestrator, passed by reference through
/// the call graph, and closed at the end of the run; it is never ambient
/// state. No lock is held across a sink write.
pub struct TraceStore {
    state: Mutex<StoreState>,
    sinks: Vec<Arc<dyn TraceSink>>,
}

impl TraceStore {
    /// A store with the given sinks; an empty list disables persistence
    /// but keeps invariant checking.
    pub fn with_sinks(sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            sinks,
        }
    }

    /// A store that records nothing to disk.
    pub fn disabled() -> Self {
        Self::with_sinks(Vec::new())
    }

    /// Begin a new trace and emit its header record.
    pub async fn start_trace(&self, meta: TraceMeta) -> Result<TraceId, TraceError> {
        let trace_id = TraceId::generate();
        let trace = Trace {
            trace_id: trace_id.clone(),
            policy_query: meta.policy_query,
            policy_type: meta.policy_type,
            created_at: Utc::now(),
            agent_count: 0,
            total_duration_ms: 0,
            external_trace_id: meta.external_trace_id,
            metadata: meta.metadata,
        };

        {
            let mut state = self.state.lock();
            state.traces.insert(
                trace_id.clone(),
                TraceState {
                    trace: trace.clone(),
                    stack: Vec::new(),
                    open: HashMap::new(),
                    closed: Vec::new(),
                },
            );
        }

        self.sink_header(&trace).await?;
        Ok(trace_id)
    }

    /// Open a span. The parent, when given, must be a currently-open
    /// span on the same trace.
    pub fn open_span(
        &self,
        trace_id: &TraceId,
        parent_span_id: Option<&SpanId>,
        span_type: SpanType,
        agent_name: &str,
    ) -> Result<SpanId, TraceError> {
        let mut state = self.state.lock();
        let trace = state
            .traces
            .get_mut(trace_id)
            .ok_or_else(|| TraceError::TraceNotOpen(trace_id.clone()))?;

        if let Some(parent) = parent_span_id {
            if !trace.open.contains_key(parent) {
                return Err(TraceError::SpanParentInvalid(parent.clone()));
            }
        }

        let span_id = SpanId::generate();
        trace.open.insert(
            span_id.clone(),
            OpenSpan {
                parent_span_id: parent_span_id.cloned(),
                span_type,
                agent_name: agent_name.to_string(),
                started_at: Utc::now(),
            },
        );
        trace.stack.push(span_id.clone());
        state.span_index.insert(span_id.clone(), trace_id.clone());
        Ok(span_id)
    }

    /// Close the span and persist it. Spans close in LIFO order per
    /// trace; anything else is rejected.
    pub async fn close_span(
        &self,
        span_id: &SpanId,
        output: SpanOutput,
    ) -> Result<Span, TraceError> {
        let span = {
            let mut state = self.state.lock();
            let trace_id = state
                .span_index
                .get(span_id)
                .cloned()
                .ok_or_else(|| TraceError::SpanNotOpen(span_id.clone()))?;
            let trace = state
                .traces
                .get_mut(&trace_id)
                .ok_or_else(|| TraceError::TraceNotOpen(trace_id.clone()))?;

            if !trace.open.contains_key(span_id) {
                return Err(TraceError::SpanNotOpen(span_id.clone()));
            }
            if trace.stack.last() != Some(span_id) {
                return Err(TraceError::SpanCloseOrder(span_id.clone()));
            }

            trace.stack.pop();
            let open = trace.open.remove(span_id).expect("span presence checked above");
            let span = finish_span(&trace_id, span_id.clone(), open, output, false);
            trace.closed.push(span.clone());
            state.span_index.remove(span_id);
            span
        };

        self.sink_span(&span).await?;
        Ok(span)
    }

    /// Record a complete span in one step, for operations whose timing
    /// is known only at completion (worker interactions). The span is
    /// opened and closed atomically under the current stack top, so LIFO
    /// ordering is preserved by construction.
    pub async fn record_span(
        &self,
        trace_id: &TraceId,
        parent_span_id: Option<&SpanId>,
        span_type: SpanType,
        agent_name: &str,
        output: SpanOutput,
    ) -> Result<SpanId, TraceError> {
        let span = {
            let mut state = self.state.lock();
            let trace = state
                .traces
                .get_mut(trace_id)
                .ok_or_else(|| TraceError::TraceNotOpen(trace_id.clone()))?;

            if let Some(parent) = parent_span_id {
                if !trace.open.contains_key(parent) {
                    return Err(TraceError::SpanParentInvalid(parent.clone()));
                }
            }

            let span_id = SpanId::generate();
            let started_at = output.started_at.unwrap_or_else(Utc::now);
            let open = OpenSpan {
                parent_span_id: parent_span_id.cloned(),
                span_type,
                agent_name: agent_name.to_string(),
                started_at,
            };
            let span = finish_span(trace_id, span_id, open, output, false);
            trace.closed.push(span.clone());
            span
        };

        self.sink_span(&span).await?;
        Ok(span.span_id)
    }

    /// Record a warning span.
    pub async fn warning(
        &self,
        trace_id: &TraceId,
        parent_span_id: Option<&SpanId>,
        agent_name: &str,
        message: impl Into<String>,
    ) -> Result<SpanId, TraceError> {
        let message = message.into();
        warn!(trace_id = %trace_id, agent = agent_name, "{}", message);
        self.record_span(
            trace_id,
            parent_span_id,
            SpanType::Warning,
            agent_name,
            SpanOutput::default().with_output(message),
        )
        .await
    }

    /// End the trace. Spans still open are force-closed (top of stack
    /// first) with a `forced` marker and a warning.
    pub async fn end_trace(&self, trace_id: &TraceId) -> Result<Trace, TraceError> {
        let (trace, forced) = {
            let mut state = self.state.lock();
            let mut trace_state = state
                .traces
                .remove(trace_id)
                .ok_or_else(|| TraceError::TraceNotOpen(trace_id.clone()))?;

            let mut forced = Vec::new();
            while let Some(span_id) = trace_state.stack.pop() {
                let open = trace_state
                    .open
                    .remove(&span_id)
                    .expect("stack entries are always open");
                state.span_index.remove(&span_id);
                warn!(trace_id = %trace_id, span_id = %span_id, "force-closing span left open at end of trace");
                let output = SpanOutput::default().with_meta("forced", true);
                let span = finish_span(trace_id, span_id, open, output, true);
                trace_state.closed.push(span.clone());
                forced.push(span);
            }

            let (agent_count, total_duration_ms) = aggregate(&trace_state.closed);
            let mut trace = trace_state.trace;
            trace.agent_count = agent_count;
            trace.total_duration_ms = total_duration_ms;
            (trace, forced)
        };

        for span in &forced {
            self.sink_span(span).await?;
        }
        self.sink_finalize(&trace).await?;
        Ok(trace)
    }

    /// Whether a span is still open (used to discard results of
    /// cancelled work).
    pub fn is_open(&self, span_id: &SpanId) -> bool {
        let state = self.state.lock();
        state
            .span_index
            .get(span_id)
            .and_then(|trace_id| state.traces.get(trace_id))
            .map(|trace| trace.open.contains_key(span_id))
            .unwrap_or(false)
    }

    async fn sink_header(&self, trace: &Trace) -> Result<(), TraceError> {
        for sink in &self.sinks {
            if let Err(err) = sink.write_header(trace).await {
                if sink.is_critical() {
                    return Err(err);
                }
                warn!(error = %err, "trace sink rejected header write");
            }
        }
        Ok(())
    }

    async fn sink_span(&self, span: &Span) -> Result<(), TraceError> {
        for sink in &self.sinks {
            if let Err(err) = sink.write_span(span).await {
                if sink.is_critical() {
                    return Err(err);
                }
                warn!(error = %err, span_id = %span.span_id, "trace sink rejected span write");
            }
        }
        Ok(())
    }

    async fn sink_finalize(&self, trace: &Trace) -> Result<(), TraceError> {
        for sink in &self.sinks {
            if let Err(err) = sink.finalize(trace).await {
                if sink.is_critical() {
                    return Err(err);
                }
                warn!(error = %err, "trace sink rejected finalize");
            }
        }
        Ok(())
    }
}

fn finish_span(
    trace_id: &TraceId,
    span_id: SpanId,
    open: OpenSpan,
    output: SpanOutput,
    forced: bool,
) -> Span {
    let ended_at = Utc::now();
    let started_at = open.started_at.min(ended_at);
    let mut metadata = output.metadata;
    if forced {
        metadata.insert("forced".to_string(), Value::Bool(true));
    }
    Span {
        span_id,
        trace_id: trace_id.clone(),
        parent_span_id: open.parent_span_id,
        span_type: open.span_type,
        agent_name: open.agent_name,
        started_at,
        ended_at,
        duration_ms: (ended_at - started_at).num_milliseconds(),
        input_text: output.input_text,
        output_text: output.output_text,
        model: output.model,
        tokens_used: output.tokens_used,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polis_types::PolicyType;

    fn meta() -> TraceMeta {
        TraceMeta::new("Ban on single-use plastic bags", PolicyType::Evolution)
    }

    #[tokio::test]
    async fn spans_nest_and_close_in_lifo_order() {
        let store = TraceStore::disabled();
        let trace_id = store.start_trace(meta()).await.unwrap();

        let root = store
            .open_span(&trace_id, None, SpanType::Run, "orchestrator")
            .unwrap();
        let child = store
            .open_span(&trace_id, Some(&root), SpanType::Generation, "generator")
            .unwrap();

        // Parent cannot close while the child is open.
        let err = store.close_span(&root, SpanOutput::default()).await.unwrap_err();
        assert!(matches!(err, TraceError::SpanCloseOrder(_)));

        store.close_span(&child, SpanOutput::default()).await.unwrap();
        store.close_span(&root, SpanOutput::default()).await.unwrap();

        let trace = store.end_trace(&trace_id).await.unwrap();
        assert_eq!(trace.agent_count, 2);
    }

    #[tokio::test]
    async fn parent_must_be_open_on_same_trace() {
        let store = TraceStore::disabled();
        let trace_id = store.start_trace(meta()).await.unwrap();

        let root = store
            .open_span(&trace_id, None, SpanType::Run, "orchestrator")
            .unwrap();
        store.close_span(&root, SpanOutput::default()).await.unwrap();

        let err = store
            .open_span(&trace_id, Some(&root), SpanType::Generation, "generator")
            .unwrap_err();
        assert!(matches!(err, TraceError::SpanParentInvalid(_)));
    }

    #[tokio::test]
    async fn closing_twice_fails() {
        let store = TraceStore::disabled();
        let trace_id = store.start_trace(meta()).await.unwrap();
        let span = store
            .open_span(&trace_id, None, SpanType::Run, "orchestrator")
            .unwrap();

        store.close_span(&span, SpanOutput::default()).await.unwrap();
        let err = store.close_span(&span, SpanOutput::default()).await.unwrap_err();
        assert!(matches!(err, TraceError::SpanNotOpen(_)));
    }

    #[tokio::test]
    async fn end_trace_force_closes_open_spans() {
        let store = TraceStore::disabled();
        let trace_id = store.start_trace(meta()).await.unwrap();
        let root = store
            .open_span(&trace_id, None, SpanType::Run, "orchestrator")
            .unwrap();
        let _child = store
            .open_span(&trace_id, Some(&root), SpanType::Round, "tournament")
            .unwrap();

        let trace = store.end_trace(&trace_id).await.unwrap();
        assert_eq!(trace.agent_count, 2);
        assert!(!store.is_open(&root));
    }

    #[tokio::test]
    async fn record_span_respects_parent_check() {
        let store = TraceStore::disabled();
        let trace_id = store.start_trace(meta()).await.unwrap();

        let bogus = SpanId::new("span_missing");
        let err = store
            .record_span(
                &trace_id,
                Some(&bogus),
                SpanType::Comparison,
                "tournament",
                SpanOutput::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::SpanParentInvalid(_)));
    }

    #[tokio::test]
    async fn span_interval_is_contained_by_parent() {
        let store = TraceStore::disabled();
        let trace_id = store.start_trace(meta()).await.unwrap();
        let root = store
            .open_span(&trace_id, None, SpanType::Run, "orchestrator")
            .unwrap();
        let child = store
            .open_span(&trace_id, Some(&root), SpanType::Generation, "generator")
            .unwrap();

        let child_span = store.close_span(&child, SpanOutput::default()).await.unwrap();
        let root_span = store.close_span(&root, SpanOutput::default()).await.unwrap();

        assert!(root_span.started_at <= child_span.started_at);
        assert!(root_span.ended_at >= child_span.ended_at);
        assert!(child_span.ended_at >= child_span.started_at);
    }
}
