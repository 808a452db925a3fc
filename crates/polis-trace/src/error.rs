//! Trace store errors.

use polis_types::{SpanId, TraceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    /// The referenced trace was never started or has already ended.
    #[error("trace not open: {0}")]
    TraceNotOpen(TraceId),

    /// The parent span is not currently open on the same trace.
    #[error("invalid parent span: {0}")]
    SpanParentInvalid(SpanId),

    /// The span is unknown or already closed.
    #[error("span not open: {0}")]
    SpanNotOpen(SpanId),

    /// Spans must close in LIFO order per trace.
    #[error("span {0} closed out of order")]
    SpanCloseOrder(SpanId),

    /// File sink failure; fatal for the run.
    #[error("trace file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The on-disk file belongs to a different trace.
    #[error("trace file mismatch: expected {expected}, found {found}")]
    FileMismatch { expected: TraceId, found: TraceId },

    /// Relational sink failure; demoted to a warning by the store.
    #[error("relational sink error: {0}")]
    Relational(String),
}
