//! Hierarchical trace persistence.
//!
//! Every component operation in a run is recorded as a span under a
//! single trace. The store enforces parent/child and ordering
//! invariants and fans records out to dual sinks: an append-only NDJSON
//! file (failures are fatal) and a best-effort relational sink
//! (failures are demoted to warnings).

pub mod error;
pub mod sink;
pub mod span;
pub mod store;

pub use error::TraceError;
pub use sink::{FileTraceSink, PgTraceSink, TraceSink};
pub use span::{read_trace_file, Span, SpanOutput, SpanType, Trace, TraceMeta};
pub use store::TraceStore;
