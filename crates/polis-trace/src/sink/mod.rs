//! Trace sinks.
//!
//! A sink receives the trace header once, every span as it closes, and
//! a finalize call with the completed trace. The file sink is critical:
//! its failures abort the run. The relational sink is best-effort.

mod db;
mod file;

pub use db::PgTraceSink;
pub use file::FileTraceSink;

use crate::error::TraceError;
use crate::span::{Span, Trace};
use async_trait::async_trait;

/// Destination for trace records.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn write_header(&self, trace: &Trace) -> Result<(), TraceError>;

    async fn write_span(&self, span: &Span) -> Result<(), TraceError>;

    async fn finalize(&self, trace: &Trace) -> Result<(), TraceError>;

    /// Critical sinks abort the run on failure; others are demoted to
    /// warnings by the store.
    fn is_critical(&self) -> bool {
        false
    }
}
