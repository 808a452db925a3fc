//! Append-only NDJSON trace file sink.
//!
//! One trace header record followed by one record per span. The file is
//! self-describing and self-contained; reopening a store against an
//! existing file for the same trace resumes appending.

use super::TraceSink;
use crate::error::TraceError;
use crate::span::{Span, Trace, TraceFileRecord};
use async_trait::async_trait;
use polis_types::TraceId;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub struct FileTraceSink {
    trace_dir: PathBuf,
}

impl FileTraceSink {
    /// Sink writing one `<trace_id>.jsonl` file per trace under
    /// `trace_dir`.
    pub async fn new(trace_dir: impl Into<PathBuf>) -> Result<Self, TraceError> {
        let trace_dir = trace_dir.into();
        tokio::fs::create_dir_all(&trace_dir).await?;
        Ok(Self { trace_dir })
    }

    /// Where a given trace is persisted.
    pub fn path_for(&self, trace_id: &TraceId) -> PathBuf {
        self.trace_dir.join(format!("{}.jsonl", trace_id))
    }

    async fn append(&self, path: &Path, record: &TraceFileRecord) -> Result<(), TraceError> {
        let json = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// The trace id recorded in the file already on disk, if any.
    async fn existing_header(&self, path: &Path) -> Result<Option<TraceId>, TraceError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(path).await?;
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            return match serde_json::from_str::<TraceFileRecord>(line)? {
                TraceFileRecord::Trace(trace) => Ok(Some(trace.trace_id)),
                TraceFileRecord::Span(span) => Ok(Some(span.trace_id)),
            };
        }
        Ok(None)
    }
}

#[async_trait]
impl TraceSink for FileTraceSink {
    async fn write_header(&self, trace: &Trace) -> Result<(), TraceError> {
        let path = self.path_for(&trace.trace_id);
        match self.existing_header(&path).await? {
            Some(existing) if existing == trace.trace_id => {
                // Process restart against the same trace: keep the
                // existing header and resume appending spans.
                Ok(())
            }
            Some(existing) => Err(TraceError::FileMismatch {
                expected: trace.trace_id.clone(),
                found: existing,
            }),
            None => self.append(&path, &TraceFileRecord::Trace(trace.clone())).await,
        }
    }

    async fn write_span(&self, span: &Span) -> Result<(), TraceError> {
        let path = self.path_for(&span.trace_id);
        self.append(&path, &TraceFileRecord::Span(span.clone())).await
    }

    async fn finalize(&self, _trace: &Trace) -> Result<(), TraceError> {
        // Every record is flushed as it is appended.
        Ok(())
    }

    fn is_critical(&self) -> bool {
        true
    }
}
