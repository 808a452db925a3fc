//! Gateway error types.

use thiserror::Error;

/// Severity classification for a failed worker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorKind {
    /// Network error, 5xx, or timeout; retried with backoff.
    Transient,
    /// 429 / quota exhaustion; never retried, the caller decides policy.
    RateLimited,
    /// The response violated the requested schema; retried once with a
    /// reinforced instruction.
    Malformed,
    /// Authentication failure or other unrecoverable 4xx.
    Fatal,
}

impl std::fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerErrorKind::Transient => write!(f, "transient"),
            WorkerErrorKind::RateLimited => write!(f, "rate_limited"),
            WorkerErrorKind::Malformed => write!(f, "malformed"),
            WorkerErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Surfaced once the gateway's retry budget is exhausted.
#[derive(Debug, Clone, Error)]
#[error("worker call failed ({kind}) after {attempts} attempt(s): {last_message}")]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub attempts: u32,
    pub last_message: String,
}

impl WorkerError {
    pub fn is_rate_limited(&self) -> bool {
        self.kind == WorkerErrorKind::RateLimited
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == WorkerErrorKind::Fatal
    }
}

/// Raw failure reported by a worker backend, before classification.
#[derive(Debug, Clone, Error)]
pub enum WorkerFailure {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("hard timeout exceeded")]
    Timeout,
}

impl WorkerFailure {
    /// Map a backend failure onto the retry classification.
    pub fn kind(&self) -> WorkerErrorKind {
        match self {
            WorkerFailure::Transport(_) | WorkerFailure::Timeout => WorkerErrorKind::Transient,
            WorkerFailure::Status { code: 429, .. } => WorkerErrorKind::RateLimited,
            WorkerFailure::Status { code, .. } if *code >= 500 => WorkerErrorKind::Transient,
            WorkerFailure::Status { .. } => WorkerErrorKind::Fatal,
            WorkerFailure::InvalidResponse(_) => WorkerErrorKind::Malformed,
        }
    }
}

/// Failures from a search provider.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("search transport error: {0}")]
    Transport(String),

    #[error("search rate limited")]
    RateLimited,

    #[error("search status {code}: {message}")]
    Status { code: u16, message: String },
}
