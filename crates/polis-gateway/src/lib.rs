//! Gateways to external capabilities.
//!
//! The worker gateway gives every component a uniform, retrying,
//! concurrency-bounded interface to an LLM backend. The search gateway
//! wraps web-search providers and degrades to deterministic mock hits so
//! that runs complete offline.

pub mod error;
pub mod search;
pub mod worker;

pub use error::{SearchError, WorkerError, WorkerErrorKind, WorkerFailure};
pub use search::{
    mock_hits, FailingSearchProvider, HttpSearchProvider, SearchGateway, SearchOutcome,
    SearchProvider,
};
pub use worker::{
    HttpWorkerBackend, LexicalJudgeWorker, ScriptedWorker, WorkerBackend, WorkerGateway,
    WorkerGatewayConfig, WorkerRequest, WorkerResponse, WorkerResult, WorkerRole,
};
