//! Engine errors.

use polis_gateway::WorkerError;
use polis_trace::TraceError;
use polis_types::{ConfigError, ProposalId};
use thiserror::Error;

/// Invariant violations in the proposal repository. These are fatal.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("unknown proposal: {0}")]
    UnknownProposal(ProposalId),

    #[error("unknown parent proposal: {0}")]
    UnknownParent(ProposalId),

    #[error("duplicate proposal id: {0}")]
    DuplicateId(ProposalId),
}

/// Top-level engine failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("generation produced no usable proposals")]
    NoProposals,
}
