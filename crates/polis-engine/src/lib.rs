//! The polis policy evolution engine.
//!
//! A generation–tournament–evolution loop over LLM-produced policy
//! proposals: the generator seeds an initial population, tournament
//! rounds rank it with Elo via pairwise comparisons, and the evolver
//! improves the leaders across bounded generations. Every step is
//! recorded in the trace store.

pub mod assembler;
pub mod elo;
pub mod error;
pub mod evolver;
pub mod generator;
pub mod orchestrator;
pub mod report;
pub mod repository;
pub mod tournament;

pub use assembler::ContextAssembler;
pub use error::{EngineError, RepositoryError};
pub use evolver::Evolver;
pub use generator::{GenerationOutcome, Generator};
pub use orchestrator::Orchestrator;
pub use report::{summary_request, RankingEntry, ReportHandoff};
pub use repository::{DraftProposal, ProposalRepository};
pub use tournament::{RoundOutcome, RoundState, TournamentScheduler};
