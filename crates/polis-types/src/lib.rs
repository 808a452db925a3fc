//! Shared domain types for the polis policy-analysis engine.
//!
//! Everything that crosses a crate boundary lives here: identifiers,
//! the policy query and jurisdiction context, proposals and comparison
//! records, research bundles, and engine configuration.

pub mod bundle;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod proposal;
pub mod query;
pub mod usage;

pub use bundle::{ContextBundle, ResearchBundle, SearchHit};
pub use config::EngineConfig;
pub use context::{FieldOutcome, JurisdictionContext};
pub use error::ConfigError;
pub use ids::{BundleId, ProposalId, SpanId, TraceId};
pub use proposal::{
    canonical_pair, ComparisonOutcome, ComparisonRecord, Proposal, WorkerMeta, INITIAL_ELO,
};
pub use query::{PolicyQuery, PolicyType};
pub use usage::TokenUsage;
