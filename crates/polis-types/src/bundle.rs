//! Research results and the per-request context bundle.

use crate::context::JurisdictionContext;
use crate::ids::BundleId;
use crate::query::PolicyQuery;
use serde::{Deserialize, Serialize};

/// One result from the search gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// The query that produced this hit.
    pub query: String,
    pub snippet: String,
    pub url: String,
    pub source: String,
}

/// Ordered search hits plus a synthesized summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchBundle {
    pub hits: Vec<SearchHit>,
    pub summary: String,
    /// True when any underlying search fell back to mock data.
    #[serde(default)]
    pub degraded: bool,
}

/// Immutable bundle handed to the generator and the report hand-off.
///
/// Constructed once by the context assembler and passed by ID across
/// components; prompt construction happens at the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub id: BundleId,
    pub query: PolicyQuery,
    pub jurisdiction: JurisdictionContext,
    pub research: ResearchBundle,
}

impl ContextBundle {
    pub fn new(
        query: PolicyQuery,
        jurisdiction: JurisdictionContext,
        research: ResearchBundle,
    ) -> Self {
        Self {
            id: BundleId::generate(),
            query,
            jurisdiction,
            research,
        }
    }

    /// Stable fingerprint of the query against this bundle's context.
    pub fn fingerprint(&self) -> String {
        self.query.fingerprint(&self.jurisdiction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_fingerprint_is_stable() {
        let mut jurisdiction = JurisdictionContext::default();
        jurisdiction.jurisdiction = Some("Elgin, Illinois".to_string());
        let bundle = ContextBundle::new(
            PolicyQuery::new("Ban on single-use plastic bags"),
            jurisdiction.clone(),
            ResearchBundle::default(),
        );
        let again = ContextBundle::new(
            PolicyQuery::new("ban on single-use plastic bags"),
            jurisdiction,
            ResearchBundle::default(),
        );
        assert_eq!(bundle.fingerprint(), again.fingerprint());
        assert_ne!(bundle.id, again.id);
    }
}
