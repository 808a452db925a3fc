//! Web-search gateway with graceful degradation.
//!
//! The gateway tries a primary provider, falls back to a secondary on
//! rate limits or transport failures, and finally serves deterministic
//! mock hits so that offline and test runs keep moving. Callers must
//! propagate the `degraded` marker into the trace.

mod http;

pub use http::HttpSearchProvider;

use crate::error::SearchError;
use async_trait::async_trait;
use polis_types::SearchHit;
use std::sync::Arc;
use tracing::warn;

/// A web-search capability.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<SearchHit>, SearchError>;
}

/// Result of a gateway search, marking whether mock data was served.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub degraded: bool,
}

/// Primary/secondary provider chain with a mock floor.
pub struct SearchGateway {
    primary: Option<Arc<dyn SearchProvider>>,
    secondary: Option<Arc<dyn SearchProvider>>,
}

impl SearchGateway {
    pub fn new(
        primary: Option<Arc<dyn SearchProvider>>,
        secondary: Option<Arc<dyn SearchProvider>>,
    ) -> Self {
        Self { primary, secondary }
    }

    /// A gateway with no live providers; every search is degraded.
    pub fn offline() -> Self {
        Self { primary: None, secondary: None }
    }

    pub async fn search(&self, query: &str, max_results: usize) -> SearchOutcome {
        if let Some(primary) = &self.primary {
            match primary.search(query, max_results).await {
                Ok(hits) => return SearchOutcome { hits, degraded: false },
                Err(err) => {
                    warn!(query, error = %err, "primary search provider failed");
                }
            }
        }

        if let Some(secondary) = &self.secondary {
            match secondary.search(query, max_results).await {
                Ok(hits) => return SearchOutcome { hits, degraded: false },
                Err(err) => {
                    warn!(query, error = %err, "secondary search provider failed");
                }
            }
        }

        SearchOutcome {
            hits: mock_hits(query, max_results),
            degraded: true,
        }
    }
}

/// Deterministic placeholder hits derived from the query text.
pub fn mock_hits(query: &str, max_results: usize) -> Vec<SearchHit> {
    let templates = [
        (
            format!("{} - Implementation Guide", query),
            format!(
                "A comprehensive overview of {} implementation strategies for local governments.",
                query
            ),
            "https://example.com/implementation-guide",
        ),
        (
            format!("Case Study: {} in Similar Jurisdictions", query),
            format!("Analysis of municipalities that have implemented {} policies.", query),
            "https://example.com/case-study",
        ),
        (
            format!("Economic Impact Assessment of {}", query),
            format!("Research on the economic effects of {} on businesses and consumers.", query),
            "https://example.com/economic-impact",
        ),
    ];

    templates
        .into_iter()
        .take(max_results)
        .map(|(title, snippet, url)| SearchHit {
            query: query.to_string(),
            snippet: format!("{}: {}", title, snippet),
            url: url.to_string(),
            source: "mock".to_string(),
        })
        .collect()
}

/// Provider that always fails; useful for exercising degradation.
pub struct FailingSearchProvider;

#[async_trait]
impl SearchProvider for FailingSearchProvider {
    async fn search(
        &self,
        _query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        Err(SearchError::RateLimited)
    }
}
