//! HTTP search provider for Brave-compatible web search APIs.

use super::SearchProvider;
use crate::error::SearchError;
use async_trait::async_trait;
use polis_types::SearchHit;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct WebResult {
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebResults {
    #[serde(default)]
    results: Vec<WebResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    web: Option<WebResults>,
}

/// Provider for a Brave-style search endpoint.
pub struct HttpSearchProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    name: String,
}

impl HttpSearchProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        name: impl Into<String>,
    ) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| SearchError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            name: name.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let mut builder = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("count", &max_results.to_string())]);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.header("X-Subscription-Token", key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SearchError::Transport(format!("search request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SearchError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SearchError::Status { code: status.as_u16(), message });
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Transport(format!("invalid search response: {}", e)))?;

        let hits = body
            .web
            .map(|web| web.results)
            .unwrap_or_default()
            .into_iter()
            .take(max_results)
            .filter_map(|result| {
                let description = result.description?;
                let url = result.url?;
                let snippet = match result.title {
                    Some(title) => format!("{}: {}", title, description),
                    None => description,
                };
                Some(SearchHit {
                    query: query.to_string(),
                    snippet,
                    url,
                    source: self.name.clone(),
                })
            })
            .collect();

        Ok(hits)
    }
}
