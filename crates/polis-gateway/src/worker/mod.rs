//! Uniform request/response interface to an LLM worker capability.
//!
//! Components never talk to a model directly; they go through
//! [`WorkerGateway::invoke`], which owns retries, failure classification,
//! timeouts, and the in-flight concurrency bound.

mod extract;
mod http;
mod stub;

pub use http::HttpWorkerBackend;
pub use stub::{LexicalJudgeWorker, ScriptedWorker};

use crate::error::{WorkerError, WorkerErrorKind, WorkerFailure};
use async_trait::async_trait;
use polis_types::TokenUsage;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_CAP_MS: u64 = 30_000;
const MAX_TRANSIENT_ATTEMPTS: u32 = 3;

const REINFORCED_INSTRUCTION: &str =
    "Respond with ONLY a single JSON object matching the requested schema. \
     Do not include any prose before or after it.";

/// The task a worker call is performing; selects system instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Generation,
    Comparison,
    Evolution,
    Synthesis,
}

impl WorkerRole {
    /// System instructions sent with every request for this role.
    pub fn instructions(&self) -> &'static str {
        match self {
            WorkerRole::Generation => {
                "Generate innovative, practical policy proposals for a local government \
                 on the given topic. Each proposal needs a clear title, a detailed \
                 description, a strong rationale, and implementation notes. Make the \
                 proposals diverse in approach and grounded in the supplied local context."
            }
            WorkerRole::Comparison => {
                "Compare two policy proposals and decide which is more effective and \
                 equitable overall. Weigh environmental impact, economic feasibility, \
                 social equity, implementation complexity, and stakeholder acceptance. \
                 Identify the winning proposal by its full title and give a one-paragraph \
                 rationale."
            }
            WorkerRole::Evolution => {
                "Improve the given policy proposal while preserving its core intent. \
                 Enumerate the specific changes you made, then present the improved \
                 proposal with a title, description, rationale, and implementation notes."
            }
            WorkerRole::Synthesis => {
                "Summarize the strongest policy options into a concise executive \
                 overview for a local-government audience."
            }
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Generation => write!(f, "generation"),
            WorkerRole::Comparison => write!(f, "comparison"),
            WorkerRole::Evolution => write!(f, "evolution"),
            WorkerRole::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// A single request handed to a backend.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub role: WorkerRole,
    pub prompt: String,
    /// Extra schema guidance appended to the system instructions.
    pub schema_hint: Option<String>,
}

/// Raw backend response before structured extraction.
#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub text: String,
    pub model: String,
    pub response_id: Option<String>,
    pub usage: TokenUsage,
}

/// Final result of a gateway invocation.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    /// Parsed structured payload, present when a schema hint was supplied.
    pub structured: Option<Value>,
    pub raw_text: String,
    pub model: String,
    pub response_id: Option<String>,
    pub usage: TokenUsage,
}

/// An LLM capability the gateway can drive.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn complete(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerFailure>;
}

/// Gateway tunables; defaults match the engine configuration.
#[derive(Debug, Clone)]
pub struct WorkerGatewayConfig {
    pub max_inflight: u32,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
}

impl Default for WorkerGatewayConfig {
    fn default() -> Self {
        Self {
            max_inflight: 4,
            soft_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_secs(120),
        }
    }
}

/// Blocking, retrying front door to a [`WorkerBackend`].
pub struct WorkerGateway {
    backend: Arc<dyn WorkerBackend>,
    semaphore: Arc<Semaphore>,
    config: WorkerGatewayConfig,
}

impl WorkerGateway {
    pub fn new(backend: Arc<dyn WorkerBackend>, config: WorkerGatewayConfig) -> Self {
        let permits = config.max_inflight.max(1) as usize;
        Self {
            backend,
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
        }
    }

    /// Invoke the worker and block until completion or classified failure.
    ///
    /// Transient failures are retried with exponential backoff; a schema
    /// violation is retried once with a reinforced instruction; rate
    /// limits and fatal errors surface immediately.
    pub async fn invoke(
        &self,
        role: WorkerRole,
        prompt: &str,
        schema_hint: Option<&str>,
    ) -> Result<WorkerResult, WorkerError> {
        let mut request = WorkerRequest {
            role,
            prompt: prompt.to_string(),
            schema_hint: schema_hint.map(str::to_string),
        };

        let mut attempts = 0u32;
        let mut transient_attempts = 0u32;
        let mut reinforced = false;

        loop {
            attempts += 1;
            let outcome = self.call_once(&request).await;

            let failure = match outcome {
                Ok(response) => {
                    match self.finish(&request, response) {
                        Ok(result) => return Ok(result),
                        Err(failure) => failure,
                    }
                }
                Err(failure) => failure,
            };

            let kind = failure.kind();
            match kind {
                WorkerErrorKind::Transient => {
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(WorkerError {
                            kind,
                            attempts,
                            last_message: failure.to_string(),
                        });
                    }
                    let delay = backoff_delay(transient_attempts);
                    debug!(
                        role = %request.role,
                        attempt = transient_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient worker failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                WorkerErrorKind::Malformed => {
                    if reinforced {
                        return Err(WorkerError {
                            kind,
                            attempts,
                            last_message: failure.to_string(),
                        });
                    }
                    reinforced = true;
                    warn!(role = %request.role, "malformed worker output, retrying with reinforced instruction");
                    let hint = match request.schema_hint.take() {
                        Some(hint) => format!("{}\n\n{}", hint, REINFORCED_INSTRUCTION),
                        None => REINFORCED_INSTRUCTION.to_string(),
                    };
                    request.schema_hint = Some(hint);
                }
                WorkerErrorKind::RateLimited | WorkerErrorKind::Fatal => {
                    return Err(WorkerError {
                        kind,
                        attempts,
                        last_message: failure.to_string(),
                    });
                }
            }
        }
    }

    /// One backend call under the semaphore, with soft and hard timeouts.
    async fn call_once(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerFailure> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerFailure::Transport("worker semaphore closed".into()))?;

        let soft = self.config.soft_timeout;
        let role = request.role;
        let guarded = async {
            let call = self.backend.complete(request);
            tokio::pin!(call);
            match tokio::time::timeout(soft, &mut call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(role = %role, "worker call exceeded soft timeout, still waiting");
                    call.await
                }
            }
        };

        let result = match tokio::time::timeout(self.config.hard_timeout, guarded).await {
            Ok(result) => result,
            Err(_) => Err(WorkerFailure::Timeout),
        };
        drop(permit);
        result
    }

    /// Apply structured extraction when a schema hint was supplied.
    fn finish(
        &self,
        request: &WorkerRequest,
        response: WorkerResponse,
    ) -> Result<WorkerResult, WorkerFailure> {
        let structured = if request.schema_hint.is_some() {
            match extract::first_json_block(&response.text) {
                Some(value) => Some(value),
                None => {
                    return Err(WorkerFailure::InvalidResponse(
                        "no structured block found in worker output".into(),
                    ));
                }
            }
        } else {
            None
        };

        Ok(WorkerResult {
            structured,
            raw_text: response.text,
            model: response.model,
            response_id: response.response_id,
            usage: response.usage,
        })
    }
}

fn backoff_delay(transient_attempts: u32) -> Duration {
    let exp = BACKOFF_FACTOR.saturating_pow(transient_attempts.saturating_sub(1));
    let ms = BACKOFF_BASE_MS.saturating_mul(exp as u64).min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct FailingBackend {
        failures: Mutex<VecDeque<WorkerFailure>>,
        then: Option<WorkerResponse>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl WorkerBackend for FailingBackend {
        async fn complete(
            &self,
            _request: &WorkerRequest,
        ) -> Result<WorkerResponse, WorkerFailure> {
            *self.calls.lock() += 1;
            if let Some(failure) = self.failures.lock().pop_front() {
                return Err(failure);
            }
            match &self.then {
                Some(response) => Ok(response.clone()),
                None => Err(WorkerFailure::Transport("exhausted".into())),
            }
        }
    }

    fn response(text: &str) -> WorkerResponse {
        WorkerResponse {
            text: text.to_string(),
            model: "stub".to_string(),
            response_id: Some("resp-1".to_string()),
            usage: TokenUsage::default(),
        }
    }

    fn gateway(backend: FailingBackend) -> (Arc<FailingBackend>, WorkerGateway) {
        let backend = Arc::new(backend);
        let gw = WorkerGateway::new(backend.clone(), WorkerGatewayConfig::default());
        (backend, gw)
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(10), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let (backend, gw) = gateway(FailingBackend {
            failures: Mutex::new(VecDeque::from([
                WorkerFailure::Transport("reset".into()),
                WorkerFailure::Status { code: 502, message: "bad gateway".into() },
            ])),
            then: Some(response("all good")),
            calls: Mutex::new(0),
        });

        let result = gw.invoke(WorkerRole::Synthesis, "summarize", None).await.unwrap();
        assert_eq!(result.raw_text, "all good");
        assert_eq!(*backend.calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_budget_is_three_attempts() {
        let (backend, gw) = gateway(FailingBackend {
            failures: Mutex::new(VecDeque::from([
                WorkerFailure::Transport("a".into()),
                WorkerFailure::Transport("b".into()),
                WorkerFailure::Transport("c".into()),
            ])),
            then: Some(response("unreachable")),
            calls: Mutex::new(0),
        });

        let err = gw.invoke(WorkerRole::Synthesis, "summarize", None).await.unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::Transient);
        assert_eq!(err.attempts, 3);
        assert_eq!(*backend.calls.lock(), 3);
    }

    #[tokio::test]
    async fn rate_limits_are_not_retried() {
        let (backend, gw) = gateway(FailingBackend {
            failures: Mutex::new(VecDeque::from([WorkerFailure::Status {
                code: 429,
                message: "quota".into(),
            }])),
            then: Some(response("unreachable")),
            calls: Mutex::new(0),
        });

        let err = gw.invoke(WorkerRole::Comparison, "compare", None).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(*backend.calls.lock(), 1);
    }

    #[tokio::test]
    async fn malformed_output_retried_once_with_reinforcement() {
        // First response has no JSON block; the retry carries the
        // reinforced instruction and the backend then cooperates.
        let backend = Arc::new(ScriptedWorker::new(vec![
            "no structure here, sorry".to_string(),
            r#"{"verdict": "ok"}"#.to_string(),
        ]));
        let gw = WorkerGateway::new(backend.clone(), WorkerGatewayConfig::default());

        let result = gw
            .invoke(WorkerRole::Comparison, "compare", Some(r#"{"verdict": "string"}"#))
            .await
            .unwrap();
        assert_eq!(result.structured.unwrap()["verdict"], "ok");
        let last = backend.last_request().unwrap();
        assert!(last.schema_hint.unwrap().contains("ONLY a single JSON object"));
    }

    #[tokio::test]
    async fn malformed_twice_surfaces_error() {
        let backend = Arc::new(ScriptedWorker::new(vec![
            "prose".to_string(),
            "more prose".to_string(),
        ]));
        let gw = WorkerGateway::new(backend, WorkerGatewayConfig::default());

        let err = gw
            .invoke(WorkerRole::Comparison, "compare", Some("{}"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::Malformed);
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test]
    async fn prose_wrapped_payload_is_extracted() {
        let backend = Arc::new(ScriptedWorker::new(vec![
            "Sure! Here you go: {\"winner_title\": \"Bag Fee\"} Let me know!".to_string(),
        ]));
        let gw = WorkerGateway::new(backend, WorkerGatewayConfig::default());

        let result = gw
            .invoke(WorkerRole::Comparison, "compare", Some("{}"))
            .await
            .unwrap();
        assert_eq!(result.structured.unwrap()["winner_title"], "Bag Fee");
    }
}
