//! Deterministic worker backends for tests and offline runs.

use super::{WorkerBackend, WorkerRequest, WorkerResponse, WorkerRole};
use crate::error::WorkerFailure;
use async_trait::async_trait;
use parking_lot::Mutex;
use polis_types::TokenUsage;
use serde_json::json;
use std::collections::VecDeque;

fn stub_response(text: String, seq: u64) -> WorkerResponse {
    WorkerResponse {
        text,
        model: "stub-worker".to_string(),
        response_id: Some(format!("stub-{}", seq)),
        usage: TokenUsage {
            prompt_tokens: Some(100),
            completion_tokens: Some(50),
            total_tokens: Some(150),
        },
    }
}

/// Backend that replays a scripted sequence of raw responses.
///
/// Requests are kept for assertions.
pub struct ScriptedWorker {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<WorkerRequest>>,
    seq: Mutex<u64>,
}

impl ScriptedWorker {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            seq: Mutex::new(0),
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        self.responses.lock().push_back(response.into());
    }

    pub fn last_request(&self) -> Option<WorkerRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl WorkerBackend for ScriptedWorker {
    async fn complete(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerFailure> {
        self.requests.lock().push(request.clone());
        let text = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| WorkerFailure::Transport("scripted worker exhausted".into()))?;
        let mut seq = self.seq.lock();
        *seq += 1;
        Ok(stub_response(text, *seq))
    }
}

/// Fully deterministic backend: generates lettered proposals, always
/// prefers the lexicographically smaller title in comparisons, and
/// evolves in place, keeping the source proposal's title.
#[derive(Default)]
pub struct LexicalJudgeWorker {
    seq: Mutex<u64>,
}

impl LexicalJudgeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    fn generation_payload(prompt: &str) -> String {
        let n = parse_requested_count(prompt).unwrap_or(3);
        let jurisdiction = parse_labelled_line(prompt, "- Jurisdiction: ");

        let proposals: Vec<_> = (0..n)
            .map(|i| {
                let letter = (b'A' + (i % 26) as u8) as char;
                let place = jurisdiction.as_deref().unwrap_or("the jurisdiction");
                json!({
                    "title": format!("Policy Option {}", letter),
                    "description": format!(
                        "A phased program tailored to {} with enforcement and outreach components.",
                        place
                    ),
                    "rationale": format!(
                        "Option {} balances effectiveness and feasibility for {}.",
                        letter, place
                    ),
                    "implementation_notes": "Start with a six-month pilot, then expand.",
                })
            })
            .collect();

        json!({ "proposals": proposals }).to_string()
    }

    fn comparison_payload(prompt: &str) -> String {
        let titles = parse_all_labelled_lines(prompt, "Title: ");
        let winner = titles.iter().min().cloned().unwrap_or_default();
        json!({
            "winner_title": winner,
            "rationale": "The earlier-titled proposal reads as more focused and implementable.",
        })
        .to_string()
    }

    fn evolution_payload(prompt: &str) -> String {
        let title = parse_labelled_line(prompt, "Title: ").unwrap_or_else(|| "Policy".to_string());
        json!({
            "improvements": [
                "Added an equity carve-out for low-income residents",
                "Sequenced enforcement after an education period",
            ],
            "evolved": {
                "title": title,
                "description": "The refined program keeps the original scope and adds phased enforcement.",
                "rationale": "Addresses the main feasibility objections raised against the original.",
                "implementation_notes": "Reuse the pilot infrastructure from the original rollout.",
            },
        })
        .to_string()
    }
}

#[async_trait]
impl WorkerBackend for LexicalJudgeWorker {
    async fn complete(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerFailure> {
        let text = match request.role {
            WorkerRole::Generation => Self::generation_payload(&request.prompt),
            WorkerRole::Comparison => Self::comparison_payload(&request.prompt),
            WorkerRole::Evolution => Self::evolution_payload(&request.prompt),
            WorkerRole::Synthesis => "A concise overview of the leading policy options.".to_string(),
        };
        let mut seq = self.seq.lock();
        *seq += 1;
        Ok(stub_response(text, *seq))
    }
}

fn parse_requested_count(prompt: &str) -> Option<usize> {
    let rest = prompt.split("exactly ").nth(1)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn parse_labelled_line(prompt: &str, label: &str) -> Option<String> {
    prompt
        .lines()
        .find_map(|line| line.trim().strip_prefix(label).map(|v| v.trim().to_string()))
}

fn parse_all_labelled_lines(prompt: &str, label: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| line.trim().strip_prefix(label).map(|v| v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_worker_replays_in_order() {
        let worker = ScriptedWorker::new(vec!["one".into(), "two".into()]);
        let request = WorkerRequest {
            role: WorkerRole::Synthesis,
            prompt: "go".into(),
            schema_hint: None,
        };
        assert_eq!(worker.complete(&request).await.unwrap().text, "one");
        assert_eq!(worker.complete(&request).await.unwrap().text, "two");
        assert!(worker.complete(&request).await.is_err());
        assert_eq!(worker.request_count(), 3);
    }

    #[tokio::test]
    async fn lexical_judge_prefers_smaller_title() {
        let worker = LexicalJudgeWorker::new();
        let request = WorkerRequest {
            role: WorkerRole::Comparison,
            prompt: "Proposal A\nTitle: Zoning Reform\n\nProposal B\nTitle: Bag Fee\n".into(),
            schema_hint: None,
        };
        let response = worker.complete(&request).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&response.text).unwrap();
        assert_eq!(value["winner_title"], "Bag Fee");
    }

    #[tokio::test]
    async fn lexical_judge_generates_requested_count() {
        let worker = LexicalJudgeWorker::new();
        let request = WorkerRequest {
            role: WorkerRole::Generation,
            prompt: "- Jurisdiction: Elgin, Illinois\n\nGenerate exactly 4 diverse policy proposals.".into(),
            schema_hint: None,
        };
        let response = worker.complete(&request).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&response.text).unwrap();
        let proposals = value["proposals"].as_array().unwrap();
        assert_eq!(proposals.len(), 4);
        assert!(proposals[0]["description"]
            .as_str()
            .unwrap()
            .contains("Elgin, Illinois"));
    }
}
