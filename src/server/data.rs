use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::{ChainRef, Memory};
use crate::proof::{ProofOfWork, SolutionPayload};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchRequest {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeginRequest {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NextRequest {
    pub uri: String,
    #[serde(default)]
    pub solution: SolutionPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestOutcome {
    Success,
    Failure,
}

/// Attestation closes the loop on an executed step. There is deliberately
/// no `final_solution` field; unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttestRequest {
    pub uri: String,
    pub outcome: AttestOutcome,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub quality_bonus: Option<f64>,
    #[serde(default)]
    pub llm_model_id: Option<String>,
}

/// `markdown_doc` carries full renders (BODY extracted between markers);
/// `updates` carries raw replacement bodies. One of the two is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRequest {
    pub uris: Vec<String>,
    #[serde(default)]
    pub markdown_doc: Option<Vec<String>>,
    #[serde(default)]
    pub updates: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteRequest {
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DumpRequest {
    pub uri: String,
    #[serde(default)]
    pub protocol: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintedItem {
    pub uri: String,
    pub memory_uuid: Uuid,
    pub label: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintMetadata {
    pub count: usize,
    pub duration_ms: u64,
    pub llm_model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintResponse {
    pub status: String,
    pub items: Vec<MintedItem>,
    pub metadata: MintMetadata,
}

/// The step a response is talking about, with enough content to act on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub uri: String,
    pub label: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainRef>,
}

impl From<&Memory> for StepInfo {
    fn from(memory: &Memory) -> Self {
        Self {
            uri: memory.uri().to_string(),
            label: memory.label.clone(),
            content: memory.text.clone(),
            chain: memory.chain.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeInfo {
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub nonce: String,
    pub proof_hash: String,
    pub spec: ProofOfWork,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginResponse {
    pub must_obey: bool,
    pub current_step: StepInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeInfo>,
    pub next_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextStepRef {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextResponse {
    pub must_obey: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<NextStepRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub next_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestResult {
    pub uri: String,
    pub outcome: AttestOutcome,
    pub quality_bonus: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub rated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestResponse {
    pub results: Vec<AttestResult>,
    pub total_rated: usize,
    pub total_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub uri: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub results: Vec<ItemResult>,
    pub total_updated: usize,
    pub total_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub results: Vec<ItemResult>,
    pub total_deleted: usize,
    pub total_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpResponse {
    pub uri: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_label: Option<String>,
    pub markdown_doc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    #[serde(rename = "vectorStore")]
    pub vector_store: String,
    pub kv: String,
    pub embedding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub dependencies: DependencyHealth,
    pub uptime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attest_request_rejects_final_solution() {
        let raw = r#"{
            "uri": "kairos://mem/5f0c2d9e-0f59-4a7a-8f27-3a4f0b6c9d21",
            "outcome": "success",
            "final_solution": "nope"
        }"#;
        assert!(serde_json::from_str::<AttestRequest>(raw).is_err());
    }

    #[test]
    fn attest_outcome_parses_snake_case() {
        assert_eq!(
            serde_json::from_str::<AttestOutcome>("\"failure\"").unwrap(),
            AttestOutcome::Failure
        );
    }

    #[test]
    fn challenge_tags_its_type() {
        let challenge = ChallengeInfo {
            challenge_type: "shell".into(),
            nonce: "aa".into(),
            proof_hash: "bb".into(),
            spec: ProofOfWork::Shell {
                cmd: "echo ok".into(),
                timeout_seconds: 5,
                expected_stdout: None,
            },
        };
        let v = serde_json::to_value(&challenge).unwrap();
        assert_eq!(v["type"], "shell");
        assert_eq!(v["spec"]["type"], "shell");
    }

    #[test]
    fn dump_request_defaults_protocol_off() {
        let req: DumpRequest = serde_json::from_str(
            r#"{"uri": "kairos://mem/5f0c2d9e-0f59-4a7a-8f27-3a4f0b6c9d21"}"#,
        )
        .unwrap();
        assert!(!req.protocol);
    }
}
