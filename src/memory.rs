//! The memory model: one step of a protocol chain, as persisted in the
//! vector store payload and addressed by `kairos://mem/<uuid>`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::proof::ProofOfWork;

/// Fixed task vocabulary, checked in order; first match wins.
pub const TASKS: [&str; 10] = [
    "networking",
    "security",
    "optimization",
    "troubleshooting",
    "error-handling",
    "installation",
    "configuration",
    "testing",
    "deployment",
    "database",
];

/// A step URI: `kairos://mem/<uuidv4>`. Any other scheme or shape is
/// rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryUri(Uuid);

impl MemoryUri {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MemoryUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kairos://mem/{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid memory uri: {0:?}")]
pub struct InvalidUri(pub String);

impl FromStr for MemoryUri {
    type Err = InvalidUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("kairos://mem/")
            .ok_or_else(|| InvalidUri(s.to_string()))?;
        let id = Uuid::parse_str(rest).map_err(|_| InvalidUri(s.to_string()))?;
        if id.get_version_num() != 4 {
            return Err(InvalidUri(s.to_string()));
        }
        Ok(Self(id))
    }
}

impl Serialize for MemoryUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemoryUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Chain membership of a step. `id` is a pure function of `label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRef {
    pub id: Uuid,
    pub label: String,
    pub step_index: u32,
    pub step_count: u32,
}

impl ChainRef {
    pub fn is_head(&self) -> bool {
        self.step_index == 1
    }

    pub fn is_last(&self) -> bool {
        self.step_index == self.step_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Pattern,
    Rule,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Basic,
    Standard,
    High,
    Excellent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetadata {
    pub step_quality_score: f64,
    pub step_quality: QualityTier,
}

impl QualityMetadata {
    /// Attestation bonus. Only ever raises the score and tier.
    pub fn apply_bonus(&mut self, bonus: f64) {
        self.step_quality_score += bonus.max(0.0);
        self.step_quality = tier_for(self.step_quality_score).max(self.step_quality);
    }
}

fn tier_for(score: f64) -> QualityTier {
    if score < 50.0 {
        QualityTier::Basic
    } else if score < 65.0 {
        QualityTier::Standard
    } else if score < 80.0 {
        QualityTier::High
    } else {
        QualityTier::Excellent
    }
}

/// Deterministic quality score over the step's derived features.
pub fn score_quality(
    label: &str,
    _domain: &str,
    task: &str,
    kind: MemoryKind,
    tags: &[String],
) -> QualityMetadata {
    let mut score = 40.0;
    if task != "general" {
        score += 15.0;
    }
    score += match kind {
        MemoryKind::Pattern => 15.0,
        MemoryKind::Rule => 10.0,
        MemoryKind::Context => 0.0,
    };
    score += 2.0 * tags.len().min(5) as f64;
    let label_len = label.chars().count();
    if (8..=80).contains(&label_len) {
        score += 5.0;
    }
    QualityMetadata {
        step_quality_score: score,
        step_quality: tier_for(score),
    }
}

/// First vocabulary task appearing in the label, text or tags; else
/// `general`.
pub fn classify_task(label: &str, text: &str, tags: &[String]) -> String {
    let label = label.to_lowercase();
    let text = text.to_lowercase();
    for task in TASKS {
        if label.contains(task) || text.contains(task) || tags.iter().any(|t| t.contains(task)) {
            return task.to_string();
        }
    }
    "general".to_string()
}

/// `pattern` when a code fence or the word itself is present, else `rule`,
/// else `context`.
pub fn classify_kind(text: &str, tags: &[String]) -> MemoryKind {
    let lowered = text.to_lowercase();
    if text.contains("```")
        || lowered.contains("pattern")
        || tags.iter().any(|t| t == "pattern")
    {
        MemoryKind::Pattern
    } else if lowered.contains("rule") || tags.iter().any(|t| t == "rule") {
        MemoryKind::Rule
    } else {
        MemoryKind::Context
    }
}

/// One stored step. Serializes directly as the vector store payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub memory_uuid: Uuid,
    pub label: String,
    pub tags: Vec<String>,
    pub text: String,
    pub llm_model_id: String,
    pub created_at: DateTime<Utc>,
    pub task: String,
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    pub quality_metadata: QualityMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_of_work: Option<ProofOfWork>,
    pub space_id: String,
}

impl Memory {
    pub fn uri(&self) -> MemoryUri {
        MemoryUri::new(self.memory_uuid)
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("memory payload serializes")
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn uri_round_trips() {
        let id = Uuid::new_v4();
        let uri = MemoryUri::new(id);
        let parsed: MemoryUri = uri.to_string().parse().unwrap();
        assert_eq!(parsed.uuid(), id);
    }

    #[test_case("kairos://mem/not-a-uuid")]
    #[test_case("kairos://other/6a31c2f0-8f8b-4a1d-9b6e-0c4f5a7d8e90")]
    #[test_case("https://mem/6a31c2f0-8f8b-4a1d-9b6e-0c4f5a7d8e90")]
    #[test_case("")]
    fn bad_uris_are_rejected(raw: &str) {
        assert!(raw.parse::<MemoryUri>().is_err());
    }

    #[test]
    fn non_v4_uuid_is_rejected() {
        let v5 = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"x");
        assert!(format!("kairos://mem/{v5}").parse::<MemoryUri>().is_err());
    }

    #[test_case("Fix the network link", "", "networking"; "label match")]
    #[test_case("Step", "run the database migration", "database"; "text match")]
    #[test_case("Step", "body", "general"; "no match")]
    fn task_classification(label: &str, text: &str, expected: &str) {
        assert_eq!(classify_task(label, text, &[]), expected);
    }

    #[test]
    fn task_vocabulary_order_breaks_ties() {
        // Both "security" and "testing" appear; the vocabulary order wins.
        assert_eq!(
            classify_task("security testing", "", &[]),
            "security"
        );
    }

    #[test]
    fn kind_classification() {
        assert_eq!(classify_kind("```sh\nls\n```", &[]), MemoryKind::Pattern);
        assert_eq!(
            classify_kind("follow this rule strictly", &[]),
            MemoryKind::Rule
        );
        assert_eq!(classify_kind("plain prose", &[]), MemoryKind::Context);
        assert_eq!(
            classify_kind("", &["pattern".to_string()]),
            MemoryKind::Pattern
        );
    }

    #[test]
    fn quality_score_is_deterministic() {
        let tags = vec!["alpha".to_string(), "beta".to_string()];
        let a = score_quality("Configure the thing", "general", "configuration", MemoryKind::Pattern, &tags);
        let b = score_quality("Configure the thing", "general", "configuration", MemoryKind::Pattern, &tags);
        assert_eq!(a, b);
        assert_eq!(a.step_quality, tier_for(a.step_quality_score));
    }

    #[test]
    fn bonus_is_monotonic() {
        let mut q = score_quality("x", "general", "general", MemoryKind::Context, &[]);
        let before_score = q.step_quality_score;
        let before_tier = q.step_quality;
        q.apply_bonus(-5.0);
        assert_eq!(q.step_quality_score, before_score);
        q.apply_bonus(100.0);
        assert!(q.step_quality_score > before_score);
        assert!(q.step_quality >= before_tier);
        assert_eq!(q.step_quality, QualityTier::Excellent);
    }

    #[test]
    fn payload_round_trips() {
        let memory = Memory {
            memory_uuid: Uuid::new_v4(),
            label: "S1".into(),
            tags: vec!["alpha".into()],
            text: "body".into(),
            llm_model_id: "tester".into(),
            created_at: Utc::now(),
            task: "general".into(),
            kind: MemoryKind::Context,
            quality_metadata: score_quality("S1", "general", "general", MemoryKind::Context, &[]),
            chain: Some(ChainRef {
                id: Uuid::new_v4(),
                label: "A".into(),
                step_index: 1,
                step_count: 2,
            }),
            proof_of_work: None,
            space_id: "app".into(),
        };
        let payload = memory.payload();
        assert_eq!(payload["type"], "context");
        let back = Memory::from_payload(&payload).unwrap();
        assert_eq!(back.memory_uuid, memory.memory_uuid);
        assert_eq!(back.chain, memory.chain);
    }
}
