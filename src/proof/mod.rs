//! Typed proof-of-work challenges and their solution validation.
//!
//! The variant set is closed: shell, mcp, user_input and comment. Solutions
//! are validated by dispatch on the challenge tag; the chain linkage itself
//! (nonce and hash continuity) lives in the protocol engine.

pub mod store;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A per-step challenge, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProofOfWork {
    Shell {
        cmd: String,
        timeout_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_stdout: Option<String>,
    },
    Mcp {
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_result: Option<Value>,
    },
    UserInput {
        prompt: String,
    },
    Comment {
        min_length: usize,
    },
}

impl ProofOfWork {
    pub fn challenge_type(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "shell",
            Self::Mcp { .. } => "mcp",
            Self::UserInput { .. } => "user_input",
            Self::Comment { .. } => "comment",
        }
    }

    /// Canonical serialization used as the hashing input. Field order is
    /// fixed by the struct definitions.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).expect("proof spec serializes")
    }
}

/// Caller-supplied solution for the previous step's challenge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolutionPayload {
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub proof_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellSolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpSolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<UserInputSolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<CommentSolution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellSolution {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSolution {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
    pub result: Value,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputSolution {
    pub confirmation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentSolution {
    pub text: String,
}

/// Validate a typed solution against its challenge. The `Err` message is
/// surfaced to the caller verbatim under `PROOF_INVALID`.
pub fn validate(spec: &ProofOfWork, solution: &SolutionPayload) -> Result<(), String> {
    match spec {
        ProofOfWork::Shell {
            expected_stdout,
            timeout_seconds,
            ..
        } => {
            let shell = solution
                .shell
                .as_ref()
                .ok_or("solution is missing the shell result")?;
            if shell.exit_code != 0 {
                return Err(format!(
                    "command exited with status {}, expected 0",
                    shell.exit_code
                ));
            }
            if let Some(expected) = expected_stdout {
                let stdout = shell.stdout.as_deref().unwrap_or("");
                if !stdout.contains(expected.as_str()) {
                    return Err(format!("stdout does not contain {expected:?}"));
                }
            }
            if let Some(duration) = shell.duration_seconds {
                // Informational only; the command already ran to completion.
                if duration > *timeout_seconds as f64 {
                    tracing::warn!(duration, timeout_seconds, "shell proof exceeded its timeout");
                }
            }
            Ok(())
        }
        ProofOfWork::Mcp {
            tool_name,
            expected_result,
        } => {
            let mcp = solution
                .mcp
                .as_ref()
                .ok_or("solution is missing the mcp result")?;
            if mcp.tool_name != *tool_name {
                return Err(format!(
                    "tool {} was called, challenge names {tool_name}",
                    mcp.tool_name
                ));
            }
            if !mcp.success {
                return Err("mcp tool call did not succeed".to_string());
            }
            if let Some(expected) = expected_result {
                if mcp.result != *expected {
                    return Err("mcp result does not match the expected value".to_string());
                }
            }
            Ok(())
        }
        ProofOfWork::UserInput { .. } => {
            let input = solution
                .user_input
                .as_ref()
                .ok_or("solution is missing the user confirmation")?;
            if input.confirmation != "approved" {
                return Err(format!(
                    "confirmation is {:?}, expected \"approved\"",
                    input.confirmation
                ));
            }
            Ok(())
        }
        ProofOfWork::Comment { min_length } => {
            let comment = solution
                .comment
                .as_ref()
                .ok_or("solution is missing the comment text")?;
            if comment.text.chars().count() < *min_length {
                return Err(format!(
                    "comment is {} characters, minimum is {min_length}",
                    comment.text.chars().count()
                ));
            }
            Ok(())
        }
    }
}

/// 128-bit random nonce, lowercase hex.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `SHA256(nonce ':' canonical_spec)`, lowercase hex. Step n's hash is
/// presented with step n+1's solution, chaining every step to the genesis.
pub fn proof_hash(nonce: &str, spec: &ProofOfWork) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(b":");
    hasher.update(spec.canonical().as_bytes());
    hex::encode(hasher.finalize())
}
