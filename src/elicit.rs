//! Pluggable elicitation for `user_input` challenges.
//!
//! A transport that can round-trip a prompt to the human behind the agent
//! implements [`Elicitor`]; the stock HTTP transport cannot, so the default
//! wiring is [`NullElicitor`] and callers without the capability are refused
//! with `CAPABILITY_REQUIRED`.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured reply schema offered to the client:
/// `confirmation ∈ {approve, retry_last_step, retry_chain, abort}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElicitReply {
    Approve,
    RetryLastStep,
    RetryChain,
    Abort,
    /// Client declined or cancelled the prompt.
    Declined,
}

#[derive(Debug, Error)]
pub enum ElicitError {
    #[error("client does not advertise the elicitation capability")]
    Unsupported,
    #[error("elicitation failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Elicitor: Send + Sync {
    /// Whether the connected client can answer prompts at all.
    fn supports_elicitation(&self) -> bool;

    async fn elicit(&self, prompt: &str) -> Result<ElicitReply, ElicitError>;
}

/// Default for transports without an elicitation channel.
pub struct NullElicitor;

#[async_trait]
impl Elicitor for NullElicitor {
    fn supports_elicitation(&self) -> bool {
        false
    }

    async fn elicit(&self, _prompt: &str) -> Result<ElicitReply, ElicitError> {
        Err(ElicitError::Unsupported)
    }
}

/// Scripted elicitor for tests: pops replies in order, errors when empty.
pub struct ScriptedElicitor {
    replies: Mutex<VecDeque<ElicitReply>>,
}

impl ScriptedElicitor {
    pub fn new(replies: impl IntoIterator<Item = ElicitReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Elicitor for ScriptedElicitor {
    fn supports_elicitation(&self) -> bool {
        true
    }

    async fn elicit(&self, _prompt: &str) -> Result<ElicitReply, ElicitError> {
        self.replies
            .lock()
            .expect("replies mutex")
            .pop_front()
            .ok_or_else(|| ElicitError::Failed("no reply scripted".to_string()))
    }
}
