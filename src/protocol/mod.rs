//! Protocol execution: begin → next → attest under nonce and hash
//! continuity.
//!
//! Each step with a challenge is issued a fresh 128-bit nonce and a proof
//! hash linking it to its spec; step n's hash is presented with step n+1's
//! solution, so every step chains back to the genesis hash of step 1. Bad
//! solutions are retried up to the configured limit, then the circuit opens
//! and `must_obey` flips to false.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::chain_store::ChainStore;
use crate::context::RequestContext;
use crate::elicit::{ElicitReply, Elicitor};
use crate::memory::{Memory, MemoryUri};
use crate::monitoring;
use crate::proof::store::{ProofStore, ResultRecord};
use crate::proof::{self, ProofOfWork, SolutionPayload, UserInputSolution};
use crate::server::data::{
    AttestOutcome, AttestRequest, AttestResponse, AttestResult, BeginResponse, ChallengeInfo,
    NextResponse, NextStepRef, StepInfo,
};
use crate::server::error::Error;

pub struct ProtocolEngine {
    chains: Arc<ChainStore>,
    proofs: Arc<ProofStore>,
    elicitor: Arc<dyn Elicitor>,
    max_retries: u32,
    elicitation_timeout: Duration,
}

enum ElicitOutcome {
    Approved,
    Response(Box<NextResponse>),
}

impl ProtocolEngine {
    pub fn new(
        chains: Arc<ChainStore>,
        proofs: Arc<ProofStore>,
        elicitor: Arc<dyn Elicitor>,
        max_retries: u32,
        elicitation_timeout: Duration,
    ) -> Self {
        Self {
            chains,
            proofs,
            elicitor,
            max_retries,
            elicitation_timeout,
        }
    }

    /// Open a step: issue its challenge, or wave the caller through when the
    /// step carries none.
    #[instrument(level = "debug", skip(self, _ctx))]
    pub async fn begin(
        &self,
        _ctx: &RequestContext,
        uri: MemoryUri,
    ) -> Result<BeginResponse, Error> {
        let memory = self.chains.load(uri).await?;
        let next_uri = self.next_uri(&memory).await?;

        match memory.proof_of_work.clone() {
            None => Ok(BeginResponse {
                must_obey: true,
                current_step: StepInfo::from(&memory),
                challenge: None,
                next_action: free_advance_action(next_uri.as_ref()),
            }),
            Some(spec) => {
                let challenge = self.issue_challenge(&memory, &spec, true).await?;
                Ok(BeginResponse {
                    must_obey: true,
                    current_step: StepInfo::from(&memory),
                    challenge: Some(challenge),
                    next_action: solve_action(next_uri.as_ref()),
                })
            }
        }
    }

    /// Advance to `uri`, validating the solution of its predecessor's
    /// challenge. Validation short-circuits in order: nonce continuity,
    /// hash continuity, typed solution.
    #[instrument(level = "debug", skip(self, ctx, solution))]
    pub async fn next(
        &self,
        ctx: &RequestContext,
        uri: MemoryUri,
        mut solution: SolutionPayload,
    ) -> Result<NextResponse, Error> {
        let memory = self.chains.load(uri).await?;

        // The predecessor owns the challenge being solved; a head being
        // resumed validates against its own stored values.
        let predecessor = match &memory.chain {
            Some(chain) if chain.step_index > 1 => self
                .chains
                .find_step(chain.id, chain.step_index - 1)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "step {} of chain {}",
                        chain.step_index - 1,
                        chain.id
                    ))
                })?,
            _ => memory.clone(),
        };

        let Some(spec) = predecessor.proof_of_work.clone() else {
            // Unchallenged predecessor: nothing to validate.
            return self.advance(&memory).await;
        };

        let stored_nonce = self.proofs.nonce(predecessor.memory_uuid).await?;
        if stored_nonce.is_none() || solution.nonce != stored_nonce {
            return self
                .fail(
                    &memory,
                    "NONCE_MISMATCH",
                    "solution nonce does not match the issued challenge",
                )
                .await;
        }

        let stored_hash = self.proofs.hash(predecessor.memory_uuid).await?;
        if stored_hash.is_none() || solution.proof_hash != stored_hash {
            return self
                .fail(
                    &memory,
                    "HASH_MISMATCH",
                    "proof_hash does not continue the chain",
                )
                .await;
        }

        if let ProofOfWork::UserInput { prompt } = &spec {
            if solution.user_input.is_none() {
                match self.resolve_elicitation(ctx, &memory, prompt).await? {
                    ElicitOutcome::Approved => {
                        solution.user_input = Some(UserInputSolution {
                            confirmation: "approved".to_string(),
                        });
                    }
                    ElicitOutcome::Response(response) => return Ok(*response),
                }
            }
        }

        if let Err(message) = proof::validate(&spec, &solution) {
            return self.fail(&memory, "PROOF_INVALID", &message).await;
        }

        self.proofs
            .put_result(
                predecessor.memory_uuid,
                &ResultRecord {
                    outcome: "solved".to_string(),
                    message: None,
                    quality_bonus: 0.0,
                    recorded_at: Utc::now(),
                },
            )
            .await?;
        self.proofs.reset_retries(predecessor.memory_uuid).await?;
        self.proofs.reset_retries(memory.memory_uuid).await?;

        self.advance(&memory).await
    }

    /// Record the caller's verdict on an executed step. Success adds the
    /// quality bonus; failure records the message without decrementing.
    #[instrument(level = "debug", skip(self, _ctx, request))]
    pub async fn attest(
        &self,
        _ctx: &RequestContext,
        uri: MemoryUri,
        request: &AttestRequest,
    ) -> Result<AttestResponse, Error> {
        let memory = self.chains.load(uri).await?;
        let quality_bonus = request.quality_bonus.unwrap_or(0.0);
        let rated_at = Utc::now();

        let outcome_name = match request.outcome {
            AttestOutcome::Success => "success",
            AttestOutcome::Failure => "failure",
        };
        self.proofs
            .put_result(
                memory.memory_uuid,
                &ResultRecord {
                    outcome: outcome_name.to_string(),
                    message: request.message.clone(),
                    quality_bonus,
                    recorded_at: rated_at,
                },
            )
            .await?;

        if request.outcome == AttestOutcome::Success {
            self.chains.apply_quality_bonus(uri, quality_bonus).await?;
        }
        info!(%uri, outcome = outcome_name, quality_bonus, "step attested");

        let failed = request.outcome == AttestOutcome::Failure;
        Ok(AttestResponse {
            results: vec![AttestResult {
                uri: uri.to_string(),
                outcome: request.outcome,
                quality_bonus,
                message: request.message.clone(),
                rated_at,
            }],
            total_rated: usize::from(!failed),
            total_failed: usize::from(failed),
        })
    }

    async fn resolve_elicitation(
        &self,
        ctx: &RequestContext,
        memory: &Memory,
        prompt: &str,
    ) -> Result<ElicitOutcome, Error> {
        if !ctx.elicitation_supported || !self.elicitor.supports_elicitation() {
            // The one place where must_obey flips false mid-chain.
            return Ok(ElicitOutcome::Response(Box::new(NextResponse {
                must_obey: false,
                current_step: Some(StepInfo::from(memory)),
                challenge: None,
                next_step: None,
                error_code: Some("CAPABILITY_REQUIRED".to_string()),
                retry_count: None,
                message: Some(
                    "this step needs user input and the client cannot elicit it".to_string(),
                ),
                next_action: format!(
                    "collect the user's approval out of band, then call kairos_next with {} and confirmation=approved",
                    memory.uri()
                ),
            })));
        }

        let reply = match tokio::time::timeout(self.elicitation_timeout, self.elicitor.elicit(prompt))
            .await
        {
            Ok(reply) => reply,
            Err(_elapsed) => {
                let response = self
                    .fail(memory, "ELICITATION_FAILED", "the elicitation timed out")
                    .await?;
                return Ok(ElicitOutcome::Response(Box::new(response)));
            }
        };

        match reply {
            Ok(ElicitReply::Approve) => Ok(ElicitOutcome::Approved),
            Ok(ElicitReply::RetryLastStep) | Ok(ElicitReply::Declined) => {
                let response = self
                    .fail(memory, "USER_DECLINED", "the user declined this step")
                    .await?;
                Ok(ElicitOutcome::Response(Box::new(response)))
            }
            Ok(ElicitReply::RetryChain) => {
                let head_uri = self.head_uri(memory).await?;
                Ok(ElicitOutcome::Response(Box::new(NextResponse {
                    must_obey: true,
                    current_step: Some(StepInfo::from(memory)),
                    challenge: None,
                    next_step: None,
                    error_code: Some("USER_DECLINED".to_string()),
                    retry_count: None,
                    message: Some("the user asked to restart the protocol".to_string()),
                    next_action: format!("call kairos_begin with {head_uri}"),
                })))
            }
            Ok(ElicitReply::Abort) => Ok(ElicitOutcome::Response(Box::new(NextResponse {
                must_obey: true,
                current_step: Some(StepInfo::from(memory)),
                challenge: None,
                next_step: None,
                error_code: Some("USER_DECLINED".to_string()),
                retry_count: None,
                message: Some("the user aborted the protocol".to_string()),
                next_action: "call kairos_attest with outcome=failure".to_string(),
            }))),
            Err(error) => {
                warn!(%error, "elicitation round-trip failed");
                let response = self
                    .fail(memory, "ELICITATION_FAILED", &error.to_string())
                    .await?;
                Ok(ElicitOutcome::Response(Box::new(response)))
            }
        }
    }

    /// Issue (or reissue) the challenge for a step.
    async fn issue_challenge(
        &self,
        memory: &Memory,
        spec: &ProofOfWork,
        reset_retries: bool,
    ) -> Result<ChallengeInfo, Error> {
        let nonce = proof::generate_nonce();
        let proof_hash = proof::proof_hash(&nonce, spec);
        self.proofs.put_nonce(memory.memory_uuid, &nonce).await?;
        self.proofs.put_hash(memory.memory_uuid, &proof_hash).await?;
        if reset_retries {
            self.proofs.reset_retries(memory.memory_uuid).await?;
        }
        Ok(ChallengeInfo {
            challenge_type: spec.challenge_type().to_string(),
            nonce,
            proof_hash,
            spec: spec.clone(),
        })
    }

    /// The solved-and-moving-on response: the current step's own challenge
    /// plus a pointer at the step after it.
    async fn advance(&self, memory: &Memory) -> Result<NextResponse, Error> {
        let next_uri = self.next_uri(memory).await?;
        let challenge = match memory.proof_of_work.clone() {
            Some(spec) => Some(self.issue_challenge(memory, &spec, true).await?),
            None => None,
        };
        let next_action = if challenge.is_some() {
            solve_action(next_uri.as_ref())
        } else {
            free_advance_action(next_uri.as_ref())
        };
        Ok(NextResponse {
            must_obey: true,
            current_step: Some(StepInfo::from(memory)),
            challenge,
            next_step: next_uri.map(|uri| NextStepRef {
                uri: uri.to_string(),
            }),
            error_code: None,
            retry_count: None,
            message: None,
            next_action,
        })
    }

    /// Shared failure path: bump the retry counter, reissue the step's
    /// challenge below the limit, open the circuit at it.
    async fn fail(
        &self,
        memory: &Memory,
        code: &str,
        message: &str,
    ) -> Result<NextResponse, Error> {
        monitoring::PROOF_FAILURES.with_label_values(&[code]).inc();
        let retry_count = self.proofs.bump_retry(memory.memory_uuid).await?;

        if retry_count >= self.max_retries {
            monitoring::CIRCUITS_OPENED.inc();
            warn!(uri = %memory.uri(), code, retry_count, "proof retries exhausted, circuit open");
            return Ok(NextResponse {
                must_obey: false,
                current_step: Some(StepInfo::from(memory)),
                challenge: None,
                next_step: None,
                error_code: Some("MAX_RETRIES_EXCEEDED".to_string()),
                retry_count: Some(retry_count),
                message: Some(format!("{message} ({code})")),
                next_action: "call kairos_attest with outcome=failure".to_string(),
            });
        }

        let challenge = match memory.proof_of_work.clone() {
            Some(spec) => Some(self.issue_challenge(memory, &spec, false).await?),
            None => None,
        };
        Ok(NextResponse {
            must_obey: true,
            current_step: Some(StepInfo::from(memory)),
            challenge,
            next_step: None,
            error_code: Some(code.to_string()),
            retry_count: Some(retry_count),
            message: Some(message.to_string()),
            next_action: format!(
                "fix the failure and call kairos_next with {} again",
                memory.uri()
            ),
        })
    }

    async fn next_uri(&self, memory: &Memory) -> Result<Option<MemoryUri>, Error> {
        let Some(chain) = &memory.chain else {
            return Ok(None);
        };
        if chain.is_last() {
            return Ok(None);
        }
        Ok(self
            .chains
            .find_step(chain.id, chain.step_index + 1)
            .await?
            .map(|next| next.uri()))
    }

    async fn head_uri(&self, memory: &Memory) -> Result<MemoryUri, Error> {
        let Some(chain) = &memory.chain else {
            return Ok(memory.uri());
        };
        Ok(self
            .chains
            .find_step(chain.id, 1)
            .await?
            .map(|head| head.uri())
            .unwrap_or_else(|| memory.uri()))
    }
}

fn free_advance_action(next_uri: Option<&MemoryUri>) -> String {
    match next_uri {
        Some(uri) => format!("call kairos_next with {uri}"),
        None => "final step reached, call kairos_attest with outcome=success".to_string(),
    }
}

fn solve_action(next_uri: Option<&MemoryUri>) -> String {
    match next_uri {
        Some(uri) => format!(
            "solve the challenge, then call kairos_next with {uri} presenting the nonce and proof_hash"
        ),
        None => "solve the challenge, then call kairos_attest with outcome=success".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn actions_point_at_the_next_step_or_attest() {
        let uri = MemoryUri::new(Uuid::new_v4());
        assert_eq!(
            free_advance_action(Some(&uri)),
            format!("call kairos_next with {uri}")
        );
        assert!(free_advance_action(None).contains("kairos_attest"));
        assert!(solve_action(Some(&uri)).contains(&uri.to_string()));
        assert!(solve_action(None).contains("kairos_attest"));
    }
}
