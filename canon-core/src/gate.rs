//! The canonization gate: end-of-scope orchestration.
//!
//! Finalizing a scope pulls its pending proposals, classifies each with the
//! evaluator, asks the external judge about the ones the policy deferred, and
//! hands the full decision set to the commit coordinator in one call.

use crate::commit::{BatchResult, CommitCoordinator};
use crate::config::EngineConfig;
use crate::error::{CanonResult, JudgeError};
use crate::evaluator::{Decision, DecisionBasis, Evaluator, ResolvedDecision};
use crate::id::ScopeId;
use crate::judge::ExternalJudge;
use crate::proposal::{Proposal, ProposalStore};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Turns a scope's pending proposals into canon.
#[derive(Clone)]
pub struct CanonizationGate {
    proposals: ProposalStore,
    evaluator: Evaluator,
    judge: Option<Arc<dyn ExternalJudge>>,
    coordinator: CommitCoordinator,
    config: EngineConfig,
}

impl CanonizationGate {
    /// A gate with the default configuration and no judge. The coordinator
    /// keeps its own retry policy until [`Self::with_config`] replaces it.
    pub fn new(
        proposals: ProposalStore,
        evaluator: Evaluator,
        coordinator: CommitCoordinator,
    ) -> Self {
        Self {
            proposals,
            evaluator,
            judge: None,
            coordinator,
            config: EngineConfig::default(),
        }
    }

    /// Consult `judge` for deferred proposals.
    pub fn with_judge(mut self, judge: Arc<dyn ExternalJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Replace the configuration (the commit retry policy included).
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.coordinator = self.coordinator.with_retry(config.retry);
        self.config = config;
        self
    }

    /// The proposal store this gate reads from.
    pub fn proposals(&self) -> &ProposalStore {
        &self.proposals
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decide and commit every pending proposal of a scope.
    ///
    /// Finalizing an already finalized scope returns the stored result.
    /// Fails with `EmptyBatch` when nothing is pending and no batch exists.
    /// The scope lock is held from the marker check through the commit, so
    /// concurrent finalizes of one scope consult the judge once.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn finalize_scope(&self, scope: &ScopeId) -> CanonResult<BatchResult> {
        let guard = self.coordinator.lock_scope(scope).await;

        let pending = match self.coordinator.batch(scope).await? {
            Some(batch) => match batch.result() {
                Some(result) => {
                    info!("scope already finalized, returning stored result");
                    return Ok(result.clone());
                }
                // An interrupted batch resumes from its recorded plan; new
                // verdicts would be ignored.
                None => Vec::new(),
            },
            None => self.proposals.pending_for(scope).await?,
        };

        debug!(
            pending = pending.len(),
            policy = self.evaluator.policy_name(),
            "deciding scope"
        );
        let decisions = self.decide(pending).await;
        self.coordinator.commit_locked(guard, scope, decisions).await
    }

    /// Final verdicts for a set of proposals, in input order.
    ///
    /// Judge calls run concurrently up to the configured limit.
    pub async fn decide(&self, pending: Vec<Proposal>) -> Vec<ResolvedDecision> {
        let concurrency = self.config.judge_concurrency.max(1);
        stream::iter(pending)
            .map(|proposal| self.decide_one(proposal))
            .buffered(concurrency)
            .collect()
            .await
    }

    async fn decide_one(&self, proposal: Proposal) -> ResolvedDecision {
        let decision = self.evaluator.evaluate(&proposal);
        debug!(proposal_id = %proposal.id, ?decision, "proposal evaluated");
        match decision {
            Decision::Accept => ResolvedDecision::accept(proposal, DecisionBasis::Policy),
            Decision::Reject => ResolvedDecision::reject(proposal, DecisionBasis::Policy),
            Decision::NeedsExternalJudgment => self.consult(proposal).await,
        }
    }

    async fn consult(&self, proposal: Proposal) -> ResolvedDecision {
        let Some(judge) = &self.judge else {
            debug!(proposal_id = %proposal.id, "no judge configured, rejecting");
            return ResolvedDecision::reject(proposal, DecisionBasis::NoJudge);
        };

        let timeout = self.config.judge_timeout();
        let mut retries = 0;
        loop {
            let outcome = match tokio::time::timeout(timeout, judge.judge(&proposal, timeout)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(JudgeError::Timeout),
            };

            match outcome {
                Ok(true) => return ResolvedDecision::accept(proposal, DecisionBasis::Judge),
                Ok(false) => return ResolvedDecision::reject(proposal, DecisionBasis::Judge),
                Err(e) if e.is_retryable() && retries < self.config.judge_retries => {
                    retries += 1;
                    let delay = self.config.retry.backoff(retries);
                    debug!(
                        proposal_id = %proposal.id,
                        judge = judge.name(),
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "judge unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(JudgeError::Timeout) => {
                    warn!(
                        proposal_id = %proposal.id,
                        judge = judge.name(),
                        "judgment timed out, rejecting"
                    );
                    return ResolvedDecision::reject(proposal, DecisionBasis::JudgeTimedOut);
                }
                Err(e) => {
                    warn!(
                        proposal_id = %proposal.id,
                        judge = judge.name(),
                        error = %e,
                        "judgment failed, rejecting"
                    );
                    return ResolvedDecision::reject(proposal, DecisionBasis::JudgeFailed);
                }
            }
        }
    }
}
