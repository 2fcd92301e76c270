//! Batch results and the per-scope write-ahead marker.

use super::plan::CommitPlan;
use crate::id::{FactId, ProposalId, ScopeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a finalized scope produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// The scope that was finalized.
    pub scope: ScopeId,
    /// Facts created, in proposal order.
    pub accepted_fact_ids: Vec<FactId>,
    /// Proposals declined, in proposal order.
    pub rejected_proposal_ids: Vec<ProposalId>,
}

impl BatchResult {
    /// A result with nothing in it.
    pub fn empty(scope: ScopeId) -> Self {
        Self {
            scope,
            accepted_fact_ids: Vec::new(),
            rejected_proposal_ids: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.accepted_fact_ids.is_empty() && self.rejected_proposal_ids.is_empty()
    }
}

/// Progress of a scope's batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchState {
    /// The plan is fixed; canonical writes may or may not have landed.
    Committing { plan: CommitPlan },
    /// Everything landed; finalizing again returns this result.
    Finalized { result: BatchResult },
}

/// Marker recorded before the canonical write and kept after it.
///
/// Doubles as the idempotency key for `finalize_scope`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeBatch {
    pub scope: ScopeId,
    /// Every proposal decided in the batch.
    pub proposals: Vec<ProposalId>,
    #[serde(flatten)]
    pub state: BatchState,
    pub updated_at: DateTime<Utc>,
}

impl ScopeBatch {
    /// Marker for a batch about to be written.
    pub fn committing(scope: ScopeId, plan: CommitPlan) -> Self {
        Self {
            scope,
            proposals: plan.in_flight(),
            state: BatchState::Committing { plan },
            updated_at: Utc::now(),
        }
    }

    /// Move the marker to its terminal state.
    pub fn finalize(mut self, result: BatchResult) -> Self {
        self.state = BatchState::Finalized { result };
        self.updated_at = Utc::now();
        self
    }

    /// The stored result, once finalized.
    pub fn result(&self) -> Option<&BatchResult> {
        match &self.state {
            BatchState::Finalized { result } => Some(result),
            BatchState::Committing { .. } => None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.result().is_some()
    }
}
