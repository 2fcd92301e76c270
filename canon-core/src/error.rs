//! Error types for the canonization engine.
//!
//! `CanonError` is what callers of the engine see. Store backends report
//! `StoreError`, which distinguishes transient failures (retried by the
//! commit coordinator) from permanent ones (which abort the batch).

use crate::fact::CanonLevel;
use crate::id::{FactId, ProposalId, ScopeId};
use thiserror::Error;

/// Result alias used throughout the engine.
pub type CanonResult<T> = Result<T, CanonError>;

/// Main error type for the canonization engine.
#[derive(Debug, Error)]
pub enum CanonError {
    /// Malformed or incomplete input: unknown authority, empty evidence,
    /// out-of-range confidence, an illegal supersession.
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A proposal was already resolved; resolution is write-once.
    #[error("Proposal {0} is already resolved")]
    AlreadyResolved(ProposalId),

    /// A canonical fact would be created (or extended) without evidence.
    #[error("Fact {fact} has no evidence (proposal {proposal:?})")]
    EvidenceMissing {
        fact: FactId,
        proposal: Option<ProposalId>,
    },

    /// Recording a supersession would close a loop in the retcon chain.
    #[error("Superseding {old} with {new} would create a retcon cycle")]
    Cycle { old: FactId, new: FactId },

    /// Finalize was called on a scope with nothing pending.
    #[error("No pending proposals in scope {0}")]
    EmptyBatch(ScopeId),

    /// A canon-level change that would move a fact backwards.
    #[error("Illegal canon-level transition for {fact}: {from} -> {to}")]
    InvalidTransition {
        fact: FactId,
        from: CanonLevel,
        to: CanonLevel,
    },

    /// The caller lacks the capability to canonize this scope.
    #[error("Principal '{principal}' may not canonize scope {scope}")]
    Unauthorized { principal: String, scope: ScopeId },

    /// A store backend failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A batch commit was aborted; nothing from it was marked resolved.
    #[error("Batch for scope {scope} aborted ({} proposals in flight): {source}", .in_flight.len())]
    BatchAborted {
        scope: ScopeId,
        in_flight: Vec<ProposalId>,
        #[source]
        source: Box<CanonError>,
    },
}

impl CanonError {
    /// Shorthand for a validation failure.
    pub fn validation(reason: impl Into<String>) -> Self {
        CanonError::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a missing record.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CanonError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// True if this error (or the error a batch abort wraps) is a transient
    /// store failure.
    pub fn is_transient(&self) -> bool {
        match self {
            CanonError::Store(e) => e.is_transient(),
            CanonError::BatchAborted { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// The innermost error, looking through batch aborts.
    pub fn root(&self) -> &CanonError {
        match self {
            CanonError::BatchAborted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Errors reported by store backends.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Temporary failure; the same operation may succeed if retried.
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// Failure that will not go away by retrying.
    #[error("Store failure: {0}")]
    Permanent(String),

    /// A conditional write lost: the record was not in the expected state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The store does not support the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    /// True for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors from the external judgment collaborator.
#[derive(Debug, Clone, Error)]
pub enum JudgeError {
    /// The judge did not answer within its deadline.
    #[error("Judgment timed out")]
    Timeout,

    /// Temporary failure (network, rate limit); may be retried.
    #[error("Judge unavailable: {0}")]
    Unavailable(String),

    /// The judge answered with something that could not be interpreted.
    #[error("Unreadable judgment: {0}")]
    Malformed(String),

    /// The judge refused the request (bad credentials, invalid request).
    #[error("Judge refused request: {0}")]
    Refused(String),
}

impl JudgeError {
    /// True if another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JudgeError::Unavailable(_))
    }
}
