//! The proposal store: validated submission and write-once resolution.

use super::types::{Proposal, ProposalDraft, ProposalStatus};
use crate::backend::{ResolveOutcome, StagingStore};
use crate::error::{CanonError, CanonResult};
use crate::id::{FactId, ProposalId, ScopeId};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Owns the proposal lifecycle until a batch is finalized.
///
/// Validation happens here, so malformed proposals never reach the
/// evaluator or the commit coordinator.
#[derive(Clone)]
pub struct ProposalStore {
    staging: Arc<dyn StagingStore>,
}

impl ProposalStore {
    /// Create a store over a staging backend.
    pub fn new(staging: Arc<dyn StagingStore>) -> Self {
        Self { staging }
    }

    /// Validate and stage a proposal.
    pub async fn submit(&self, draft: ProposalDraft) -> CanonResult<ProposalId> {
        let proposal = draft.into_proposal()?;
        let id = proposal.id;
        debug!(
            proposal_id = %id,
            scope = %proposal.scope,
            authority = %proposal.authority,
            kind = proposal.payload.assertion.kind_name(),
            "proposal staged"
        );
        self.staging.insert(proposal).await?;
        Ok(id)
    }

    /// Pending proposals of a scope in insertion order.
    pub async fn pending_for(&self, scope: &ScopeId) -> CanonResult<Vec<Proposal>> {
        let mut proposals = self.staging.by_scope(scope).await?;
        proposals.retain(Proposal::is_pending);
        Ok(proposals)
    }

    /// Every proposal of a scope, resolved ones included.
    pub async fn history_for(&self, scope: &ScopeId) -> CanonResult<Vec<Proposal>> {
        Ok(self.staging.by_scope(scope).await?)
    }

    /// Read one proposal.
    pub async fn get(&self, id: ProposalId) -> CanonResult<Proposal> {
        self.staging
            .get(id)
            .await?
            .ok_or_else(|| CanonError::not_found("proposal", id))
    }

    /// Record the decision for a proposal. Resolution is write-once.
    pub async fn mark_resolved(
        &self,
        id: ProposalId,
        status: ProposalStatus,
        canonical_fact: Option<FactId>,
    ) -> CanonResult<Proposal> {
        if !self.get(id).await?.is_pending() {
            return Err(CanonError::AlreadyResolved(id));
        }
        match (status, canonical_fact) {
            (ProposalStatus::Pending, _) => {
                return Err(CanonError::validation(
                    "a proposal cannot be resolved to pending",
                ))
            }
            (ProposalStatus::Accepted, None) => {
                return Err(CanonError::validation(format!(
                    "accepted proposal {id} needs a canonical fact id"
                )))
            }
            (ProposalStatus::Rejected, Some(_)) => {
                return Err(CanonError::validation(format!(
                    "rejected proposal {id} cannot reference a canonical fact"
                )))
            }
            _ => {}
        }

        match self
            .staging
            .resolve(id, status, canonical_fact, Utc::now())
            .await?
        {
            ResolveOutcome::Resolved(proposal) => Ok(proposal),
            ResolveOutcome::Missing => Err(CanonError::not_found("proposal", id)),
            ResolveOutcome::AlreadyResolved(_) => Err(CanonError::AlreadyResolved(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::Assertion;
    use crate::backend::MemoryStagingStore;

    fn store() -> ProposalStore {
        ProposalStore::new(Arc::new(MemoryStagingStore::new()))
    }

    fn draft(scope: &str, statement: &str) -> ProposalDraft {
        ProposalDraft::new(
            scope,
            "gm",
            Assertion::Fact {
                subject: "Riverside".into(),
                statement: statement.into(),
            },
        )
        .citing("e1")
    }

    #[tokio::test]
    async fn test_empty_evidence_rejected_at_submit() {
        let store = store();
        let draft = ProposalDraft::new(
            "scene-1",
            "gm",
            Assertion::Fact {
                subject: "Riverside".into(),
                statement: "is flooded".into(),
            },
        );
        let err = store.submit(draft).await.unwrap_err();
        assert!(matches!(err, CanonError::Validation { .. }));
        assert!(store
            .pending_for(&ScopeId::new("scene-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_authority_rejected() {
        let store = store();
        let mut d = draft("scene-1", "is flooded");
        d.authority = "oracle".into();
        assert!(matches!(
            store.submit(d).await,
            Err(CanonError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_for_keeps_insertion_order_per_scope() {
        let store = store();
        let a = store.submit(draft("scene-1", "first")).await.unwrap();
        let _other = store.submit(draft("scene-2", "elsewhere")).await.unwrap();
        let b = store.submit(draft("scene-1", "second")).await.unwrap();

        let scope = ScopeId::new("scene-1");
        let ids: Vec<_> = store
            .pending_for(&scope)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![a, b]);

        // Restartable: a second read yields the same sequence.
        let again: Vec<_> = store
            .pending_for(&scope)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, again);
    }

    #[tokio::test]
    async fn test_resolution_is_write_once() {
        let store = store();
        let id = store.submit(draft("scene-1", "is flooded")).await.unwrap();

        let resolved = store
            .mark_resolved(id, ProposalStatus::Rejected, None)
            .await
            .unwrap();
        assert_eq!(resolved.status, ProposalStatus::Rejected);
        assert!(resolved.resolved_at.is_some());

        let err = store
            .mark_resolved(id, ProposalStatus::Accepted, Some(FactId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CanonError::AlreadyResolved(x) if x == id));

        let scope = ScopeId::new("scene-1");
        assert!(store.pending_for(&scope).await.unwrap().is_empty());
        assert_eq!(store.history_for(&scope).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_proposal() {
        let store = store();
        let err = store
            .mark_resolved(ProposalId::new(), ProposalStatus::Rejected, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CanonError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_proposal_reported_before_bad_status() {
        let store = store();
        let err = store
            .mark_resolved(ProposalId::new(), ProposalStatus::Rejected, Some(FactId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CanonError::NotFound { .. }));

        let err = store
            .mark_resolved(ProposalId::new(), ProposalStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CanonError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_accepted_requires_fact_id() {
        let store = store();
        let id = store.submit(draft("scene-1", "is flooded")).await.unwrap();
        let err = store
            .mark_resolved(id, ProposalStatus::Accepted, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CanonError::Validation { .. }));
        assert!(store.get(id).await.unwrap().is_pending());
    }
}
