//! The commit coordinator: the only writer of canonical facts.

use super::batch::{BatchResult, BatchState, ScopeBatch};
use super::plan::CommitPlan;
use super::retry::with_retry;
use crate::backend::{Atomicity, BatchLedger, CanonicalStore, DerivedIndex};
use crate::config::RetryPolicy;
use crate::error::{CanonError, CanonResult, StoreError};
use crate::evaluator::ResolvedDecision;
use crate::id::{ProposalId, ScopeId};
use crate::ledger::RetconChain;
use crate::proposal::{ProposalStatus, ProposalStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, instrument, warn, Instrument, Span};

type ScopeLocks = Arc<Mutex<HashMap<ScopeId, Arc<tokio::sync::Mutex<()>>>>>;

/// Exclusive hold on one scope. The lock entry is dropped from the map when
/// the last holder or waiter lets go.
pub(crate) struct ScopeGuard {
    scope: ScopeId,
    locks: ScopeLocks,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by `_guard`.
        if locks
            .get(&self.scope)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            locks.remove(&self.scope);
        }
    }
}

/// Applies a scope's decisions to the canonical store as one atomic unit.
///
/// Finalizes of one scope are serialized; different scopes commit in
/// parallel. A `committing` marker is written before any canonical write, so
/// an interrupted batch is resumed rather than repeated.
#[derive(Clone)]
pub struct CommitCoordinator {
    canon: Arc<dyn CanonicalStore>,
    proposals: ProposalStore,
    index: Arc<dyn DerivedIndex>,
    ledger: Arc<dyn BatchLedger>,
    retcons: RetconChain,
    retry: RetryPolicy,
    locks: ScopeLocks,
}

impl CommitCoordinator {
    pub fn new(
        canon: Arc<dyn CanonicalStore>,
        proposals: ProposalStore,
        index: Arc<dyn DerivedIndex>,
        ledger: Arc<dyn BatchLedger>,
    ) -> Self {
        Self {
            retcons: RetconChain::new(canon.clone()),
            canon,
            proposals,
            index,
            ledger,
            retry: RetryPolicy::default(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The stored marker of a scope, if any.
    pub async fn batch(&self, scope: &ScopeId) -> CanonResult<Option<ScopeBatch>> {
        Ok(self.ledger.get(scope).await?)
    }

    /// Commit a scope's decided proposals.
    ///
    /// A scope that was already finalized returns its stored result. A scope
    /// left `committing` by an interrupted run is completed from its recorded
    /// plan; `decisions` is ignored in both cases.
    pub async fn commit_batch(
        &self,
        scope: &ScopeId,
        decisions: Vec<ResolvedDecision>,
    ) -> CanonResult<BatchResult> {
        let guard = self.lock_scope(scope).await;
        self.commit_locked(guard, scope, decisions).await
    }

    /// Take the commit lock of a scope.
    pub(crate) async fn lock_scope(&self, scope: &ScopeId) -> ScopeGuard {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(scope.clone())
            .or_default()
            .clone();
        ScopeGuard {
            scope: scope.clone(),
            locks: self.locks.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    /// `commit_batch` for a caller already holding the scope lock.
    #[instrument(skip(self, guard, decisions), fields(scope = %scope, decisions = decisions.len()))]
    pub(crate) async fn commit_locked(
        &self,
        guard: ScopeGuard,
        scope: &ScopeId,
        decisions: Vec<ResolvedDecision>,
    ) -> CanonResult<BatchResult> {
        match self.ledger.get(scope).await? {
            Some(ScopeBatch {
                state: BatchState::Finalized { result },
                ..
            }) => {
                info!(
                    accepted = result.accepted_fact_ids.len(),
                    rejected = result.rejected_proposal_ids.len(),
                    "scope already finalized, replaying result"
                );
                return Ok(result);
            }
            Some(batch) => {
                warn!(proposals = batch.proposals.len(), "resuming interrupted batch");
                return self.spawn_commit(batch, guard, true).await;
            }
            None => {}
        }

        if decisions.is_empty() {
            return Err(CanonError::EmptyBatch(scope.clone()));
        }
        let in_flight: Vec<ProposalId> = decisions.iter().map(|d| d.proposal.id).collect();

        let (proposals, retcons) = (&self.proposals, &self.retcons);
        let decisions = &decisions;
        let plan = with_retry(&self.retry, "plan batch", move || {
            CommitPlan::build(scope, decisions, proposals, retcons)
        })
        .await
        .map_err(|e| abort(scope, in_flight.clone(), e))?;

        let batch = ScopeBatch::committing(scope.clone(), plan);
        let ledger = &self.ledger;
        let marker = &batch;
        with_retry(&self.retry, "write batch marker", move || async move {
            Ok(ledger.put(marker).await?)
        })
        .await
        .map_err(|e| abort(scope, in_flight, e))?;

        self.spawn_commit(batch, guard, false).await
    }

    /// Scopes whose commit lock is currently held or awaited.
    pub fn tracked_scopes(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run the rest of the commit in its own task.
    ///
    /// Once the marker is written, dropping the caller's future must not stop
    /// the write halfway; the task owns the scope lock until it finishes.
    async fn spawn_commit(
        &self,
        batch: ScopeBatch,
        guard: ScopeGuard,
        resuming: bool,
    ) -> CanonResult<BatchResult> {
        let this = self.clone();
        let scope = batch.scope.clone();
        let task = tokio::spawn(
            async move {
                let _guard = guard;
                this.run_commit(batch, resuming).await
            }
            .instrument(Span::current()),
        );
        match task.await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Permanent(format!(
                "commit task for scope {scope} did not complete: {e}"
            ))
            .into()),
        }
    }

    async fn run_commit(&self, batch: ScopeBatch, resuming: bool) -> CanonResult<BatchResult> {
        let scope = batch.scope.clone();
        let plan = match &batch.state {
            BatchState::Committing { plan } => plan.clone(),
            BatchState::Finalized { result } => return Ok(result.clone()),
        };

        let applied = resuming && self.already_applied(&plan).await?;
        if !applied {
            let this = self;
            let plan_ref = &plan;
            if let Err(e) =
                with_retry(&self.retry, "canonical write", move || this.apply(plan_ref)).await
            {
                self.abandon(&scope, &plan).await;
                return Err(abort(&scope, plan.in_flight(), e));
            }
            info!(
                accepted = plan.accepted.len(),
                rejected = plan.rejected.len(),
                "batch committed"
            );
        } else {
            info!("canonical write already applied, finishing batch");
        }

        self.signal_index(&plan).await;
        self.resolve_proposals(&plan).await?;

        let result = plan.result(&scope);
        let finalized = batch.finalize(result.clone());
        let ledger = &self.ledger;
        let marker = &finalized;
        with_retry(&self.retry, "finalize batch marker", move || async move {
            Ok(ledger.put(marker).await?)
        })
        .await?;
        Ok(result)
    }

    /// Whether a recorded plan already reached the canonical store.
    async fn already_applied(&self, plan: &CommitPlan) -> CanonResult<bool> {
        let mut visible = 0;
        for planned in &plan.accepted {
            if let Some(fact) = self.canon.fact(planned.fact.id).await? {
                if fact.level.is_visible() {
                    visible += 1;
                }
            }
        }
        match visible {
            0 if plan.has_writes() => Ok(false),
            n if n == plan.accepted.len() => Ok(true),
            n => Err(StoreError::Permanent(format!(
                "batch partially visible: {n} of {} facts",
                plan.accepted.len()
            ))
            .into()),
        }
    }

    async fn apply(&self, plan: &CommitPlan) -> CanonResult<()> {
        if !plan.has_writes() {
            return Ok(());
        }
        match self.canon.atomicity() {
            Atomicity::Transactional => {
                self.canon.write(&plan.transactional_ops()).await?;
            }
            Atomicity::StatusFlip => {
                let staged = plan.fact_ids();
                // Leftovers from an earlier attempt.
                self.canon.discard_staged(&staged).await?;
                let outcome = match self.canon.write(&plan.stage_ops()).await {
                    Ok(()) => self.canon.flip(&plan.flip_ops()).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    if let Err(discard) = self.canon.discard_staged(&staged).await {
                        warn!(error = %discard, "failed to discard staged facts");
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Undo what an aborted batch left behind.
    async fn abandon(&self, scope: &ScopeId, plan: &CommitPlan) {
        if plan.has_writes() && self.canon.atomicity() == Atomicity::StatusFlip {
            if let Err(e) = self.canon.discard_staged(&plan.fact_ids()).await {
                warn!(error = %e, "failed to discard staged facts of aborted batch");
            }
        }
        if let Err(e) = self.ledger.clear(scope).await {
            warn!(error = %e, "failed to clear marker of aborted batch");
        }
    }

    /// Flag touched partitions stale. The index is derived, so a failure
    /// after retries is logged and `IndexResync` stays the fallback.
    async fn signal_index(&self, plan: &CommitPlan) {
        let partitions = plan.partitions();
        if partitions.is_empty() {
            return;
        }
        let index = &self.index;
        let marked = &partitions;
        let outcome = with_retry(&self.retry, "mark index stale", move || async move {
            Ok(index.mark_stale(marked).await?)
        })
        .await;
        if let Err(e) = outcome {
            warn!(error = %e, partitions = partitions.len(), "failed to mark index partitions stale");
        }
    }

    /// Record every decision. Already-resolved proposals are left as they are,
    /// which makes a resumed batch safe to finish.
    async fn resolve_proposals(&self, plan: &CommitPlan) -> CanonResult<()> {
        let accepted = plan
            .accepted
            .iter()
            .map(|p| (p.proposal, ProposalStatus::Accepted, Some(p.fact.id)));
        let rejected = plan
            .rejected
            .iter()
            .map(|id| (*id, ProposalStatus::Rejected, None));

        for (id, status, fact) in accepted.chain(rejected) {
            let proposals = &self.proposals;
            let outcome = with_retry(&self.retry, "resolve proposal", move || {
                proposals.mark_resolved(id, status, fact)
            })
            .await;
            match outcome {
                Ok(_) | Err(CanonError::AlreadyResolved(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn abort(scope: &ScopeId, in_flight: Vec<ProposalId>, source: CanonError) -> CanonError {
    warn!(error = %source, in_flight = in_flight.len(), "batch aborted");
    CanonError::BatchAborted {
        scope: scope.clone(),
        in_flight,
        source: Box::new(source),
    }
}
