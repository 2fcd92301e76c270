//! Testing utilities for the canonization engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedJudge` for deterministic judgments without API calls
//! - `FlakyCanonStore` for injecting store failures and counting writes
//! - `FailingIndex` and `FlakyIndex` for derived-index outages
//! - `TestEngine` wiring in-memory stores to a gate

use crate::assertion::{Assertion, Authority, PartitionKey};
use crate::backend::{
    Atomicity, CanonOp, CanonicalStore, DerivedIndex, MemoryBatchLedger, MemoryCanonStore,
    MemoryIndex, MemoryStagingStore,
};
use crate::commit::{BatchResult, CommitCoordinator};
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{CanonResult, JudgeError, StoreError};
use crate::evaluator::Evaluator;
use crate::fact::{CanonLevel, CanonicalFact, ProvenanceEdge, RetconRecord};
use crate::gate::CanonizationGate;
use crate::id::{FactId, ProposalId, ScopeId};
use crate::judge::ExternalJudge;
use crate::proposal::{Proposal, ProposalDraft, ProposalStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A committed fact with no edges, for store-level tests.
pub fn canon_fact(subject: &str, statement: &str) -> CanonicalFact {
    let assertion = Assertion::Fact {
        subject: subject.into(),
        statement: statement.into(),
    };
    CanonicalFact {
        id: FactId::new(),
        statement: assertion.statement(),
        assertion,
        authority: Authority::Gm,
        confidence: 1.0,
        level: CanonLevel::Canon,
        evidence: Vec::new(),
        scope: ScopeId::new("test"),
        origin: ProposalId::new(),
        created_at: Utc::now(),
        superseded_by: None,
    }
}

/// A simple fact draft citing one document.
pub fn fact_draft(
    scope: &str,
    authority: &str,
    confidence: f64,
    subject: &str,
    statement: &str,
) -> ProposalDraft {
    ProposalDraft::new(
        scope,
        authority,
        Assertion::Fact {
            subject: subject.into(),
            statement: statement.into(),
        },
    )
    .with_confidence(confidence)
    .citing(format!("transcript:{scope}"))
}

// =============================================================================
// Judges
// =============================================================================

/// A scripted answer from the judge.
#[derive(Debug, Clone)]
pub enum JudgeReply {
    Accept,
    Reject,
    Fail(JudgeError),
    /// Never answer; only the gate's timeout ends the call.
    Hang,
}

/// A judge that answers from a script keyed by proposal statement.
pub struct ScriptedJudge {
    replies: Mutex<HashMap<String, Vec<JudgeReply>>>,
    fallback: JudgeReply,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedJudge {
    /// A judge giving `fallback` to anything not scripted.
    pub fn new(fallback: JudgeReply) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Script replies for a statement, consumed in order; the last one sticks.
    pub async fn script(&self, statement: impl Into<String>, replies: Vec<JudgeReply>) {
        self.replies.lock().await.insert(statement.into(), replies);
    }

    /// Wait this long before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of judgments requested.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most judgments ever in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn next_reply(&self, statement: &str) -> JudgeReply {
        let mut replies = self.replies.lock().await;
        match replies.get_mut(statement) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue.first().cloned().unwrap_or_else(|| self.fallback.clone()),
            None => self.fallback.clone(),
        }
    }
}

#[async_trait]
impl ExternalJudge for ScriptedJudge {
    async fn judge(&self, proposal: &Proposal, _timeout: Duration) -> Result<bool, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let reply = self.next_reply(&proposal.payload.assertion.statement()).await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = match reply {
            JudgeReply::Accept => Ok(true),
            JudgeReply::Reject => Ok(false),
            JudgeReply::Fail(e) => Err(e),
            JudgeReply::Hang => std::future::pending::<Result<bool, JudgeError>>().await,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// =============================================================================
// Stores
// =============================================================================

/// Wraps an in-memory canonical store with fault injection and counters.
pub struct FlakyCanonStore {
    inner: MemoryCanonStore,
    transient_failures: AtomicU32,
    fail_writes: AtomicBool,
    fail_flips: AtomicBool,
    writes: AtomicUsize,
    flips: AtomicUsize,
}

impl FlakyCanonStore {
    pub fn new(inner: MemoryCanonStore) -> Self {
        Self {
            inner,
            transient_failures: AtomicU32::new(0),
            fail_writes: AtomicBool::new(false),
            fail_flips: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            flips: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` writes or flips with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every write with a permanent error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail every flip with a permanent error until reset.
    pub fn fail_flips(&self, fail: bool) {
        self.fail_flips.store(fail, Ordering::SeqCst);
    }

    /// Successful `write` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Successful `flip` calls.
    pub fn flips(&self) -> usize {
        self.flips.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    pub fn inner(&self) -> &MemoryCanonStore {
        &self.inner
    }

    fn take_transient(&self) -> Result<(), StoreError> {
        let taken = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Transient("injected transient failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl CanonicalStore for FlakyCanonStore {
    fn atomicity(&self) -> Atomicity {
        self.inner.atomicity()
    }

    async fn write(&self, ops: &[CanonOp]) -> Result<(), StoreError> {
        self.take_transient()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Permanent("injected write failure".into()));
        }
        self.inner.write(ops).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flip(&self, ops: &[CanonOp]) -> Result<(), StoreError> {
        self.take_transient()?;
        if self.fail_flips.load(Ordering::SeqCst) {
            return Err(StoreError::Permanent("injected flip failure".into()));
        }
        self.inner.flip(ops).await?;
        self.flips.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discard_staged(&self, facts: &[FactId]) -> Result<(), StoreError> {
        self.inner.discard_staged(facts).await
    }

    async fn fact(&self, id: FactId) -> Result<Option<CanonicalFact>, StoreError> {
        self.inner.fact(id).await
    }

    async fn edges_for(&self, fact: FactId) -> Result<Vec<ProvenanceEdge>, StoreError> {
        self.inner.edges_for(fact).await
    }

    async fn retcon_replacing(&self, old: FactId) -> Result<Option<RetconRecord>, StoreError> {
        self.inner.retcon_replacing(old).await
    }

    async fn retcon_creating(&self, new: FactId) -> Result<Option<RetconRecord>, StoreError> {
        self.inner.retcon_creating(new).await
    }

    async fn facts(&self) -> Result<Vec<CanonicalFact>, StoreError> {
        self.inner.facts().await
    }
}

/// An index that is always down.
#[derive(Debug, Default)]
pub struct FailingIndex;

#[async_trait]
impl DerivedIndex for FailingIndex {
    async fn mark_stale(&self, _partitions: &[PartitionKey]) -> Result<(), StoreError> {
        Err(StoreError::Permanent("index offline".into()))
    }

    async fn stale_partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        Err(StoreError::Permanent("index offline".into()))
    }

    async fn rebuild(
        &self,
        _partition: &PartitionKey,
        _facts: &[CanonicalFact],
    ) -> Result<(), StoreError> {
        Err(StoreError::Permanent("index offline".into()))
    }
}

/// Wraps an in-memory index, failing the next `n` stale marks transiently.
pub struct FlakyIndex {
    inner: Arc<MemoryIndex>,
    transient_failures: AtomicU32,
}

impl FlakyIndex {
    pub fn new(inner: Arc<MemoryIndex>, failures: u32) -> Self {
        Self {
            inner,
            transient_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl DerivedIndex for FlakyIndex {
    async fn mark_stale(&self, partitions: &[PartitionKey]) -> Result<(), StoreError> {
        let taken = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(StoreError::Transient("index busy".into()));
        }
        self.inner.mark_stale(partitions).await
    }

    async fn stale_partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        self.inner.stale_partitions().await
    }

    async fn rebuild(
        &self,
        partition: &PartitionKey,
        facts: &[CanonicalFact],
    ) -> Result<(), StoreError> {
        self.inner.rebuild(partition, facts).await
    }
}

// =============================================================================
// Engine harness
// =============================================================================

/// Retry quickly so failure tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    }
}

/// A complete engine over in-memory stores.
pub struct TestEngine {
    pub canon: Arc<FlakyCanonStore>,
    pub proposals: ProposalStore,
    pub index: Arc<MemoryIndex>,
    pub ledger: Arc<MemoryBatchLedger>,
    pub coordinator: CommitCoordinator,
    pub gate: CanonizationGate,
}

impl TestEngine {
    /// An engine over a transactional canonical store.
    pub fn new() -> Self {
        Self::with_atomicity(Atomicity::Transactional)
    }

    /// An engine over a canonical store with the given guarantee.
    pub fn with_atomicity(atomicity: Atomicity) -> Self {
        let index = Arc::new(MemoryIndex::new());
        Self::build(atomicity, index.clone(), index)
    }

    /// An engine whose derived index rejects every call.
    pub fn with_failing_index(atomicity: Atomicity) -> Self {
        Self::build(atomicity, Arc::new(MemoryIndex::new()), Arc::new(FailingIndex))
    }

    /// An engine whose derived index fails its first `failures` stale marks.
    pub fn with_flaky_index(failures: u32) -> Self {
        let index = Arc::new(MemoryIndex::new());
        let flaky = Arc::new(FlakyIndex::new(index.clone(), failures));
        Self::build(Atomicity::Transactional, index, flaky)
    }

    fn build(
        atomicity: Atomicity,
        index: Arc<MemoryIndex>,
        signalled: Arc<dyn DerivedIndex>,
    ) -> Self {
        let canon = Arc::new(FlakyCanonStore::new(MemoryCanonStore::with_atomicity(
            atomicity,
        )));
        let proposals = ProposalStore::new(Arc::new(MemoryStagingStore::new()));
        let ledger = Arc::new(MemoryBatchLedger::new());
        let coordinator =
            CommitCoordinator::new(canon.clone(), proposals.clone(), signalled, ledger.clone())
                .with_retry(fast_retry());
        let gate = CanonizationGate::new(
            proposals.clone(),
            Evaluator::default(),
            coordinator.clone(),
        )
        .with_config(EngineConfig::default().with_retry(fast_retry()));
        Self {
            canon,
            proposals,
            index,
            ledger,
            coordinator,
            gate,
        }
    }

    /// Consult `judge` for deferred proposals.
    pub fn with_judge(mut self, judge: Arc<dyn ExternalJudge>) -> Self {
        self.gate = self.gate.with_judge(judge);
        self
    }

    /// Replace the gate's configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.gate = self.gate.with_config(config);
        self
    }

    /// Submit a draft.
    pub async fn submit(&self, draft: ProposalDraft) -> CanonResult<ProposalId> {
        self.proposals.submit(draft).await
    }

    /// Finalize a scope through the gate.
    pub async fn finalize(&self, scope: &str) -> CanonResult<BatchResult> {
        self.gate.finalize_scope(&ScopeId::new(scope)).await
    }

    /// Read a fact at any level.
    pub async fn fact(&self, id: FactId) -> CanonResult<Option<CanonicalFact>> {
        Ok(self.canon.fact(id).await?)
    }

    /// Number of facts at any level.
    pub async fn fact_count(&self) -> usize {
        self.canon.inner().fact_count().await
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Assert that a fact exists at `level`.
pub async fn assert_level(engine: &TestEngine, fact: FactId, level: CanonLevel) {
    let found = engine.fact(fact).await.ok().flatten();
    assert_eq!(
        found.map(|f| f.level),
        Some(level),
        "expected fact {fact} at level {level}"
    );
}
