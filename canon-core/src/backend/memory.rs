//! In-memory implementations of the store interfaces.
//!
//! These back the unit and integration tests, and are usable as a
//! single-process engine. `MemoryCanonStore` can pose as either kind of
//! canonical store so both commit paths get exercised.

use super::{
    Atomicity, BatchLedger, CanonOp, CanonicalStore, DerivedIndex, ResolveOutcome, StagingStore,
};
use crate::assertion::PartitionKey;
use crate::commit::ScopeBatch;
use crate::error::StoreError;
use crate::fact::{CanonLevel, CanonicalFact, ProvenanceEdge, RetconRecord};
use crate::id::{FactId, ProposalId, ScopeId};
use crate::proposal::{Proposal, ProposalStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

// =============================================================================
// Canonical store
// =============================================================================

#[derive(Debug, Clone, Default)]
struct CanonGraph {
    facts: HashMap<FactId, CanonicalFact>,
    edges: Vec<ProvenanceEdge>,
    retcons: Vec<RetconRecord>,
}

impl CanonGraph {
    fn apply(&mut self, op: &CanonOp) -> Result<(), StoreError> {
        match op {
            CanonOp::CreateFact(fact) => {
                if self.facts.contains_key(&fact.id) {
                    return Err(StoreError::Conflict(format!("fact {} already exists", fact.id)));
                }
                self.facts.insert(fact.id, fact.clone());
            }
            CanonOp::CreateEdge(edge) => {
                let fact = self.facts.get_mut(&edge.fact).ok_or_else(|| {
                    StoreError::Permanent(format!("edge {} targets unknown fact {}", edge.id, edge.fact))
                })?;
                if !fact.evidence.contains(&edge.id) {
                    fact.evidence.push(edge.id);
                }
                self.edges.push(edge.clone());
            }
            CanonOp::SetLevel { fact, level } => {
                let record = self
                    .facts
                    .get_mut(fact)
                    .ok_or_else(|| StoreError::Permanent(format!("unknown fact {fact}")))?;
                record
                    .transition(*level)
                    .map_err(|e| StoreError::Conflict(e.to_string()))?;
            }
            CanonOp::RecordRetcon(retcon) => {
                if !self.facts.contains_key(&retcon.new_fact) {
                    return Err(StoreError::Permanent(format!(
                        "retcon targets unknown fact {}",
                        retcon.new_fact
                    )));
                }
                let old = self.facts.get_mut(&retcon.old_fact).ok_or_else(|| {
                    StoreError::Permanent(format!("unknown fact {}", retcon.old_fact))
                })?;
                if old.superseded_by.is_some() {
                    return Err(StoreError::Conflict(format!(
                        "fact {} is already superseded",
                        retcon.old_fact
                    )));
                }
                old.superseded_by = Some(retcon.new_fact);
                self.retcons.push(retcon.clone());
            }
        }
        Ok(())
    }
}

/// In-memory canonical graph.
#[derive(Debug)]
pub struct MemoryCanonStore {
    atomicity: Atomicity,
    graph: RwLock<CanonGraph>,
}

impl MemoryCanonStore {
    /// A store with native multi-write transactions.
    pub fn transactional() -> Self {
        Self::with_atomicity(Atomicity::Transactional)
    }

    /// A store that only offers the atomic status flip.
    pub fn status_flip() -> Self {
        Self::with_atomicity(Atomicity::StatusFlip)
    }

    /// A store with the given guarantee.
    pub fn with_atomicity(atomicity: Atomicity) -> Self {
        Self {
            atomicity,
            graph: RwLock::new(CanonGraph::default()),
        }
    }

    /// Number of facts at any level.
    pub async fn fact_count(&self) -> usize {
        self.graph.read().await.facts.len()
    }

    /// Every retcon record in the order it was written.
    pub async fn retcons(&self) -> Vec<RetconRecord> {
        self.graph.read().await.retcons.clone()
    }
}

impl Default for MemoryCanonStore {
    fn default() -> Self {
        Self::transactional()
    }
}

#[async_trait]
impl CanonicalStore for MemoryCanonStore {
    fn atomicity(&self) -> Atomicity {
        self.atomicity
    }

    async fn write(&self, ops: &[CanonOp]) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        match self.atomicity {
            Atomicity::Transactional => {
                let mut scratch = graph.clone();
                for op in ops {
                    scratch.apply(op)?;
                }
                *graph = scratch;
            }
            Atomicity::StatusFlip => {
                for op in ops {
                    graph.apply(op)?;
                }
            }
        }
        Ok(())
    }

    async fn flip(&self, ops: &[CanonOp]) -> Result<(), StoreError> {
        if ops.iter().any(|op| !op.is_flip_op()) {
            return Err(StoreError::Unsupported(
                "a status flip carries only level and retcon ops",
            ));
        }
        let mut graph = self.graph.write().await;
        let mut scratch = graph.clone();
        for op in ops {
            scratch.apply(op)?;
        }
        *graph = scratch;
        Ok(())
    }

    async fn discard_staged(&self, facts: &[FactId]) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        let doomed: BTreeSet<FactId> = facts
            .iter()
            .copied()
            .filter(|id| {
                graph
                    .facts
                    .get(id)
                    .is_some_and(|f| f.level == CanonLevel::PendingCommit)
            })
            .collect();
        graph.facts.retain(|id, _| !doomed.contains(id));
        graph.edges.retain(|e| !doomed.contains(&e.fact));
        Ok(())
    }

    async fn fact(&self, id: FactId) -> Result<Option<CanonicalFact>, StoreError> {
        Ok(self.graph.read().await.facts.get(&id).cloned())
    }

    async fn edges_for(&self, fact: FactId) -> Result<Vec<ProvenanceEdge>, StoreError> {
        Ok(self
            .graph
            .read()
            .await
            .edges
            .iter()
            .filter(|e| e.fact == fact)
            .cloned()
            .collect())
    }

    async fn retcon_replacing(&self, old: FactId) -> Result<Option<RetconRecord>, StoreError> {
        Ok(self
            .graph
            .read()
            .await
            .retcons
            .iter()
            .find(|r| r.old_fact == old)
            .cloned())
    }

    async fn retcon_creating(&self, new: FactId) -> Result<Option<RetconRecord>, StoreError> {
        Ok(self
            .graph
            .read()
            .await
            .retcons
            .iter()
            .find(|r| r.new_fact == new)
            .cloned())
    }

    async fn facts(&self) -> Result<Vec<CanonicalFact>, StoreError> {
        let graph = self.graph.read().await;
        let mut facts: Vec<_> = graph.facts.values().cloned().collect();
        facts.sort_by_key(|f| f.created_at);
        Ok(facts)
    }
}

// =============================================================================
// Staging store
// =============================================================================

#[derive(Debug, Default)]
struct StagingState {
    proposals: HashMap<ProposalId, Proposal>,
    /// Insertion order per scope.
    by_scope: HashMap<ScopeId, Vec<ProposalId>>,
}

/// In-memory narrative staging store.
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    state: RwLock<StagingState>,
}

impl MemoryStagingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn insert(&self, proposal: Proposal) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.proposals.contains_key(&proposal.id) {
            return Err(StoreError::Conflict(format!(
                "proposal {} already staged",
                proposal.id
            )));
        }
        state
            .by_scope
            .entry(proposal.scope.clone())
            .or_default()
            .push(proposal.id);
        state.proposals.insert(proposal.id, proposal);
        Ok(())
    }

    async fn get(&self, id: ProposalId) -> Result<Option<Proposal>, StoreError> {
        Ok(self.state.read().await.proposals.get(&id).cloned())
    }

    async fn by_scope(&self, scope: &ScopeId) -> Result<Vec<Proposal>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_scope
            .get(scope)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.proposals.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn resolve(
        &self,
        id: ProposalId,
        status: ProposalStatus,
        fact: Option<FactId>,
        at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, StoreError> {
        let mut state = self.state.write().await;
        let Some(proposal) = state.proposals.get_mut(&id) else {
            return Ok(ResolveOutcome::Missing);
        };
        if proposal.status.is_terminal() {
            return Ok(ResolveOutcome::AlreadyResolved(proposal.clone()));
        }
        proposal.status = status;
        proposal.canonical_fact = fact;
        proposal.resolved_at = Some(at);
        Ok(ResolveOutcome::Resolved(proposal.clone()))
    }
}

// =============================================================================
// Derived index
// =============================================================================

#[derive(Debug, Default)]
struct IndexState {
    stale: BTreeSet<PartitionKey>,
    partitions: HashMap<PartitionKey, Vec<FactId>>,
}

/// In-memory stand-in for the derived semantic index.
///
/// It stores only which facts each partition was last rebuilt with.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: RwLock<IndexState>,
}

impl MemoryIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Facts a partition was last rebuilt with.
    pub async fn partition(&self, key: &PartitionKey) -> Vec<FactId> {
        self.state
            .read()
            .await
            .partitions
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DerivedIndex for MemoryIndex {
    async fn mark_stale(&self, partitions: &[PartitionKey]) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .stale
            .extend(partitions.iter().cloned());
        Ok(())
    }

    async fn stale_partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        Ok(self.state.read().await.stale.iter().cloned().collect())
    }

    async fn rebuild(
        &self,
        partition: &PartitionKey,
        facts: &[CanonicalFact],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .partitions
            .insert(partition.clone(), facts.iter().map(|f| f.id).collect());
        state.stale.remove(partition);
        Ok(())
    }
}

// =============================================================================
// Batch ledger
// =============================================================================

/// Non-durable batch ledger for tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct MemoryBatchLedger {
    batches: RwLock<HashMap<ScopeId, ScopeBatch>>,
}

impl MemoryBatchLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchLedger for MemoryBatchLedger {
    async fn get(&self, scope: &ScopeId) -> Result<Option<ScopeBatch>, StoreError> {
        Ok(self.batches.read().await.get(scope).cloned())
    }

    async fn put(&self, batch: &ScopeBatch) -> Result<(), StoreError> {
        self.batches
            .write()
            .await
            .insert(batch.scope.clone(), batch.clone());
        Ok(())
    }

    async fn clear(&self, scope: &ScopeId) -> Result<(), StoreError> {
        self.batches.write().await.remove(scope);
        Ok(())
    }
}
