//! Interfaces to the stores the engine writes through.
//!
//! The engine never talks to a database driver directly. It is handed these
//! capabilities at construction, which lets tests substitute the in-memory
//! doubles in [`memory`].

pub mod memory;
pub mod persist;

use crate::assertion::PartitionKey;
use crate::commit::ScopeBatch;
use crate::error::StoreError;
use crate::fact::{CanonLevel, CanonicalFact, ProvenanceEdge, RetconRecord};
use crate::id::{FactId, ProposalId, ScopeId};
use crate::proposal::{Proposal, ProposalStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::{MemoryBatchLedger, MemoryCanonStore, MemoryIndex, MemoryStagingStore};
pub use persist::{JsonBatchLedger, PersistError};

/// A single write against the canonical graph.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonOp {
    /// Create a fact node.
    CreateFact(CanonicalFact),
    /// Create a provenance edge from an existing fact node.
    CreateEdge(ProvenanceEdge),
    /// Move a fact to a new canon level.
    SetLevel { fact: FactId, level: CanonLevel },
    /// Record a supersession and set the old fact's back-reference.
    RecordRetcon(RetconRecord),
}

impl CanonOp {
    /// True for the ops a status flip may carry.
    pub fn is_flip_op(&self) -> bool {
        matches!(self, CanonOp::SetLevel { .. } | CanonOp::RecordRetcon(_))
    }
}

/// What multi-record guarantee a canonical store offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomicity {
    /// `write` applies all ops or none.
    Transactional,
    /// `write` applies ops one by one; only `flip` is atomic.
    StatusFlip,
}

/// The graph-structured store that holds canonical truth.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Guarantee offered by [`CanonicalStore::write`].
    fn atomicity(&self) -> Atomicity;

    /// Apply ops in order. All-or-nothing only for transactional stores.
    async fn write(&self, ops: &[CanonOp]) -> Result<(), StoreError>;

    /// Apply level and retcon ops as one atomic status flip.
    async fn flip(&self, ops: &[CanonOp]) -> Result<(), StoreError>;

    /// Remove facts still at `pending-commit` (and their edges). Facts at any
    /// other level are left alone.
    async fn discard_staged(&self, facts: &[FactId]) -> Result<(), StoreError>;

    /// Read a fact regardless of level.
    async fn fact(&self, id: FactId) -> Result<Option<CanonicalFact>, StoreError>;

    /// Provenance edges of a fact, oldest first.
    async fn edges_for(&self, fact: FactId) -> Result<Vec<ProvenanceEdge>, StoreError>;

    /// The record in which `old` was superseded, if any.
    async fn retcon_replacing(&self, old: FactId) -> Result<Option<RetconRecord>, StoreError>;

    /// The record in which `new` superseded something, if any.
    async fn retcon_creating(&self, new: FactId) -> Result<Option<RetconRecord>, StoreError>;

    /// Every fact in the store.
    async fn facts(&self) -> Result<Vec<CanonicalFact>, StoreError>;
}

/// Outcome of a write-once status update.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// The proposal moved to its terminal status.
    Resolved(Proposal),
    /// No proposal with that id.
    Missing,
    /// The proposal was already terminal; nothing changed.
    AlreadyResolved(Proposal),
}

/// The narrative staging store backing [`crate::proposal::ProposalStore`].
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Insert a new proposal.
    async fn insert(&self, proposal: Proposal) -> Result<(), StoreError>;

    /// Read one proposal.
    async fn get(&self, id: ProposalId) -> Result<Option<Proposal>, StoreError>;

    /// All proposals of a scope in insertion order.
    async fn by_scope(&self, scope: &ScopeId) -> Result<Vec<Proposal>, StoreError>;

    /// Conditionally move a pending proposal to a terminal status.
    async fn resolve(
        &self,
        id: ProposalId,
        status: ProposalStatus,
        fact: Option<FactId>,
        at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, StoreError>;
}

/// The derived semantic index. Never a source of truth.
#[async_trait]
pub trait DerivedIndex: Send + Sync {
    /// Flag partitions whose contents no longer match canon.
    async fn mark_stale(&self, partitions: &[PartitionKey]) -> Result<(), StoreError>;

    /// Partitions currently flagged stale.
    async fn stale_partitions(&self) -> Result<Vec<PartitionKey>, StoreError>;

    /// Replace a partition's contents and clear its stale flag.
    async fn rebuild(
        &self,
        partition: &PartitionKey,
        facts: &[CanonicalFact],
    ) -> Result<(), StoreError>;
}

/// Durable home of scope batch markers (the batch idempotency keys).
#[async_trait]
pub trait BatchLedger: Send + Sync {
    /// Marker for a scope, if one was written.
    async fn get(&self, scope: &ScopeId) -> Result<Option<ScopeBatch>, StoreError>;

    /// Insert or replace a scope's marker.
    async fn put(&self, batch: &ScopeBatch) -> Result<(), StoreError>;

    /// Remove a scope's marker.
    async fn clear(&self, scope: &ScopeId) -> Result<(), StoreError>;
}
