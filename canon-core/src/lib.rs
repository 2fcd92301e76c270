//! Canonization engine for shared story worlds.
//!
//! Narrative-side writers stage *proposals*: typed assertions with an
//! authority, a confidence and evidence. At the end of a scope (a scene, a
//! session) the [`CanonizationGate`] decides every pending proposal and the
//! [`CommitCoordinator`] promotes the accepted ones to canonical facts in one
//! atomic batch, with provenance and retcon history.
//!
//! This crate provides:
//! - Validated proposal staging with write-once resolution
//! - A swappable rule-table policy, deferring hard cases to an external judge
//! - Atomic, idempotent, crash-resumable batch commits
//! - Provenance edges and an acyclic retcon chain
//! - In-memory and JSON-file backends
//!
//! # Quick Start
//!
//! ```ignore
//! use canon_core::testing::TestEngine;
//! use canon_core::{Assertion, ProposalDraft};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = TestEngine::new();
//!
//!     engine
//!         .submit(
//!             ProposalDraft::new("scene-1", "gm", Assertion::Fact {
//!                 subject: "Old Mill".into(),
//!                 statement: "burned down last winter".into(),
//!             })
//!             .citing("transcript:scene-1"),
//!         )
//!         .await?;
//!
//!     let result = engine.finalize("scene-1").await?;
//!     println!("{} facts canonized", result.accepted_fact_ids.len());
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod assertion;
pub mod backend;
pub mod commit;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod fact;
pub mod gate;
pub mod id;
pub mod index;
pub mod judge;
pub mod ledger;
pub mod proposal;
pub mod testing;

// Primary public API
pub use access::{CanonAccess, ExclusiveKeeper, GuardedGate, OpenAccess, Principal};
pub use assertion::{Assertion, Authority, EvidenceRef, PartitionKey, Payload};
pub use backend::{
    Atomicity, BatchLedger, CanonOp, CanonicalStore, DerivedIndex, JsonBatchLedger,
    MemoryBatchLedger, MemoryCanonStore, MemoryIndex, MemoryStagingStore, StagingStore,
};
pub use commit::{BatchResult, CommitCoordinator, ScopeBatch};
pub use config::{ConfigError, EngineConfig, RetryPolicy};
pub use error::{CanonError, CanonResult, JudgeError, StoreError};
pub use evaluator::{
    Decision, DecisionBasis, EvaluationPolicy, Evaluator, ResolvedDecision, Rule, RuleTable,
    Verdict,
};
pub use fact::{CanonLevel, CanonicalFact, ProvenanceEdge, RetconRecord};
pub use gate::CanonizationGate;
pub use id::{EdgeId, FactId, ProposalId, ScopeId};
pub use index::{IndexResync, ResyncReport};
pub use judge::ExternalJudge;
pub use ledger::{ProvenanceLedger, RetconChain};
pub use proposal::{Proposal, ProposalDraft, ProposalStatus, ProposalStore};
