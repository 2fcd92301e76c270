//! Append-only provenance: which evidence justifies which fact.

use crate::assertion::EvidenceRef;
use crate::backend::{CanonOp, CanonicalStore};
use crate::error::{CanonError, CanonResult};
use crate::fact::ProvenanceEdge;
use crate::id::{FactId, ProposalId};
use std::sync::Arc;
use tracing::debug;

/// Records and reads provenance edges in the canonical store.
#[derive(Clone)]
pub struct ProvenanceLedger {
    store: Arc<dyn CanonicalStore>,
}

impl ProvenanceLedger {
    /// Create a ledger over a canonical store.
    pub fn new(store: Arc<dyn CanonicalStore>) -> Self {
        Self { store }
    }

    /// Build one edge per evidence reference for a fact about to be created.
    ///
    /// Fails with `EvidenceMissing` for an empty set: a canonical fact must
    /// never exist without provenance.
    pub fn edges(
        fact: FactId,
        proposal: Option<ProposalId>,
        evidence: &[EvidenceRef],
    ) -> CanonResult<Vec<ProvenanceEdge>> {
        if evidence.is_empty() {
            return Err(CanonError::EvidenceMissing { fact, proposal });
        }
        Ok(evidence
            .iter()
            .cloned()
            .map(|e| ProvenanceEdge::new(fact, e))
            .collect())
    }

    /// Append evidence to an existing fact.
    pub async fn record(
        &self,
        fact: FactId,
        evidence: &[EvidenceRef],
    ) -> CanonResult<Vec<ProvenanceEdge>> {
        let edges = Self::edges(fact, None, evidence)?;
        let existing = self
            .store
            .fact(fact)
            .await?
            .ok_or_else(|| CanonError::not_found("fact", fact))?;
        if !existing.level.is_visible() {
            return Err(CanonError::validation(format!(
                "fact {fact} is not committed; its evidence is written with it"
            )));
        }

        let ops: Vec<CanonOp> = edges.iter().cloned().map(CanonOp::CreateEdge).collect();
        self.store.write(&ops).await?;
        debug!(fact_id = %fact, edges = edges.len(), "provenance recorded");
        Ok(edges)
    }

    /// All evidence recorded for a fact, oldest first.
    pub async fn evidence_for(&self, fact: FactId) -> CanonResult<Vec<ProvenanceEdge>> {
        Ok(self.store.edges_for(fact).await?)
    }
}
