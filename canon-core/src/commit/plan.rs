//! Turning decided proposals into canonical writes.

use super::batch::BatchResult;
use crate::assertion::{Authority, PartitionKey};
use crate::backend::CanonOp;
use crate::error::{CanonError, CanonResult};
use crate::evaluator::ResolvedDecision;
use crate::fact::{CanonLevel, CanonicalFact, ProvenanceEdge, RetconRecord};
use crate::id::{FactId, ProposalId, ScopeId};
use crate::ledger::{ProvenanceLedger, RetconChain};
use crate::proposal::{Proposal, ProposalStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// One accepted proposal and everything its commit writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedFact {
    pub proposal: ProposalId,
    /// The fact at its final level.
    pub fact: CanonicalFact,
    pub edges: Vec<ProvenanceEdge>,
    #[serde(default)]
    pub retcon: Option<RetconRecord>,
    /// Index partitions of the fact being retconned.
    #[serde(default)]
    pub retired_partitions: Vec<PartitionKey>,
}

/// The complete write set of a batch, fixed before anything is written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitPlan {
    pub accepted: Vec<PlannedFact>,
    pub rejected: Vec<ProposalId>,
}

impl CommitPlan {
    /// Validate decisions against current state and build the write set.
    pub(crate) async fn build(
        scope: &ScopeId,
        decisions: &[ResolvedDecision],
        proposals: &ProposalStore,
        retcons: &RetconChain,
    ) -> CanonResult<Self> {
        let mut plan = CommitPlan::default();
        let mut seen = HashSet::new();
        let mut superseded = HashSet::new();

        for decision in decisions {
            let proposal = &decision.proposal;
            if proposal.scope != *scope {
                return Err(CanonError::validation(format!(
                    "proposal {} belongs to scope {}, not {scope}",
                    proposal.id, proposal.scope
                )));
            }
            if !seen.insert(proposal.id) {
                return Err(CanonError::validation(format!(
                    "proposal {} is decided twice",
                    proposal.id
                )));
            }
            // The caller's copy may be stale; only staging knows the status.
            if !proposals.get(proposal.id).await?.is_pending() {
                return Err(CanonError::AlreadyResolved(proposal.id));
            }

            if !decision.is_accepted() {
                plan.rejected.push(proposal.id);
                continue;
            }

            let (fact, edges) = fact_for(proposal)?;
            let mut planned = PlannedFact {
                proposal: proposal.id,
                fact,
                edges,
                retcon: None,
                retired_partitions: Vec::new(),
            };

            if let Some(old) = proposal.supersedes() {
                if !superseded.insert(old) {
                    return Err(CanonError::validation(format!(
                        "fact {old} is superseded twice in one batch"
                    )));
                }
                let reason = format!("superseded by proposal {}", proposal.id);
                let (old_fact, record) = retcons.plan(old, planned.fact.id, reason).await?;
                planned.retired_partitions = old_fact.partitions();
                planned.retcon = Some(record);
            }

            debug!(
                proposal_id = %proposal.id,
                fact_id = %planned.fact.id,
                level = %planned.fact.level,
                "fact planned"
            );
            plan.accepted.push(planned);
        }

        Ok(plan)
    }

    /// Every proposal the batch decides, in order.
    pub fn in_flight(&self) -> Vec<ProposalId> {
        self.accepted
            .iter()
            .map(|p| p.proposal)
            .chain(self.rejected.iter().copied())
            .collect()
    }

    /// Ids of the facts the batch creates.
    pub fn fact_ids(&self) -> Vec<FactId> {
        self.accepted.iter().map(|p| p.fact.id).collect()
    }

    /// True when there is nothing to write to the canonical store.
    pub fn has_writes(&self) -> bool {
        !self.accepted.is_empty()
    }

    /// The whole batch as one multi-op write.
    pub fn transactional_ops(&self) -> Vec<CanonOp> {
        let mut ops = self.structural_ops(None);
        ops.extend(self.retcon_ops());
        ops
    }

    /// First phase of a staged commit: facts and edges at `pending-commit`.
    pub fn stage_ops(&self) -> Vec<CanonOp> {
        self.structural_ops(Some(CanonLevel::PendingCommit))
    }

    /// Second phase of a staged commit: the atomic status flip.
    pub fn flip_ops(&self) -> Vec<CanonOp> {
        let mut ops: Vec<CanonOp> = self
            .accepted
            .iter()
            .map(|p| CanonOp::SetLevel {
                fact: p.fact.id,
                level: p.fact.level,
            })
            .collect();
        ops.extend(self.retcon_ops());
        ops
    }

    /// Index partitions touched by new and retconned facts.
    pub fn partitions(&self) -> Vec<PartitionKey> {
        let keys: BTreeSet<PartitionKey> = self
            .accepted
            .iter()
            .flat_map(|p| p.fact.partitions().into_iter().chain(p.retired_partitions.clone()))
            .collect();
        keys.into_iter().collect()
    }

    /// The result this plan produces once committed.
    pub fn result(&self, scope: &ScopeId) -> BatchResult {
        BatchResult {
            scope: scope.clone(),
            accepted_fact_ids: self.fact_ids(),
            rejected_proposal_ids: self.rejected.clone(),
        }
    }

    fn structural_ops(&self, staged_at: Option<CanonLevel>) -> Vec<CanonOp> {
        let mut ops = Vec::new();
        for planned in &self.accepted {
            let mut fact = planned.fact.clone();
            if let Some(level) = staged_at {
                fact.level = level;
            }
            ops.push(CanonOp::CreateFact(fact));
            ops.extend(planned.edges.iter().cloned().map(CanonOp::CreateEdge));
        }
        ops
    }

    fn retcon_ops(&self) -> Vec<CanonOp> {
        self.accepted
            .iter()
            .filter_map(|p| p.retcon.as_ref())
            .flat_map(|r| {
                [
                    CanonOp::SetLevel {
                        fact: r.old_fact,
                        level: CanonLevel::Retconned,
                    },
                    CanonOp::RecordRetcon(r.clone()),
                ]
            })
            .collect()
    }
}

/// Build the fact and provenance for an accepted proposal.
///
/// Source-authority proposals become authoritative records.
fn fact_for(proposal: &Proposal) -> CanonResult<(CanonicalFact, Vec<ProvenanceEdge>)> {
    let id = FactId::new();
    let edges = ProvenanceLedger::edges(id, Some(proposal.id), &proposal.evidence)?;
    let level = match proposal.authority {
        Authority::Source => CanonLevel::Authoritative,
        _ => CanonLevel::Canon,
    };
    let fact = CanonicalFact {
        id,
        statement: proposal.payload.assertion.statement(),
        assertion: proposal.payload.assertion.clone(),
        authority: proposal.authority,
        confidence: proposal.confidence,
        level,
        evidence: edges.iter().map(|e| e.id).collect(),
        scope: proposal.scope.clone(),
        origin: proposal.id,
        created_at: Utc::now(),
        superseded_by: None,
    };
    Ok((fact, edges))
}
