//! Canonical facts, their provenance edges and retcon records.

use crate::assertion::{Assertion, Authority, EvidenceRef, PartitionKey};
use crate::error::{CanonError, CanonResult};
use crate::id::{EdgeId, FactId, ProposalId, ScopeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How established a canonical fact is.
///
/// Levels only move forward: `Proposed -> PendingCommit -> Canon -> Retconned`.
/// `Authoritative` replaces `Canon` for source records and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CanonLevel {
    /// Known to the canonical store but not yet decided.
    Proposed,
    /// Written by the first phase of a staged commit; not yet truth.
    PendingCommit,
    /// Established truth.
    Canon,
    /// Superseded by a newer fact.
    Retconned,
    /// Source record; never revised.
    Authoritative,
}

impl CanonLevel {
    /// Wire name of the level.
    pub fn name(&self) -> &'static str {
        match self {
            CanonLevel::Proposed => "proposed",
            CanonLevel::PendingCommit => "pending-commit",
            CanonLevel::Canon => "canon",
            CanonLevel::Retconned => "retconned",
            CanonLevel::Authoritative => "authoritative",
        }
    }

    /// True if a fact at this level counts as current truth.
    pub fn is_current(&self) -> bool {
        matches!(self, CanonLevel::Canon | CanonLevel::Authoritative)
    }

    /// True if a reader may see a fact at this level at all.
    pub fn is_visible(&self) -> bool {
        !matches!(self, CanonLevel::Proposed | CanonLevel::PendingCommit)
    }

    /// Whether moving from `self` to `next` keeps the level monotone.
    pub fn can_transition_to(&self, next: CanonLevel) -> bool {
        use CanonLevel::*;
        matches!(
            (self, next),
            (Proposed, PendingCommit | Canon | Authoritative)
                | (PendingCommit, Canon | Authoritative)
                | (Canon, Retconned)
        )
    }
}

impl fmt::Display for CanonLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A piece of permanent, queryable truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFact {
    /// Unique identifier.
    pub id: FactId,
    /// Human-readable rendering of the assertion.
    pub statement: String,
    /// The typed assertion.
    pub assertion: Assertion,
    /// Trust tier inherited from the proposal.
    pub authority: Authority,
    /// Confidence inherited from the proposal.
    pub confidence: f64,
    /// Current level.
    pub level: CanonLevel,
    /// Provenance edges justifying this fact (never empty once committed).
    pub evidence: Vec<EdgeId>,
    /// Narrative unit the fact was canonized in.
    pub scope: ScopeId,
    /// Proposal the fact was promoted from.
    pub origin: ProposalId,
    /// When the fact was created.
    pub created_at: DateTime<Utc>,
    /// The fact that replaced this one, if any.
    #[serde(default)]
    pub superseded_by: Option<FactId>,
}

impl CanonicalFact {
    /// Move to a new level, refusing any backwards or sideways step.
    pub fn transition(&mut self, to: CanonLevel) -> CanonResult<()> {
        if !self.level.can_transition_to(to) {
            return Err(CanonError::InvalidTransition {
                fact: self.id,
                from: self.level,
                to,
            });
        }
        self.level = to;
        Ok(())
    }

    /// Source records are stamped `Authoritative` and never retconned.
    pub fn is_source_record(&self) -> bool {
        self.level == CanonLevel::Authoritative
    }

    /// Derived-index partitions this fact lives in.
    pub fn partitions(&self) -> Vec<PartitionKey> {
        self.assertion.partitions()
    }
}

/// Link from a canonical fact to one piece of evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEdge {
    /// Unique identifier.
    pub id: EdgeId,
    /// The fact being justified.
    pub fact: FactId,
    /// What justifies it.
    pub evidence: EvidenceRef,
    /// When the edge was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl ProvenanceEdge {
    /// Create an edge stamped now.
    pub fn new(fact: FactId, evidence: EvidenceRef) -> Self {
        Self {
            id: EdgeId::new(),
            fact,
            evidence,
            recorded_at: Utc::now(),
        }
    }
}

/// One supersession: `old_fact` was replaced by `new_fact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetconRecord {
    /// The fact that was replaced.
    pub old_fact: FactId,
    /// The fact that replaced it.
    pub new_fact: FactId,
    /// Why.
    pub reason: String,
    /// When the supersession was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl RetconRecord {
    /// Create a record stamped now.
    pub fn new(old_fact: FactId, new_fact: FactId, reason: impl Into<String>) -> Self {
        Self {
            old_fact,
            new_fact,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }
}
