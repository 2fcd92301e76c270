//! Proposals: staged assertions awaiting a canonization decision.

use crate::assertion::{check_evidence, Assertion, Authority, EvidenceRef, Payload};
use crate::error::{CanonError, CanonResult};
use crate::id::{FactId, ProposalId, ScopeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Awaiting a decision.
    Pending,
    /// Promoted to a canonical fact.
    Accepted,
    /// Declined; kept as an audit record.
    Rejected,
}

impl ProposalStatus {
    /// True once a decision has been recorded.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }
}

/// A staged assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique identifier.
    pub id: ProposalId,
    /// Narrative unit the proposal belongs to.
    pub scope: ScopeId,
    /// The assertion and its optional supersession target.
    pub payload: Payload,
    /// Trust tier of the writer.
    pub authority: Authority,
    /// Writer's confidence, 0.0 to 1.0.
    pub confidence: f64,
    /// Justification; never empty.
    pub evidence: Vec<EvidenceRef>,
    /// Current status.
    pub status: ProposalStatus,
    /// When the proposal was accepted into staging.
    pub submitted_at: DateTime<Utc>,
    /// When a decision was recorded.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Fact created from this proposal, for accepted ones.
    #[serde(default)]
    pub canonical_fact: Option<FactId>,
}

impl Proposal {
    /// True while no decision has been recorded.
    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }

    /// The fact this proposal wants to replace.
    pub fn supersedes(&self) -> Option<FactId> {
        self.payload.supersedes
    }
}

/// What a narrative-side writer submits.
///
/// The authority arrives as a raw tag so unknown tiers are rejected at the
/// staging boundary instead of failing deserialization upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalDraft {
    /// Narrative unit.
    pub scope: ScopeId,
    /// The assertion.
    pub payload: Payload,
    /// Raw authority tag (`source`, `gm`, `player` or `system`).
    pub authority: String,
    /// Writer's confidence.
    pub confidence: f64,
    /// Justification.
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
}

impl ProposalDraft {
    /// Start a draft with full confidence and no evidence.
    pub fn new(
        scope: impl Into<ScopeId>,
        authority: impl Into<String>,
        assertion: Assertion,
    ) -> Self {
        Self {
            scope: scope.into(),
            payload: Payload::new(assertion),
            authority: authority.into(),
            confidence: 1.0,
            evidence: Vec::new(),
        }
    }

    /// Set the confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Add one evidence reference.
    pub fn with_evidence(mut self, evidence: EvidenceRef) -> Self {
        self.evidence.push(evidence);
        self
    }

    /// Add a document reference.
    pub fn citing(self, document: impl Into<String>) -> Self {
        self.with_evidence(EvidenceRef::document(document))
    }

    /// Declare that the assertion replaces an existing fact.
    pub fn superseding(mut self, fact: FactId) -> Self {
        self.payload.supersedes = Some(fact);
        self
    }

    /// Validate the draft and turn it into a pending proposal.
    pub fn into_proposal(self) -> CanonResult<Proposal> {
        if self.scope.is_blank() {
            return Err(CanonError::validation("scope id is blank"));
        }
        let authority: Authority = self.authority.parse()?;
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(CanonError::validation(format!(
                "confidence {} is outside [0, 1]",
                self.confidence
            )));
        }
        check_evidence(&self.evidence)?;
        self.payload.assertion.validate()?;

        let mut evidence = self.evidence;
        dedup_preserving_order(&mut evidence);

        Ok(Proposal {
            id: ProposalId::new(),
            scope: self.scope,
            payload: self.payload,
            authority,
            confidence: self.confidence,
            evidence,
            status: ProposalStatus::Pending,
            submitted_at: Utc::now(),
            resolved_at: None,
            canonical_fact: None,
        })
    }
}

fn dedup_preserving_order(evidence: &mut Vec<EvidenceRef>) {
    let mut seen = std::collections::HashSet::new();
    evidence.retain(|e| seen.insert(e.clone()));
}
