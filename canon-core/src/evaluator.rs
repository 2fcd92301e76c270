//! Canonization policy: which proposals become canon.
//!
//! The evaluator is a pure function over a proposal. Anything it cannot settle
//! is returned as [`Decision::NeedsExternalJudgment`]; consulting the judge is
//! the gate's job, so the policy stays testable without any I/O.

use crate::assertion::Authority;
use crate::proposal::Proposal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of evaluating one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Promote to canon.
    Accept,
    /// Keep out of canon.
    Reject,
    /// Defer to the external judge.
    NeedsExternalJudgment,
}

/// A swappable canonization policy.
pub trait EvaluationPolicy: Send + Sync {
    /// Classify a proposal.
    fn evaluate(&self, proposal: &Proposal) -> Decision;

    /// Name of this policy (for logs).
    fn name(&self) -> &str;
}

/// One row of a [`RuleTable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Label used in logs.
    pub name: String,
    /// Required authority, if any.
    #[serde(default)]
    pub authority: Option<Authority>,
    /// Confidence must be strictly greater than this, if set.
    #[serde(default)]
    pub min_confidence: Option<f64>,
    /// What a match decides.
    pub decision: Decision,
}

impl Rule {
    /// A rule matching every proposal.
    pub fn new(name: impl Into<String>, decision: Decision) -> Self {
        Self {
            name: name.into(),
            authority: None,
            min_confidence: None,
            decision,
        }
    }

    /// Restrict the rule to one authority.
    pub fn for_authority(mut self, authority: Authority) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Require confidence strictly above a threshold.
    pub fn above(mut self, threshold: f64) -> Self {
        self.min_confidence = Some(threshold);
        self
    }

    /// Whether the rule applies to a proposal.
    pub fn matches(&self, proposal: &Proposal) -> bool {
        self.authority.map_or(true, |a| a == proposal.authority)
            && self
                .min_confidence
                .map_or(true, |threshold| proposal.confidence > threshold)
    }
}

/// Ordered rules, first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    name: String,
    rules: Vec<Rule>,
    fallback: Decision,
}

impl RuleTable {
    /// An empty table that decides `fallback` for everything.
    pub fn new(name: impl Into<String>, fallback: Decision) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            fallback,
        }
    }

    /// The default canonization ruleset.
    ///
    /// 1. source material above 0.9 confidence is accepted
    /// 2. anything from the GM is accepted
    /// 3. player assertions above 0.7 confidence are accepted
    /// 4. everything else goes to the external judge
    pub fn standard() -> Self {
        Self::new("standard", Decision::NeedsExternalJudgment)
            .with_rule(
                Rule::new("trusted-source", Decision::Accept)
                    .for_authority(Authority::Source)
                    .above(0.9),
            )
            .with_rule(Rule::new("gm-fiat", Decision::Accept).for_authority(Authority::Gm))
            .with_rule(
                Rule::new("confident-player", Decision::Accept)
                    .for_authority(Authority::Player)
                    .above(0.7),
            )
    }

    /// Append a rule (evaluated after those already present).
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The rule that decides a proposal, if any matches.
    pub fn matching_rule(&self, proposal: &Proposal) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(proposal))
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl EvaluationPolicy for RuleTable {
    fn evaluate(&self, proposal: &Proposal) -> Decision {
        self.matching_rule(proposal)
            .map(|r| r.decision)
            .unwrap_or(self.fallback)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Applies the configured policy to proposals.
#[derive(Clone)]
pub struct Evaluator {
    policy: Arc<dyn EvaluationPolicy>,
}

impl Evaluator {
    /// Evaluate with a specific policy.
    pub fn new(policy: Arc<dyn EvaluationPolicy>) -> Self {
        Self { policy }
    }

    /// Classify a proposal.
    pub fn evaluate(&self, proposal: &Proposal) -> Decision {
        self.policy.evaluate(proposal)
    }

    /// Name of the active policy.
    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(Arc::new(RuleTable::standard()))
    }
}

/// Final accept/reject after any external judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Promote to canon.
    Accept,
    /// Keep out of canon.
    Reject,
}

/// What settled a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionBasis {
    /// The evaluation policy decided on its own.
    Policy,
    /// The external judge answered.
    Judge,
    /// The judge did not answer in time.
    JudgeTimedOut,
    /// The judge failed or answered unintelligibly.
    JudgeFailed,
    /// Judgment was needed but no judge is configured.
    NoJudge,
}

/// A proposal together with its final verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDecision {
    /// The decided proposal.
    pub proposal: Proposal,
    /// Accept or reject.
    pub verdict: Verdict,
    /// What settled it.
    pub basis: DecisionBasis,
}

impl ResolvedDecision {
    /// Accept a proposal.
    pub fn accept(proposal: Proposal, basis: DecisionBasis) -> Self {
        Self {
            proposal,
            verdict: Verdict::Accept,
            basis,
        }
    }

    /// Reject a proposal.
    pub fn reject(proposal: Proposal, basis: DecisionBasis) -> Self {
        Self {
            proposal,
            verdict: Verdict::Reject,
            basis,
        }
    }

    /// Whether the proposal is to be canonized.
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}
