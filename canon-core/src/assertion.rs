//! Typed narrative assertions and the vocabulary shared by proposals and facts.

use crate::error::CanonError;
use crate::id::{FactId, ProposalId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trust tier of whoever produced a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    /// Ingested source material (rulebooks, campaign documents).
    Source,
    /// The game master.
    Gm,
    /// A player.
    Player,
    /// Automated processes inside the host application.
    System,
}

impl Authority {
    /// Wire name of the tag.
    pub fn name(&self) -> &'static str {
        match self {
            Authority::Source => "source",
            Authority::Gm => "gm",
            Authority::Player => "player",
            Authority::System => "system",
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Authority {
    type Err = CanonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source" => Ok(Authority::Source),
            "gm" => Ok(Authority::Gm),
            "player" => Ok(Authority::Player),
            "system" => Ok(Authority::System),
            other => Err(CanonError::validation(format!(
                "unrecognized authority tag '{other}'"
            ))),
        }
    }
}

/// Something a proposal cites as justification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EvidenceRef {
    /// An ingested document or passage.
    Document(String),
    /// Another proposal (typically the one a narrative beat was drawn from).
    Proposal(ProposalId),
    /// An existing canonical fact.
    Fact(FactId),
}

impl EvidenceRef {
    /// Shorthand for a document reference.
    pub fn document(id: impl Into<String>) -> Self {
        EvidenceRef::Document(id.into())
    }

    fn is_blank(&self) -> bool {
        matches!(self, EvidenceRef::Document(id) if id.trim().is_empty())
    }
}

impl fmt::Display for EvidenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceRef::Document(id) => write!(f, "document:{id}"),
            EvidenceRef::Proposal(id) => write!(f, "proposal:{id}"),
            EvidenceRef::Fact(id) => write!(f, "fact:{id}"),
        }
    }
}

/// Check an evidence set: non-empty, no blank document ids.
pub(crate) fn check_evidence(evidence: &[EvidenceRef]) -> Result<(), CanonError> {
    if evidence.is_empty() {
        return Err(CanonError::validation("evidence set is empty"));
    }
    if evidence.iter().any(EvidenceRef::is_blank) {
        return Err(CanonError::validation("evidence contains a blank document id"));
    }
    Ok(())
}

/// The claim a proposal makes about the story world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// A new entity exists.
    EntityCreation {
        name: String,
        entity_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// Two entities now stand in a (new) relationship.
    RelationshipChange {
        from: String,
        to: String,
        relationship: String,
    },
    /// A free-standing statement about a subject.
    Fact { subject: String, statement: String },
    /// An attribute of an entity changed value.
    StateTransition {
        entity: String,
        attribute: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
    },
}

impl Assertion {
    /// Short name of the assertion kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Assertion::EntityCreation { .. } => "entity_creation",
            Assertion::RelationshipChange { .. } => "relationship_change",
            Assertion::Fact { .. } => "fact",
            Assertion::StateTransition { .. } => "state_transition",
        }
    }

    /// Render the assertion as a single statement.
    pub fn statement(&self) -> String {
        match self {
            Assertion::EntityCreation {
                name,
                entity_type,
                description,
            } => match description {
                Some(desc) => format!("{name} is a {entity_type}: {desc}"),
                None => format!("{name} is a {entity_type}"),
            },
            Assertion::RelationshipChange {
                from,
                to,
                relationship,
            } => format!("{from} is {relationship} {to}"),
            Assertion::Fact { subject, statement } => format!("{subject}: {statement}"),
            Assertion::StateTransition {
                entity,
                attribute,
                from,
                to,
            } => match from {
                Some(prev) => format!("{entity}.{attribute} changed from {prev} to {to}"),
                None => format!("{entity}.{attribute} is now {to}"),
            },
        }
    }

    /// Entity names this assertion touches.
    pub fn subjects(&self) -> Vec<&str> {
        match self {
            Assertion::EntityCreation { name, .. } => vec![name.as_str()],
            Assertion::RelationshipChange { from, to, .. } => vec![from.as_str(), to.as_str()],
            Assertion::Fact { subject, .. } => vec![subject.as_str()],
            Assertion::StateTransition { entity, .. } => vec![entity.as_str()],
        }
    }

    /// Derived-index partitions affected when this assertion changes canon.
    pub fn partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self
            .subjects()
            .into_iter()
            .map(PartitionKey::for_entity)
            .collect();
        keys.dedup();
        keys
    }

    /// Reject blank names and statements.
    pub fn validate(&self) -> Result<(), CanonError> {
        let blank = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(CanonError::validation(format!(
                    "{} assertion has a blank {field}",
                    self.kind_name()
                )))
            } else {
                Ok(())
            }
        };

        match self {
            Assertion::EntityCreation {
                name, entity_type, ..
            } => {
                blank("name", name)?;
                blank("entity_type", entity_type)
            }
            Assertion::RelationshipChange {
                from,
                to,
                relationship,
            } => {
                blank("from", from)?;
                blank("to", to)?;
                blank("relationship", relationship)
            }
            Assertion::Fact { subject, statement } => {
                blank("subject", subject)?;
                blank("statement", statement)
            }
            Assertion::StateTransition {
                entity,
                attribute,
                to,
                ..
            } => {
                blank("entity", entity)?;
                blank("attribute", attribute)?;
                blank("to", to)
            }
        }
    }
}

/// Proposal payload: the assertion plus an optional supersession target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// What is being asserted.
    pub assertion: Assertion,
    /// An existing canonical fact this assertion replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<FactId>,
}

impl Payload {
    /// A payload that does not replace anything.
    pub fn new(assertion: Assertion) -> Self {
        Self {
            assertion,
            supersedes: None,
        }
    }

    /// Declare that this payload replaces an existing fact.
    pub fn superseding(mut self, fact: FactId) -> Self {
        self.supersedes = Some(fact);
        self
    }
}

impl From<Assertion> for Payload {
    fn from(assertion: Assertion) -> Self {
        Self::new(assertion)
    }
}

/// Name of a derived-index partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Partition holding everything about one entity.
    pub fn for_entity(name: &str) -> Self {
        Self(format!("entity:{}", name.trim().to_lowercase()))
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
