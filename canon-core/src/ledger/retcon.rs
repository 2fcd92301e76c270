//! Supersession between canonical facts.
//!
//! Retcon records form linear chains: a fact is superseded at most once,
//! replaces at most one fact, and never appears in its own ancestry.

use crate::backend::{CanonOp, CanonicalStore};
use crate::error::{CanonError, CanonResult};
use crate::fact::{CanonLevel, CanonicalFact, RetconRecord};
use crate::id::FactId;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Validates, records, and walks supersessions.
#[derive(Clone)]
pub struct RetconChain {
    store: Arc<dyn CanonicalStore>,
}

enum Walk {
    Start(FactId),
    At(FactId, HashSet<FactId>),
    Done,
}

impl RetconChain {
    /// Create a chain over a canonical store.
    pub fn new(store: Arc<dyn CanonicalStore>) -> Self {
        Self { store }
    }

    /// Check that `old` may be superseded by `new` and build the record.
    ///
    /// `new` need not exist yet; the commit coordinator plans retcons for
    /// facts it is about to create. Returns the old fact alongside the record.
    pub async fn plan(
        &self,
        old: FactId,
        new: FactId,
        reason: impl Into<String>,
    ) -> CanonResult<(CanonicalFact, RetconRecord)> {
        if old == new {
            return Err(CanonError::Cycle { old, new });
        }

        let old_fact = self
            .store
            .fact(old)
            .await?
            .ok_or_else(|| CanonError::not_found("fact", old))?;

        match old_fact.level {
            CanonLevel::Canon => {}
            CanonLevel::Authoritative => {
                return Err(CanonError::validation(format!(
                    "fact {old} is an authoritative source record and cannot be superseded"
                )))
            }
            CanonLevel::Retconned => {
                return Err(CanonError::validation(format!(
                    "fact {old} is already superseded"
                )))
            }
            level => {
                return Err(CanonError::validation(format!(
                    "fact {old} is {level}, only canon facts can be superseded"
                )))
            }
        }
        if old_fact.superseded_by.is_some() || self.store.retcon_replacing(old).await?.is_some() {
            return Err(CanonError::validation(format!(
                "fact {old} is already superseded"
            )));
        }
        if let Some(existing) = self.store.retcon_creating(new).await? {
            return Err(CanonError::validation(format!(
                "fact {new} already replaces {}",
                existing.old_fact
            )));
        }

        // Walk what `old` itself replaced; meeting `new` there closes a loop.
        let mut seen = HashSet::from([old]);
        let mut cursor = old;
        while let Some(record) = self.store.retcon_creating(cursor).await? {
            if record.old_fact == new {
                return Err(CanonError::Cycle { old, new });
            }
            if !seen.insert(record.old_fact) {
                break;
            }
            cursor = record.old_fact;
        }

        Ok((old_fact, RetconRecord::new(old, new, reason)))
    }

    /// Supersede one committed fact with another.
    pub async fn supersede(
        &self,
        old: FactId,
        new: FactId,
        reason: impl Into<String>,
    ) -> CanonResult<RetconRecord> {
        let new_fact = self
            .store
            .fact(new)
            .await?
            .ok_or_else(|| CanonError::not_found("fact", new))?;
        if !new_fact.level.is_current() {
            return Err(CanonError::validation(format!(
                "fact {new} is {}, a replacement must be current",
                new_fact.level
            )));
        }

        let (_, record) = self.plan(old, new, reason).await?;
        self.store
            .flip(&[
                CanonOp::SetLevel {
                    fact: old,
                    level: CanonLevel::Retconned,
                },
                CanonOp::RecordRetcon(record.clone()),
            ])
            .await?;
        info!(old_fact = %old, new_fact = %new, "fact retconned");
        Ok(record)
    }

    /// The supersession lineage containing `fact`, oldest record first.
    ///
    /// Records are fetched as the stream is polled.
    pub fn history_of(&self, fact: FactId) -> BoxStream<'static, CanonResult<RetconRecord>> {
        let store = self.store.clone();
        stream::try_unfold(Walk::Start(fact), move |walk| {
            let store = store.clone();
            async move {
                let (cursor, mut seen) = match walk {
                    Walk::Done => return Ok(None),
                    Walk::At(cursor, seen) => (cursor, seen),
                    Walk::Start(fact) => {
                        let mut root = fact;
                        let mut seen = HashSet::from([fact]);
                        while let Some(record) = store.retcon_creating(root).await? {
                            if !seen.insert(record.old_fact) {
                                break;
                            }
                            root = record.old_fact;
                        }
                        (root, HashSet::from([root]))
                    }
                };

                match store.retcon_replacing(cursor).await? {
                    Some(record) => {
                        let next = if seen.insert(record.new_fact) {
                            Walk::At(record.new_fact, seen)
                        } else {
                            Walk::Done
                        };
                        Ok(Some((record, next)))
                    }
                    None => Ok(None),
                }
            }
        })
        .boxed()
    }

    /// Follow supersession from `fact` to the fact that currently replaces it.
    pub async fn current(&self, fact: FactId) -> CanonResult<CanonicalFact> {
        let mut cursor = self
            .store
            .fact(fact)
            .await?
            .ok_or_else(|| CanonError::not_found("fact", fact))?;
        let mut seen = HashSet::from([cursor.id]);
        while let Some(next) = cursor.superseded_by {
            if !seen.insert(next) {
                break;
            }
            cursor = self
                .store
                .fact(next)
                .await?
                .ok_or_else(|| CanonError::not_found("fact", next))?;
        }
        Ok(cursor)
    }
}
