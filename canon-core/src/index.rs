//! Rebuilding the derived index from canon.

use crate::assertion::PartitionKey;
use crate::backend::{CanonicalStore, DerivedIndex};
use crate::error::CanonResult;
use crate::fact::CanonicalFact;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Summary of one resync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub partitions_rebuilt: usize,
    pub facts_indexed: usize,
}

/// Rebuilds stale index partitions from current canonical facts.
#[derive(Clone)]
pub struct IndexResync {
    index: Arc<dyn DerivedIndex>,
    store: Arc<dyn CanonicalStore>,
}

impl IndexResync {
    pub fn new(index: Arc<dyn DerivedIndex>, store: Arc<dyn CanonicalStore>) -> Self {
        Self { index, store }
    }

    /// Rebuild every partition currently flagged stale.
    ///
    /// Retconned and uncommitted facts are left out.
    pub async fn run(&self) -> CanonResult<ResyncReport> {
        let stale = self.index.stale_partitions().await?;
        if stale.is_empty() {
            return Ok(ResyncReport::default());
        }

        let mut by_partition: HashMap<PartitionKey, Vec<CanonicalFact>> = HashMap::new();
        for fact in self.store.facts().await? {
            if !fact.level.is_current() {
                continue;
            }
            for key in fact.partitions() {
                by_partition.entry(key).or_default().push(fact.clone());
            }
        }

        let mut report = ResyncReport::default();
        for key in &stale {
            let facts = by_partition.remove(key).unwrap_or_default();
            debug!(partition = %key, facts = facts.len(), "rebuilding partition");
            self.index.rebuild(key, &facts).await?;
            report.partitions_rebuilt += 1;
            report.facts_indexed += facts.len();
        }
        info!(
            partitions = report.partitions_rebuilt,
            facts = report.facts_indexed,
            "index resynced"
        );
        Ok(report)
    }
}
