//! Who may finalize scopes.
//!
//! Write access to canon is a capability checked at the boundary, before any
//! call reaches the gate. Narrative-side writers only ever submit proposals.

use crate::commit::BatchResult;
use crate::error::{CanonError, CanonResult};
use crate::gate::CanonizationGate;
use crate::id::ScopeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Identity of a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides whether a principal may canonize a scope.
pub trait CanonAccess: Send + Sync {
    fn permits(&self, principal: &Principal, scope: &ScopeId) -> bool;

    /// Name of this check (for logs).
    fn name(&self) -> &str;
}

/// Only the named keepers may finalize, in any scope.
#[derive(Debug, Clone)]
pub struct ExclusiveKeeper {
    keepers: HashSet<Principal>,
}

impl ExclusiveKeeper {
    pub fn new(keeper: Principal) -> Self {
        Self {
            keepers: HashSet::from([keeper]),
        }
    }

    pub fn with_keeper(mut self, keeper: Principal) -> Self {
        self.keepers.insert(keeper);
        self
    }
}

impl CanonAccess for ExclusiveKeeper {
    fn permits(&self, principal: &Principal, _scope: &ScopeId) -> bool {
        self.keepers.contains(principal)
    }

    fn name(&self) -> &str {
        "exclusive_keeper"
    }
}

/// Everyone may finalize. For single-user setups and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl CanonAccess for OpenAccess {
    fn permits(&self, _principal: &Principal, _scope: &ScopeId) -> bool {
        true
    }

    fn name(&self) -> &str {
        "open"
    }
}

/// A gate behind an access check.
#[derive(Clone)]
pub struct GuardedGate {
    gate: Arc<CanonizationGate>,
    access: Arc<dyn CanonAccess>,
}

impl GuardedGate {
    pub fn new(gate: Arc<CanonizationGate>, access: Arc<dyn CanonAccess>) -> Self {
        Self { gate, access }
    }

    /// The gate behind the check.
    pub fn gate(&self) -> &CanonizationGate {
        &self.gate
    }

    /// Finalize a scope if `principal` holds the capability.
    pub async fn finalize_scope(
        &self,
        principal: &Principal,
        scope: &ScopeId,
    ) -> CanonResult<BatchResult> {
        if !self.access.permits(principal, scope) {
            warn!(
                principal = %principal,
                scope = %scope,
                check = self.access.name(),
                "finalize refused"
            );
            return Err(CanonError::Unauthorized {
                principal: principal.to_string(),
                scope: scope.clone(),
            });
        }
        self.gate.finalize_scope(scope).await
    }

    /// End-of-scene hook: finalize, treating an empty scope as a no-op.
    pub async fn complete_scene(
        &self,
        principal: &Principal,
        scope: &ScopeId,
    ) -> CanonResult<BatchResult> {
        match self.finalize_scope(principal, scope).await {
            Err(CanonError::EmptyBatch(scope)) => {
                info!(scope = %scope, "scene ended with nothing to canonize");
                Ok(BatchResult::empty(scope))
            }
            other => other,
        }
    }
}
