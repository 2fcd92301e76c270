//! The external judgment seam.
//!
//! A judge answers the proposals the evaluation policy could not settle. It
//! is usually a remote model, so every call is bounded by a timeout and any
//! failure resolves to a conservative reject at the gate.

use crate::error::JudgeError;
use crate::proposal::Proposal;
use async_trait::async_trait;
use std::time::Duration;

/// Decides whether a deferred proposal should become canon.
#[async_trait]
pub trait ExternalJudge: Send + Sync {
    /// `Ok(true)` to accept. Implementations should give up after `timeout`;
    /// the gate enforces it regardless.
    async fn judge(&self, proposal: &Proposal, timeout: Duration) -> Result<bool, JudgeError>;

    /// Name of this judge (for logs).
    fn name(&self) -> &str;
}
