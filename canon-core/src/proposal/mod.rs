//! Narrative-stage proposals and the store that stages them.

mod store;
mod types;

pub use store::ProposalStore;
pub use types::{Proposal, ProposalDraft, ProposalStatus};
