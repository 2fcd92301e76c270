//! Provenance and supersession records for canonical facts.

mod provenance;
mod retcon;

pub use provenance::ProvenanceLedger;
pub use retcon::RetconChain;
