//! Mock implementations for testing.

mod ledger;
pub use ledger::{payload, Ledger};
mod membership;
pub use membership::Membership;
mod pipeline;
pub use pipeline::{applied, Pipeline, Proposed, BLOCK_PREFIX};
