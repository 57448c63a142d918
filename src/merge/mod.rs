//! Merging finished issue branches back into the main checkout.

pub mod coordinator;

pub use coordinator::{MergeCoordinator, MergeOutcome, MergeSettings, MergeStatus};
