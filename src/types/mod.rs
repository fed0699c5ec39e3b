//! Core domain types.
//!
//! All entities here are cycle-scoped: they are built from external reads at
//! the start of a scheduling cycle and discarded when it ends.

mod ids;
mod pr;
mod slot;

pub use ids::{BranchName, PrNumber, RepoName, Sha};
pub use pr::{Comment, PullRequest};
pub use slot::DeploymentSlot;
