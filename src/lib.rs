//! Preview-slot bot: assigns open pull requests to a fleet of preview
//! deployment slots and rebuilds each slot from the branch it is assigned.
//!
//! This library holds the full scheduling core; the binary only wires the
//! GitHub and Kubernetes clients to it.

pub mod build;
pub mod classify;
pub mod cluster;
pub mod config;
pub mod cycle;
pub mod github;
pub mod notify;
pub mod pool;
pub mod scheduler;
pub mod types;
