//! Deployment slot types.
//!
//! A [`DeploymentSlot`] is one of the bounded set of shared preview
//! environments a pull request can be built into. Slots are sourced from the
//! cluster inventory at the start of every cycle and are read-only for the
//! rest of the cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::BranchName;

/// A shared preview environment a pull request group can be built into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSlot {
    /// The deployment name, stable across cycles.
    pub name: String,

    /// The flavor label that distinguishes this slot's build resources.
    pub flavor: String,

    /// Display icon used when logging about this slot.
    pub call_sign: String,

    /// When the slot was last deployed to, from the newest owned ReplicaSet.
    ///
    /// `None` for a slot that has never been rolled out.
    pub last_deploy: Option<DateTime<Utc>>,

    /// The branch the slot was last built from, if any.
    ///
    /// Drives the Phase 1 direct-affinity pick: a slot prefers to rebuild
    /// from the branch it already holds.
    pub built_from_branch: Option<BranchName>,
}

impl DeploymentSlot {
    /// Returns the URL the slot serves its preview at.
    pub fn build_url(&self, preview_domain: &str) -> String {
        format!("https://{}.{}/", self.name, preview_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_is_slot_scoped() {
        let slot = DeploymentSlot {
            name: "preview-a".to_string(),
            flavor: "standard".to_string(),
            call_sign: "🦀".to_string(),
            last_deploy: None,
            built_from_branch: None,
        };
        assert_eq!(
            slot.build_url("preview.example.org"),
            "https://preview-a.preview.example.org/"
        );
    }
}
