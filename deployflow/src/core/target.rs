//! Deployment targets: the (account, region) pairs infrastructure lands in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An account/region pair a deployable unit is deployed into.
///
/// Ordering is by account, then region, so sets of targets iterate
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// The account identifier.
    pub account: String,
    /// The region name.
    pub region: String,
}

impl DeploymentTarget {
    /// Creates a new deployment target.
    #[must_use]
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}
