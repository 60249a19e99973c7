//! The seam through which deployable units reach their targets.

use async_trait::async_trait;

use super::stage::DeployableUnit;
use crate::errors::DeployflowError;

/// Applies and removes deployable units.
///
/// Deploying the same unit twice must converge to the same state.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Creates or updates `unit` in its target.
    async fn deploy(&self, unit: &DeployableUnit) -> Result<(), DeployflowError>;

    /// Removes `unit` from its target.
    async fn destroy(&self, unit: &DeployableUnit) -> Result<(), DeployflowError>;
}
