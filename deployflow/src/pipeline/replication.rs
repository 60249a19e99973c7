//! Cross-region artifact replication.
//!
//! A pipeline homed in one region deploys into others. Each foreign region
//! needs a bucket and key to receive pipeline artifacts; the common support
//! stacks publish both as parameters in their own region.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::core::DeploymentTarget;
use crate::errors::LookupFailure;
use crate::parameters::names::{SUPPORT_BUCKET_NAME, SUPPORT_KEY_ARN};
use crate::parameters::CrossRegionParameterReader;

/// Replication destination in one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationBucket {
    /// Bucket receiving replicated artifacts.
    pub bucket_name: String,
    /// Key encrypting them.
    pub key_arn: String,
}

/// Region -> replication destination.
pub type ReplicationMap = BTreeMap<String, ReplicationBucket>;

/// Builds the replication map for every region any stage deploys to.
///
/// Regions are de-duplicated and the home region is skipped, since artifacts
/// already live there. Reads happen concurrently; any failure is fatal.
pub async fn build_cross_region_replication_targets<'a, I>(
    targets: I,
    home_region: &str,
    reader: &CrossRegionParameterReader,
) -> Result<ReplicationMap, LookupFailure>
where
    I: IntoIterator<Item = &'a DeploymentTarget>,
{
    let regions: BTreeSet<&str> = targets
        .into_iter()
        .map(|t| t.region.as_str())
        .filter(|r| *r != home_region)
        .collect();

    let buckets = try_join_all(regions.iter().map(|region| async move {
        let bucket_name = reader.read_value(SUPPORT_BUCKET_NAME, region).await?;
        let key_arn = reader.read_value(SUPPORT_KEY_ARN, region).await?;
        Ok::<_, LookupFailure>((
            (*region).to_string(),
            ReplicationBucket { bucket_name, key_arn },
        ))
    }))
    .await?;

    debug!(regions = buckets.len(), home_region, "Built cross-region replication map");
    Ok(buckets.into_iter().collect())
}
