//! Cross-region parameter reads.
//!
//! Most configuration reads are region-local. The replication map needs values
//! published in every foreign region a stage deploys to, so this reader
//! addresses the region explicitly and never reuses a previous result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::ConfigurationSource;
use crate::errors::LookupFailure;
use crate::utils::time_token;

/// The result of one live read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterRead {
    /// The parameter name.
    pub name: String,
    /// The region it was read from.
    pub region: String,
    /// The value at read time.
    pub value: String,
    /// Identity of this read, derived from the current time.
    pub identity_token: String,
    /// When the read happened.
    pub read_at: DateTime<Utc>,
}

/// Reads a single named value from a specified region, live, every time.
#[derive(Clone)]
pub struct CrossRegionParameterReader {
    source: Arc<dyn ConfigurationSource>,
}

impl std::fmt::Debug for CrossRegionParameterReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossRegionParameterReader").finish_non_exhaustive()
    }
}

impl CrossRegionParameterReader {
    /// Creates a reader over `source`.
    #[must_use]
    pub fn new(source: Arc<dyn ConfigurationSource>) -> Self {
        Self { source }
    }

    /// Reads `name` from `region`.
    ///
    /// Each call gets a fresh identity token, so the read is always treated as
    /// change-bearing and never served from an earlier synthesis.
    pub async fn read(&self, name: &str, region: &str) -> Result<ParameterRead, LookupFailure> {
        let identity_token = time_token();
        debug!(parameter = %name, region = %region, token = %identity_token, "Reading parameter");

        match self.source.get_parameter(name, region).await {
            Ok(value) => Ok(ParameterRead {
                name: name.to_string(),
                region: region.to_string(),
                value,
                identity_token,
                read_at: Utc::now(),
            }),
            Err(err) => {
                warn!(parameter = %name, region = %region, error = %err, "Parameter lookup failed");
                Err(err)
            }
        }
    }

    /// Reads `name` from `region` and returns only the value.
    pub async fn read_value(&self, name: &str, region: &str) -> Result<String, LookupFailure> {
        self.read(name, region).await.map(|read| read.value)
    }
}
