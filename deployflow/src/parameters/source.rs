//! Configuration sources: the capability through which all external
//! configuration is read and published.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::{DeployflowError, LookupFailure};

/// Read access to named configuration values, addressed by region.
///
/// Passed explicitly into target resolution and replication construction so
/// tests can inject values and observe every read.
#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    /// Reads the current value of `name` in `region`.
    async fn get_parameter(&self, name: &str, region: &str) -> Result<String, LookupFailure>;
}

/// Write access to named configuration values.
#[async_trait]
pub trait ParameterPublisher: Send + Sync {
    /// Creates or overwrites `name` in `region`.
    async fn put_parameter(
        &self,
        name: &str,
        region: &str,
        value: &str,
    ) -> Result<(), DeployflowError>;

    /// Removes `name` from `region`. Missing parameters are ignored.
    async fn delete_parameter(&self, name: &str, region: &str) -> Result<(), DeployflowError>;
}

/// In-memory, region-partitioned parameter store.
#[derive(Debug, Default)]
pub struct InMemoryParameterStore {
    values: DashMap<(String, String), String>,
    denied: DashSet<(String, String)>,
    read_only: DashSet<(String, String)>,
    reads: AtomicUsize,
}

impl InMemoryParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value (builder style).
    #[must_use]
    pub fn with_parameter(self, name: &str, region: &str, value: &str) -> Self {
        self.set(name, region, value);
        self
    }

    /// Sets a value.
    pub fn set(&self, name: &str, region: &str, value: &str) {
        self.values
            .insert((region.to_string(), name.to_string()), value.to_string());
    }

    /// Makes reads of `name` in `region` fail with access denied.
    pub fn deny(&self, name: &str, region: &str) {
        self.denied.insert((region.to_string(), name.to_string()));
    }

    /// Makes writes and deletes of `name` in `region` fail.
    pub fn deny_writes(&self, name: &str, region: &str) {
        self.read_only.insert((region.to_string(), name.to_string()));
    }

    fn check_writable(&self, name: &str, region: &str) -> Result<(), DeployflowError> {
        if self.read_only.contains(&(region.to_string(), name.to_string())) {
            return Err(DeployflowError::resource(
                format!("{region}:{name}"),
                "parameter is read-only",
            ));
        }
        Ok(())
    }

    /// Returns a value without counting it as a read.
    #[must_use]
    pub fn peek(&self, name: &str, region: &str) -> Option<String> {
        self.values
            .get(&(region.to_string(), name.to_string()))
            .map(|v| v.value().clone())
    }

    /// Returns how many reads have been served (including failed ones).
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigurationSource for InMemoryParameterStore {
    async fn get_parameter(&self, name: &str, region: &str) -> Result<String, LookupFailure> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = (region.to_string(), name.to_string());

        if self.denied.contains(&key) {
            return Err(LookupFailure::access_denied(name, region));
        }

        self.values
            .get(&key)
            .map(|v| v.value().clone())
            .ok_or_else(|| LookupFailure::not_found(name, region))
    }
}

#[async_trait]
impl ParameterPublisher for InMemoryParameterStore {
    async fn put_parameter(
        &self,
        name: &str,
        region: &str,
        value: &str,
    ) -> Result<(), DeployflowError> {
        self.check_writable(name, region)?;
        self.set(name, region, value);
        Ok(())
    }

    async fn delete_parameter(&self, name: &str, region: &str) -> Result<(), DeployflowError> {
        self.check_writable(name, region)?;
        self.values.remove(&(region.to_string(), name.to_string()));
        Ok(())
    }
}
