//! Configuration for the sync engine.

use crate::conflict::ConflictPolicy;
use crate::upload::UploadStrategy;
use fhirsync_protocol::{ResourceType, ScopeFilter};
use std::time::Duration;

/// Resource types synced when none are configured.
pub const DEFAULT_RESOURCE_TYPES: &[&str] = &["Patient", "Encounter", "Observation"];

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Resource types to sync, in download order.
    pub resource_types: Vec<ResourceType>,
    /// Maximum records per downloaded page.
    pub page_size: u32,
    /// How dirty records are sent to the server.
    pub upload_strategy: UploadStrategy,
    /// How conflicts are resolved.
    pub conflict_policy: ConflictPolicy,
    /// How long a pass may hold the lease before others may reclaim it.
    pub lease_ttl: Duration,
    /// Filters sent with every fetch, e.g. the user's patient list.
    pub scope_filters: Vec<ScopeFilter>,
    /// Name of this device, used as the lease holder prefix.
    pub device_name: String,
}

impl SyncConfig {
    /// Creates a configuration with the default resource types.
    pub fn new() -> Self {
        Self {
            resource_types: DEFAULT_RESOURCE_TYPES
                .iter()
                .map(|name| ResourceType::new(*name))
                .collect(),
            page_size: 100,
            upload_strategy: UploadStrategy::default(),
            conflict_policy: ConflictPolicy::default(),
            lease_ttl: Duration::from_secs(10 * 60),
            scope_filters: Vec::new(),
            device_name: "device".to_string(),
        }
    }

    /// Sets the resource types to sync.
    pub fn with_resource_types<I, R>(mut self, resource_types: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ResourceType>,
    {
        self.resource_types = resource_types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the page size. Zero is raised to one.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the upload strategy.
    pub fn with_upload_strategy(mut self, strategy: UploadStrategy) -> Self {
        self.upload_strategy = strategy;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the lease time-to-live.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Adds a filter sent with every fetch.
    pub fn with_scope_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.scope_filters.push(ScopeFilter::new(name, value));
        self
    }

    /// Sets the device name.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
