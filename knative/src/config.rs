//! Controller settings, read from YAML.
use crate::duck::v1::{ServiceAddress, StatusAddress};
use crate::registry::{AddressableRegistry, ResourceKind};
use crate::workqueue::Backoff;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

/// How an addressable kind publishes its address.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AdapterKind {
    /// `status.address.url`, or the legacy `status.address.hostname`
    Status,
    /// The cluster DNS name of a core Service
    Service,
}

impl Default for AdapterKind {
    fn default() -> Self {
        AdapterKind::Status
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddressableConfig {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub adapter: AdapterKind,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub base_millis: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_millis: 500,
            max_secs: 300,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Reconciles of distinct Sources run on this many workers.
    pub workers: usize,
    /// Every Source is reconciled again at least this often.
    pub resync_period_secs: u64,
    /// Deadline of a single reconcile pass.
    pub reconcile_timeout_secs: u64,
    pub backoff: BackoffConfig,
    pub cluster_domain: String,
    /// Give up on a sink that is still not addressable after this long. Unset means never.
    pub not_addressable_escalation_secs: Option<u64>,
    /// How long a lookup waits for a new watch to list its objects.
    pub cache_sync_timeout_secs: u64,
    /// Kinds that may be used as sinks in addition to the built in ones.
    pub addressables: Vec<AddressableConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            workers: 4,
            resync_period_secs: 600,
            reconcile_timeout_secs: 30,
            backoff: BackoffConfig::default(),
            cluster_domain: "cluster.local".into(),
            not_addressable_escalation_secs: None,
            cache_sync_timeout_secs: 10,
            addressables: vec![],
        }
    }
}

impl ControllerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let yaml = read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.into()));
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.resync_period_secs == 0 {
            return invalid("resyncPeriodSecs must be positive");
        }
        if self.reconcile_timeout_secs == 0 {
            return invalid("reconcileTimeoutSecs must be positive");
        }
        if self.cache_sync_timeout_secs == 0 {
            return invalid("cacheSyncTimeoutSecs must be positive");
        }
        if self.backoff.base_millis == 0 {
            return invalid("backoff.baseMillis must be positive");
        }
        if self.backoff.max_secs.saturating_mul(1000) < self.backoff.base_millis {
            return invalid("backoff.maxSecs must not be below backoff.baseMillis");
        }
        if self.cluster_domain.is_empty() {
            return invalid("clusterDomain must not be empty");
        }
        if self.not_addressable_escalation_secs == Some(0) {
            return invalid("notAddressableEscalationSecs must be positive when set");
        }
        for addressable in &self.addressables {
            ResourceKind::from_api_version(&addressable.api_version, &addressable.kind)
                .map_err(|err| ConfigError::Invalid(format!("addressables: {}", err)))?;
        }
        Ok(())
    }

    /// The built in addressables plus those configured, later entries replacing earlier ones.
    pub fn registry(&self) -> Result<AddressableRegistry, ConfigError> {
        let mut registry = AddressableRegistry::with_defaults(&self.cluster_domain);
        for addressable in &self.addressables {
            let kind = ResourceKind::from_api_version(&addressable.api_version, &addressable.kind)
                .map_err(|err| ConfigError::Invalid(format!("addressables: {}", err)))?;
            match addressable.adapter {
                AdapterKind::Status => registry.register(kind, StatusAddress),
                AdapterKind::Service => registry.register(kind, ServiceAddress::new(self.cluster_domain.as_str())),
            };
        }
        Ok(registry)
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff.base_millis),
            Duration::from_secs(self.backoff.max_secs),
        )
    }

    pub fn not_addressable_escalation(&self) -> Option<Duration> {
        self.not_addressable_escalation_secs.map(Duration::from_secs)
    }
}
