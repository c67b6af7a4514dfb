//! The explicit set of kinds a sink may reference, and how each one publishes its address.
use crate::duck::v1::{AddressAdapter, ServiceAddress, StatusAddress};
use crate::error::ResolveError;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifies a Kubernetes kind. The core group is the empty string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        ResourceKind {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Parse an `apiVersion` such as `v1` or `eventing.knative.dev/v1`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, ResolveError> {
        if kind.is_empty() {
            return Err(ResolveError::InvalidReference(format!(
                "reference with apiVersion {:?} is missing kind",
                api_version
            )));
        }
        let parts: Vec<_> = api_version.split('/').collect();
        match parts.as_slice() {
            [version] if !version.is_empty() => Ok(ResourceKind::new("", version, kind)),
            [group, version] if !group.is_empty() && !version.is_empty() => {
                Ok(ResourceKind::new(group, version, kind))
            }
            _ => Err(ResolveError::InvalidReference(format!(
                "invalid apiVersion {:?} for {} (expect v1 or group/v1)",
                api_version, kind
            ))),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    /// The kind recorded in the object's `apiVersion` and `kind`, if any.
    pub fn of(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        ResourceKind::from_api_version(&types.api_version, &types.kind).ok()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Maps each addressable kind to the adapter that reads its address.
///
/// Built once at startup; a kind that was never registered cannot be used as a sink.
#[derive(Clone, Debug, Default)]
pub struct AddressableRegistry {
    adapters: HashMap<ResourceKind, Arc<dyn AddressAdapter>>,
}

impl AddressableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The Knative addressables plus core Services addressed within `cluster_domain`.
    pub fn with_defaults(cluster_domain: &str) -> Self {
        let mut registry = Self::new();
        for (group, kind) in [
            ("eventing.knative.dev", "Broker"),
            ("messaging.knative.dev", "Channel"),
            ("messaging.knative.dev", "InMemoryChannel"),
            ("flows.knative.dev", "Parallel"),
            ("flows.knative.dev", "Sequence"),
            ("serving.knative.dev", "Service"),
        ] {
            registry.register(ResourceKind::new(group, "v1", kind), StatusAddress);
        }
        registry.register(
            ResourceKind::new("", "v1", "Service"),
            ServiceAddress::new(cluster_domain),
        );
        registry
    }

    /// Register `adapter` for `kind`, replacing any previous registration.
    pub fn register<A>(&mut self, kind: ResourceKind, adapter: A) -> &mut Self
    where
        A: AddressAdapter + 'static,
    {
        self.adapters.insert(kind, Arc::new(adapter));
        self
    }

    pub fn adapter(&self, kind: &ResourceKind) -> Result<&Arc<dyn AddressAdapter>, ResolveError> {
        self.adapters.get(kind).ok_or_else(|| {
            ResolveError::InvalidReference(format!("{} is not a registered addressable kind", kind))
        })
    }

    pub fn contains(&self, kind: &ResourceKind) -> bool {
        self.adapters.contains_key(kind)
    }

    /// Registered kinds in a stable order.
    pub fn kinds(&self) -> Vec<&ResourceKind> {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        kinds
    }
}
