//! Lookups of arbitrary kinds by group/version/kind, namespace and name.
use crate::registry::ResourceKind;
use crate::selector::Selector;
use async_trait::async_trait;
use kube::api::DynamicObject;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;
pub mod watch;

pub use memory::MemoryStore;
pub use watch::ObjectCache;

/// Capacity of the change notification channel. Slow subscribers miss notifications and are
/// caught up by the periodic resync.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// The watch behind this kind has not synced, or lost its connection and is relisting.
    #[error("cache for {0} is not synced")]
    Stale(String),
    #[error("discovery of {kind} failed: {reason}")]
    Discovery { kind: String, reason: String },
    #[error("api error: {0}")]
    Api(String),
}

/// An object of `kind` was added, modified or deleted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectChange {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

/// Read access to objects of any kind.
///
/// Returned objects are shared snapshots; callers never mutate them.
#[async_trait]
pub trait ObjectLookup: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>, CacheError>;

    /// Objects of `kind` in `namespace` matching `selector`, ordered by name.
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Arc<DynamicObject>>, CacheError>;

    /// Notifications for every change to an object this lookup has served.
    fn subscribe(&self) -> broadcast::Receiver<ObjectChange>;
}

#[async_trait]
impl<L: ObjectLookup + ?Sized> ObjectLookup for Arc<L> {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>, CacheError> {
        (**self).get(kind, namespace, name).await
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Arc<DynamicObject>>, CacheError> {
        (**self).list(kind, namespace, selector).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectChange> {
        (**self).subscribe()
    }
}
