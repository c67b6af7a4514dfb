use super::{CacheError, ObjectChange, ObjectLookup, CHANGE_CHANNEL_CAPACITY};
use crate::registry::ResourceKind;
use crate::selector::Selector;
use async_trait::async_trait;
use kube::api::DynamicObject;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

type Bucket = BTreeMap<String, Arc<DynamicObject>>;

/// An in-process [`ObjectLookup`], fed by [`MemoryStore::apply`] and [`MemoryStore::delete`].
#[derive(Debug)]
pub struct MemoryStore {
    data: RwLock<HashMap<(ResourceKind, String), Bucket>>,
    stale: RwLock<HashSet<(ResourceKind, String)>>,
    sender: broadcast::Sender<ObjectChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: RwLock::new(HashMap::new()),
            stale: RwLock::new(HashSet::new()),
            sender,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object. It must carry `apiVersion`, `kind`, a namespace and a name.
    pub async fn apply(&self, obj: DynamicObject) -> Result<(), CacheError> {
        let kind = ResourceKind::of(&obj)
            .ok_or_else(|| CacheError::Api("object is missing apiVersion or kind".into()))?;
        let namespace = obj
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| CacheError::Api(format!("{} object is missing a namespace", kind)))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| CacheError::Api(format!("{} object is missing a name", kind)))?;

        let mut lock = self.data.write().await;
        lock.entry((kind.clone(), namespace.clone()))
            .or_default()
            .insert(name.clone(), Arc::new(obj));
        drop(lock);

        debug!(%kind, %namespace, %name, "applied");
        self.notify(kind, namespace, name);
        Ok(())
    }

    /// Remove an object, returning whether it existed.
    pub async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> bool {
        let mut lock = self.data.write().await;
        let removed = lock
            .get_mut(&(kind.clone(), namespace.to_string()))
            .and_then(|bucket| bucket.remove(name))
            .is_some();
        drop(lock);

        if removed {
            debug!(%kind, %namespace, %name, "deleted");
            self.notify(kind.clone(), namespace.into(), name.into());
        }
        removed
    }

    /// Make lookups of `kind` in `namespace` fail as if the watch had dropped, or recover them.
    pub async fn set_stale(&self, kind: &ResourceKind, namespace: &str, stale: bool) {
        let key = (kind.clone(), namespace.to_string());
        let mut lock = self.stale.write().await;
        if stale {
            lock.insert(key);
        } else {
            lock.remove(&key);
        }
    }

    async fn check_fresh(&self, kind: &ResourceKind, namespace: &str) -> Result<(), CacheError> {
        if self.stale.read().await.contains(&(kind.clone(), namespace.to_string())) {
            Err(CacheError::Stale(format!("{} in {}", kind, namespace)))
        } else {
            Ok(())
        }
    }

    fn notify(&self, kind: ResourceKind, namespace: String, name: String) {
        // no subscribers is fine
        let _ = self.sender.send(ObjectChange {
            kind,
            namespace,
            name,
        });
    }
}

#[async_trait]
impl ObjectLookup for MemoryStore {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>, CacheError> {
        self.check_fresh(kind, namespace).await?;
        let lock = self.data.read().await;
        Ok(lock
            .get(&(kind.clone(), namespace.to_string()))
            .and_then(|bucket| bucket.get(name))
            .cloned())
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Arc<DynamicObject>>, CacheError> {
        self.check_fresh(kind, namespace).await?;
        let lock = self.data.read().await;
        Ok(lock
            .get(&(kind.clone(), namespace.to_string()))
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|obj| selector.matches_object(&obj.metadata))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectChange> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{broker, read_mock};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::convert::TryFrom;

    fn broker_kind() -> ResourceKind {
        ResourceKind::new("eventing.knative.dev", "v1", "Broker")
    }

    #[async_std::test]
    async fn get_and_delete() {
        let store = MemoryStore::new();
        store.apply(read_mock("default_broker.yaml")).await.unwrap();

        let found = store.get(&broker_kind(), "default", "default").await.unwrap();
        assert_eq!(found.unwrap().metadata.name.as_deref(), Some("default"));
        assert!(store.get(&broker_kind(), "other", "default").await.unwrap().is_none());

        assert!(store.delete(&broker_kind(), "default", "default").await);
        assert!(!store.delete(&broker_kind(), "default", "default").await);
        assert!(store.get(&broker_kind(), "default", "default").await.unwrap().is_none());
    }

    #[async_std::test]
    async fn list_filters_by_selector() {
        let store = MemoryStore::new();
        store.apply(broker("default", "a", &[("team", "payments")], None)).await.unwrap();
        store.apply(broker("default", "b", &[("team", "search")], None)).await.unwrap();
        store.apply(broker("other", "c", &[("team", "payments")], None)).await.unwrap();

        let selector = Selector::try_from(&LabelSelector {
            match_labels: Some([("team".to_string(), "payments".to_string())].into()),
            ..Default::default()
        })
        .unwrap();
        let found = store.list(&broker_kind(), "default", &selector).await.unwrap();
        let names: Vec<_> = found.iter().filter_map(|o| o.metadata.name.as_deref()).collect();
        assert_eq!(names, vec!["a"]);

        let all = store.list(&broker_kind(), "default", &Selector::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[async_std::test]
    async fn changes_are_broadcast() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();
        store.apply(broker("default", "a", &[], None)).await.unwrap();
        store.delete(&broker_kind(), "default", "a").await;

        for _ in 0..2 {
            let change = changes.recv().await.unwrap();
            assert_eq!(change.kind, broker_kind());
            assert_eq!((change.namespace.as_str(), change.name.as_str()), ("default", "a"));
        }
    }

    #[async_std::test]
    async fn stale_buckets_fail_lookups() {
        let store = MemoryStore::new();
        store.set_stale(&broker_kind(), "default", true).await;
        assert!(matches!(
            store.get(&broker_kind(), "default", "a").await,
            Err(CacheError::Stale(_))
        ));
        store.set_stale(&broker_kind(), "default", false).await;
        assert!(store.get(&broker_kind(), "default", "a").await.unwrap().is_none());
    }

    #[async_std::test]
    async fn apply_requires_identity() {
        let store = MemoryStore::new();
        let mut obj = broker("default", "a", &[], None);
        obj.metadata.namespace = None;
        assert!(matches!(store.apply(obj).await, Err(CacheError::Api(_))));
    }
}
