use super::{CacheError, ObjectChange, ObjectLookup, CHANGE_CHANNEL_CAPACITY};
use crate::registry::ResourceKind;
use crate::selector::Selector;
use crate::workqueue::Backoff;
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, DynamicObject, ListParams},
    core::TypeMeta,
    discovery::pinned_kind,
    runtime::watcher::{watcher, Event},
    Client,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

type BucketKey = (ResourceKind, String);
type Buckets = Arc<Mutex<HashMap<BucketKey, Arc<Bucket>>>>;

#[derive(Clone, Debug, PartialEq)]
enum BucketState {
    /// Waiting for the initial list
    Syncing,
    Ready,
    /// The watch failed and is relisting
    Stale,
    Failed(CacheError),
}

/// The objects of one kind in one namespace, kept current by a single watch.
#[derive(Debug)]
struct Bucket {
    label: String,
    objects: RwLock<BTreeMap<String, Arc<DynamicObject>>>,
    state_tx: watch::Sender<BucketState>,
    state_rx: watch::Receiver<BucketState>,
}

impl Bucket {
    fn new(kind: &ResourceKind, namespace: &str) -> Self {
        let (state_tx, state_rx) = watch::channel(BucketState::Syncing);
        Bucket {
            label: format!("{} in {}", kind, namespace),
            objects: RwLock::new(BTreeMap::new()),
            state_tx,
            state_rx,
        }
    }

    fn set_state(&self, state: BucketState) {
        // the bucket holds a receiver, so sending cannot fail
        let _ = self.state_tx.send(state);
    }

    /// Wait until the initial list has been stored.
    async fn wait_ready(&self, timeout: Duration) -> Result<(), CacheError> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                let state = rx.borrow().clone();
                match state {
                    BucketState::Ready => return Ok(()),
                    BucketState::Stale => return Err(CacheError::Stale(self.label.clone())),
                    BucketState::Failed(err) => return Err(err),
                    BucketState::Syncing => {}
                }
                if rx.changed().await.is_err() {
                    return Err(CacheError::Stale(self.label.clone()));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Stale(self.label.clone())),
        }
    }

    /// Store an added or modified object, returning its name.
    async fn applied(&self, obj: DynamicObject) -> Option<String> {
        let name = obj.metadata.name.clone()?;
        self.objects.write().await.insert(name.clone(), Arc::new(obj));
        Some(name)
    }

    async fn deleted(&self, obj: &DynamicObject) -> Option<String> {
        let name = obj.metadata.name.clone()?;
        self.objects.write().await.remove(&name);
        Some(name)
    }

    /// Replace the contents with a fresh list, returning every name that may have changed.
    async fn restarted(&self, objs: Vec<DynamicObject>) -> BTreeSet<String> {
        let fresh: BTreeMap<String, Arc<DynamicObject>> = objs
            .into_iter()
            .filter_map(|obj| Some((obj.metadata.name.clone()?, Arc::new(obj))))
            .collect();
        let mut lock = self.objects.write().await;
        let touched = lock.keys().chain(fresh.keys()).cloned().collect();
        *lock = fresh;
        drop(lock);
        self.set_state(BucketState::Ready);
        touched
    }
}

/// An [`ObjectLookup`] backed by one `kube` watch per kind and namespace.
///
/// Buckets are created on first use; lookups wait up to the sync timeout for the initial list.
#[derive(Clone)]
pub struct ObjectCache {
    client: Client,
    buckets: Buckets,
    sender: broadcast::Sender<ObjectChange>,
    sync_timeout: Duration,
    backoff: Backoff,
}

impl ObjectCache {
    pub fn new(client: Client) -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        ObjectCache {
            client,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            sender,
            sync_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Number of live watches.
    pub fn watches(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or_default()
    }

    fn bucket(&self, kind: &ResourceKind, namespace: &str) -> Result<Arc<Bucket>, CacheError> {
        let key = (kind.clone(), namespace.to_string());
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| CacheError::Api("bucket map poisoned".into()))?;
        if let Some(bucket) = buckets.get(&key) {
            return Ok(bucket.clone());
        }

        let bucket = Arc::new(Bucket::new(kind, namespace));
        buckets.insert(key.clone(), bucket.clone());
        drop(buckets);

        info!(%kind, %namespace, "starting watch");
        tokio::spawn(run_bucket(
            self.client.clone(),
            key,
            bucket.clone(),
            self.buckets.clone(),
            self.sender.clone(),
            self.backoff.clone(),
        ));
        Ok(bucket)
    }

    async fn synced(&self, kind: &ResourceKind, namespace: &str) -> Result<Arc<Bucket>, CacheError> {
        let bucket = self.bucket(kind, namespace)?;
        bucket.wait_ready(self.sync_timeout).await?;
        Ok(bucket)
    }
}

fn forget(buckets: &Buckets, key: &BucketKey) {
    if let Ok(mut buckets) = buckets.lock() {
        buckets.remove(key);
    }
}

async fn run_bucket(
    client: Client,
    key: BucketKey,
    bucket: Arc<Bucket>,
    buckets: Buckets,
    sender: broadcast::Sender<ObjectChange>,
    backoff: Backoff,
) {
    let (kind, namespace) = &key;
    let (ar, _caps) = match pinned_kind(&client, &kind.to_gvk()).await {
        Ok(found) => found,
        Err(err) => {
            warn!(%kind, %namespace, error = %err, "discovery failed");
            bucket.set_state(BucketState::Failed(CacheError::Discovery {
                kind: kind.to_string(),
                reason: err.to_string(),
            }));
            // the next lookup retries discovery
            forget(&buckets, &key);
            return;
        }
    };

    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &ar);
    let stream = watcher(api, ListParams::default());
    futures::pin_mut!(stream);

    let types = TypeMeta {
        api_version: kind.api_version(),
        kind: kind.kind.clone(),
    };
    let notify = |name: String| {
        let _ = sender.send(ObjectChange {
            kind: kind.clone(),
            namespace: namespace.clone(),
            name,
        });
    };
    let with_types = |mut obj: DynamicObject| {
        obj.types.get_or_insert_with(|| types.clone());
        obj
    };

    let mut failures = 0u32;
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(obj)) => {
                if let Some(name) = bucket.applied(with_types(obj)).await {
                    notify(name);
                }
            }
            Ok(Event::Deleted(obj)) => {
                if let Some(name) = bucket.deleted(&obj).await {
                    notify(name);
                }
            }
            Ok(Event::Restarted(objs)) => {
                debug!(%kind, %namespace, count = objs.len(), "watch restart");
                failures = 0;
                let objs = objs.into_iter().map(with_types).collect();
                for name in bucket.restarted(objs).await {
                    notify(name);
                }
            }
            Err(err) => {
                let delay = backoff.delay(failures);
                failures = failures.saturating_add(1);
                warn!(%kind, %namespace, error = %err, ?delay, "watch failed, relisting");
                bucket.set_state(BucketState::Stale);
                tokio::time::sleep(delay).await;
            }
        }
    }

    warn!(%kind, %namespace, "watch stream ended");
    bucket.set_state(BucketState::Stale);
    forget(&buckets, &key);
}

#[async_trait]
impl ObjectLookup for ObjectCache {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>, CacheError> {
        let bucket = self.synced(kind, namespace).await?;
        let found = bucket.objects.read().await.get(name).cloned();
        Ok(found)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Arc<DynamicObject>>, CacheError> {
        let bucket = self.synced(kind, namespace).await?;
        let lock = bucket.objects.read().await;
        Ok(lock
            .values()
            .filter(|obj| selector.matches_object(&obj.metadata))
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectChange> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::broker;

    fn kind() -> ResourceKind {
        ResourceKind::new("eventing.knative.dev", "v1", "Broker")
    }

    #[tokio::test]
    async fn lookups_wait_for_the_initial_list() {
        let bucket = Arc::new(Bucket::new(&kind(), "default"));
        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.wait_ready(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        bucket.restarted(vec![broker("default", "a", &[], None)]).await;
        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert!(bucket.objects.read().await.contains_key("a"));
    }

    #[tokio::test]
    async fn unsynced_bucket_times_out_as_stale() {
        let bucket = Bucket::new(&kind(), "default");
        let err = bucket.wait_ready(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CacheError::Stale(label) if label.contains("Broker")));
    }

    #[tokio::test]
    async fn stale_until_relisted() {
        let bucket = Bucket::new(&kind(), "default");
        bucket.restarted(vec![]).await;
        bucket.set_state(BucketState::Stale);
        assert!(bucket.wait_ready(Duration::from_millis(10)).await.is_err());
        bucket.restarted(vec![]).await;
        assert!(bucket.wait_ready(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn restart_reports_added_and_removed_names() {
        let bucket = Bucket::new(&kind(), "default");
        bucket.applied(broker("default", "a", &[], None)).await;
        bucket.applied(broker("default", "b", &[], None)).await;
        let touched = bucket
            .restarted(vec![broker("default", "b", &[], None), broker("default", "c", &[], None)])
            .await;
        assert_eq!(touched.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        let names: Vec<_> = bucket.objects.read().await.keys().cloned().collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn delete_removes() {
        let bucket = Bucket::new(&kind(), "default");
        let obj = broker("default", "a", &[], None);
        bucket.applied(obj.clone()).await;
        assert_eq!(bucket.deleted(&obj).await.as_deref(), Some("a"));
        assert!(bucket.objects.read().await.is_empty());
    }

    #[tokio::test]
    async fn discovery_failures_are_reported() {
        let bucket = Bucket::new(&kind(), "default");
        let err = CacheError::Discovery {
            kind: kind().to_string(),
            reason: "not served".into(),
        };
        bucket.set_state(BucketState::Failed(err.clone()));
        assert_eq!(bucket.wait_ready(Duration::from_millis(10)).await, Err(err));
    }
}
