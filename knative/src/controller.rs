//! Drives [`SourceReconciler`] passes for every Source of one kind.
use crate::cache::{ObjectCache, ObjectChange, ObjectLookup};
use crate::config::ControllerConfig;
use crate::error::Error;
use crate::reconciler::{KubeStatusWriter, Source, SourceReconciler, StatusWriter};
use crate::registry::ResourceKind;
use crate::resolver::Resolver;
use crate::tracker::{ObjectKey, Target, Tracker};
use crate::workqueue::WorkQueue;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    runtime::watcher::{watcher, Event},
    Client,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Controller<S: Source, L: ?Sized> {
    kind: ResourceKind,
    reconciler: SourceReconciler<S, L>,
    writer: Arc<dyn StatusWriter<S>>,
    queue: WorkQueue<ObjectKey>,
    tracker: Tracker,
    /// Latest observed copy of every Source
    sources: Mutex<HashMap<ObjectKey, S>>,
    workers: usize,
    resync: Duration,
    timeout: Duration,
}

impl<S: Source> Controller<S, ObjectCache> {
    /// A controller resolving sinks through an [`ObjectCache`] and writing status through the
    /// API server, configured by `config`.
    pub fn from_config(client: Client, config: &ControllerConfig) -> Result<Self, Error> {
        config.validate()?;
        let registry = config.registry()?;
        let cache = ObjectCache::new(client.clone())
            .with_sync_timeout(config.cache_sync_timeout())
            .with_backoff(config.backoff());
        let resolver = Resolver::new(Arc::new(cache), Arc::new(registry));
        let reconciler = SourceReconciler::new(resolver)?
            .with_not_addressable_escalation(config.not_addressable_escalation());
        Ok(Controller::new(
            reconciler,
            Arc::new(KubeStatusWriter::new(client)),
            config,
        ))
    }
}

impl<S, L> Controller<S, L>
where
    S: Source,
    L: ObjectLookup + ?Sized + 'static,
{
    pub fn new(
        reconciler: SourceReconciler<S, L>,
        writer: Arc<dyn StatusWriter<S>>,
        config: &ControllerConfig,
    ) -> Self {
        Controller {
            kind: ResourceKind::new(&S::group(&()), &S::version(&()), &S::kind(&())),
            reconciler,
            writer,
            queue: WorkQueue::new(config.backoff()),
            tracker: Tracker::new(),
            sources: Mutex::new(HashMap::new()),
            workers: config.workers,
            resync: config.resync_period(),
            timeout: config.reconcile_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<ObjectKey, S>> {
        match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn key_of(&self, source: &S) -> Option<ObjectKey> {
        let meta = source.meta();
        Some(ObjectKey {
            kind: self.kind.clone(),
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
        })
    }

    /// Record the latest copy of `source` and queue it.
    pub fn observe(&self, source: S) {
        let key = match self.key_of(&source) {
            Some(key) => key,
            None => {
                warn!(?source, "ignoring source without namespace or name");
                return;
            }
        };
        self.sources().insert(key.clone(), source);
        self.queue.add(key);
    }

    /// Drop everything known about a deleted Source.
    pub fn forget(&self, source: &S) {
        if let Some(key) = self.key_of(source) {
            self.forget_key(&key);
        }
    }

    fn forget_key(&self, key: &ObjectKey) {
        debug!(%key, "forgetting");
        self.sources().remove(key);
        self.tracker.untrack(key);
        self.queue.forget(key);
    }

    /// Queue every Source whose sink may have been affected by `change`.
    pub fn object_changed(&self, change: &ObjectChange) {
        for key in self.tracker.affected(change) {
            debug!(%key, kind = %change.kind, name = %change.name, "sink changed");
            self.queue.add(key);
        }
    }

    /// Run one pass for `key`, writing the status back if it changed.
    ///
    /// `Ok(false)` means the Source has been deleted and there was nothing to do.
    pub async fn process(&self, key: &ObjectKey) -> Result<bool, Error> {
        let source = match self.sources().get(key) {
            Some(source) => source.clone(),
            None => return Ok(false),
        };
        let target = source
            .source_spec()
            .sink
            .as_ref()
            .and_then(|sink| Target::for_destination(sink, &key.namespace));
        self.tracker.track(key.clone(), target);

        let outcome = tokio::time::timeout(self.timeout, self.reconciler.reconcile(&source))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        if outcome.changed {
            self.writer.write(&source, &outcome.status).await?;
        }
        Ok(true)
    }

    /// Schedule the next pass for `key` given the result of the last one.
    fn handle(&self, key: &ObjectKey, result: Result<bool, Error>) {
        match result {
            Ok(false) => {
                debug!(%key, "source gone, dropping");
                self.queue.forget(key);
            }
            Ok(true) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), self.resync);
            }
            Err(err) if err.is_retryable() => {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(%key, error = %err, ?delay, "reconcile failed, retrying");
            }
            Err(err) => {
                warn!(%key, error = %err, "reconcile failed");
                self.queue.add_after(key.clone(), self.resync);
            }
        }
    }

    async fn run_worker(self: Arc<Self>) {
        while let Some(key) = self.queue.get().await {
            let result = self.process(&key).await;
            self.handle(&key, result);
            self.queue.done(&key);
        }
    }

    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|_| tokio::spawn(self.clone().run_worker()))
            .collect()
    }

    /// Requeue Sources as the objects their sinks point at change.
    pub async fn forward_changes(self: Arc<Self>, mut changes: broadcast::Receiver<ObjectChange>) {
        loop {
            match changes.recv().await {
                Ok(change) => self.object_changed(&change),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "change notifications dropped, requeueing all sources");
                    let keys: Vec<_> = self.sources().keys().cloned().collect();
                    for key in keys {
                        self.queue.add(key);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn restarted(&self, sources: Vec<S>) {
        let live: HashSet<ObjectKey> = sources.iter().filter_map(|s| self.key_of(s)).collect();
        let gone: Vec<_> = self
            .sources()
            .keys()
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect();
        for key in gone {
            self.forget_key(&key);
        }
        for source in sources {
            self.observe(source);
        }
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Watch every Source of this kind and reconcile until the watch ends.
    pub async fn run(self: Arc<Self>, client: Client) -> Result<(), Error> {
        info!(kind = %self.kind, workers = self.workers, "starting controller");
        let workers = self.spawn_workers();
        let forwarder = tokio::spawn(
            self.clone()
                .forward_changes(self.reconciler.resolver().lookup().subscribe()),
        );

        let api: Api<S> = Api::all(client);
        let stream = watcher(api, ListParams::default());
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Applied(source)) => self.observe(source),
                Ok(Event::Deleted(source)) => self.forget(&source),
                Ok(Event::Restarted(sources)) => {
                    debug!(count = sources.len(), "source watch restart");
                    self.restarted(sources);
                }
                Err(err) => warn!(error = %err, "source watch failed"),
            }
        }

        warn!(kind = %self.kind, "source watch ended, shutting down");
        self.shutdown();
        forwarder.abort();
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}
