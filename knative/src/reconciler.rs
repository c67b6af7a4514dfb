//! One reconcile pass for any Source-shaped resource.
use crate::cache::ObjectLookup;
use crate::duck::v1::{SinkManager, SourceConditionType, SourceSpec, SourceStatus};
use crate::error::{Error, ResolveError};
use crate::resolver::Resolver;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use knative_conditions::{ConditionManager, ConditionSet};
use kube::{
    api::{Api, Patch, PatchParams},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// A resource that carries a [`SourceSpec`] and a [`SourceStatus`].
pub trait Source:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
    type Condition: SourceConditionType + Serialize + DeserializeOwned + Send + Sync;

    fn source_spec(&self) -> &SourceSpec;

    fn source_status(&self) -> Option<&SourceStatus<Self::Condition>>;
}

/// The result of one pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileOutcome<C: SourceConditionType> {
    pub status: SourceStatus<C>,
    /// Whether `status` differs from what the object carries
    pub changed: bool,
    /// `false` while the sink is still expected to become addressable
    pub converged: bool,
}

pub struct SourceReconciler<S: Source, L: ?Sized> {
    resolver: Resolver<L>,
    set: ConditionSet<S::Condition>,
    escalation: Option<Duration>,
    _source: PhantomData<fn() -> S>,
}

impl<S, L> SourceReconciler<S, L>
where
    S: Source,
    L: ObjectLookup + ?Sized,
{
    /// Fails when the Source's [`ConditionType`](knative_conditions::ConditionType) is malformed.
    pub fn new(resolver: Resolver<L>) -> Result<Self, Error> {
        let set = ConditionSet::try_new()?;
        Ok(SourceReconciler {
            resolver,
            set,
            escalation: None,
            _source: PhantomData,
        })
    }

    /// Report a sink that has not become addressable within `after` as `False`.
    ///
    /// `None` keeps it `Unknown` for as long as it takes.
    pub fn with_not_addressable_escalation(mut self, after: Option<Duration>) -> Self {
        self.escalation = after;
        self
    }

    pub fn resolver(&self) -> &Resolver<L> {
        &self.resolver
    }

    pub async fn reconcile(&self, source: &S) -> Result<ReconcileOutcome<S::Condition>, Error> {
        self.reconcile_at(source, Utc::now()).await
    }

    /// Reconcile as if the pass ran at `now`, which only matters for escalation.
    #[instrument(skip(self, source, now), fields(source = ?source.meta().name))]
    pub async fn reconcile_at(
        &self,
        source: &S,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome<S::Condition>, Error> {
        let meta = source.meta();
        let namespace = meta
            .namespace
            .as_deref()
            .ok_or_else(|| Error::MissingName("metadata.namespace".into()))?;

        let previous = source.source_status();
        let mut status = previous.cloned().unwrap_or_default();

        let resolved = match &source.source_spec().sink {
            Some(destination) => destination.resolve_uri(&self.resolver, namespace).await,
            None => Err(ResolveError::EmptyDestination),
        };

        match resolved {
            Ok(uri) => status.mark_sink(uri),
            // nothing was learned about the sink, leave the status alone and retry
            Err(ResolveError::Cache(err)) => return Err(Error::Cache(err)),
            Err(err @ ResolveError::NotAddressable { .. }) => match self.escalation {
                Some(after) if self.waited_too_long(&status, after, now) => {
                    status.mark_sink_unresolved(
                        err.reason(),
                        Some(format!("{}, gave up after {:?}", err, after)),
                    );
                }
                _ => status.mark_sink_pending(err.reason(), Some(err.to_string())),
            },
            Err(err) => status.mark_sink_unresolved(err.reason(), Some(err.to_string())),
        }

        let converged = status
            .status
            .conditions
            .get_cond(&S::Condition::sinkresolved())
            .map_or(false, |c| !c.is_unknown());
        if converged && meta.generation.is_some() {
            status.status.observed_generation = meta.generation;
        }

        let changed = previous != Some(&status);
        if changed {
            info!(ready = self.manager(&mut status).is_happy(), converged, "status changed");
        } else {
            debug!("status unchanged");
        }

        Ok(ReconcileOutcome {
            status,
            changed,
            converged,
        })
    }

    fn manager<'a>(&self, status: &'a mut SourceStatus<S::Condition>) -> ConditionManager<'a, S::Condition> {
        ConditionManager::with_set(self.set, &mut status.status.conditions)
    }

    /// The sink has been reported not addressable since at least `after` before `now`, or was
    /// already given up on.
    fn waited_too_long(&self, status: &SourceStatus<S::Condition>, after: Duration, now: DateTime<Utc>) -> bool {
        let condition = match status.status.conditions.get_cond(&S::Condition::sinkresolved()) {
            Some(c) if c.reason.as_deref() == Some("NotAddressable") => c,
            _ => return false,
        };
        if condition.is_false() {
            return true;
        }
        let after = match ChronoDuration::from_std(after) {
            Ok(after) => after,
            Err(_) => return false,
        };
        match condition.last_transition_time {
            Some(since) if condition.is_unknown() => since + after <= now,
            _ => false,
        }
    }
}

/// Persists a reconciled status.
#[async_trait]
pub trait StatusWriter<S: Source>: Send + Sync {
    async fn write(&self, source: &S, status: &SourceStatus<S::Condition>) -> Result<(), Error>;
}

/// Writes `status` with a JSON merge patch on the status subresource.
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        KubeStatusWriter { client }
    }
}

#[async_trait]
impl<S: Source> StatusWriter<S> for KubeStatusWriter {
    async fn write(&self, source: &S, status: &SourceStatus<S::Condition>) -> Result<(), Error> {
        let meta = source.meta();
        let name = meta
            .name
            .as_deref()
            .ok_or_else(|| Error::MissingName("metadata.name".into()))?;
        let api: Api<S> = match meta.namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(%name, "status patched");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::{CacheError, MemoryStore};
    use crate::duck::v1::{Destination, KReference, SourceCondition};
    use crate::registry::ResourceKind;
    use crate::testing::{broker, reconciler, test_source, TestSource};
    use knative_conditions::ConditionAccessor;

    fn broker_sink(name: &str) -> Destination {
        Destination::from(KReference::named("eventing.knative.dev/v1", "Broker", name))
    }

    fn with_status(mut source: TestSource, outcome: &ReconcileOutcome<SourceCondition>) -> TestSource {
        source.status = Some(outcome.status.clone());
        source
    }

    fn sink_resolved(status: &mut SourceStatus<SourceCondition>) -> knative_conditions::Condition<SourceCondition> {
        status.manager().get_condition(SourceCondition::SinkResolved).cloned().unwrap()
    }

    fn ready(status: &mut SourceStatus<SourceCondition>) -> knative_conditions::Condition<SourceCondition> {
        status.manager().get_top_level_condition().cloned().unwrap()
    }

    #[async_std::test]
    async fn direct_uri_makes_source_ready() {
        let reconciler = reconciler(MemoryStore::new());
        let sink = Destination {
            uri: Some("http://broker.ns.svc.cluster.local".into()),
            ..Default::default()
        };
        let source = test_source("direct", 3, Some(sink));

        let mut outcome = reconciler.reconcile(&source).await.unwrap();
        assert!(outcome.changed);
        assert!(outcome.converged);
        assert_eq!(
            outcome.status.sink_uri.as_ref().map(|u| u.as_str()),
            Some("http://broker.ns.svc.cluster.local")
        );
        assert_eq!(
            serde_json::to_value(&outcome.status).unwrap()["sinkUri"],
            serde_json::json!("http://broker.ns.svc.cluster.local")
        );
        assert_eq!(outcome.status.status.observed_generation, Some(3));
        assert!(sink_resolved(&mut outcome.status).is_true());
        assert!(outcome.status.is_ready());
    }

    #[async_std::test]
    async fn second_pass_is_a_no_op() {
        let store = MemoryStore::new();
        store
            .apply(broker("default", "default", &[], Some("http://broker.example.com/ns")))
            .await
            .unwrap();
        let reconciler = reconciler(store);
        let source = test_source("idempotent", 1, Some(broker_sink("default")));

        let first = reconciler.reconcile(&source).await.unwrap();
        let source = with_status(source, &first);
        let second = reconciler.reconcile(&source).await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.status, first.status);
        assert_eq!(
            serde_json::to_string(&second.status).unwrap(),
            serde_json::to_string(&first.status).unwrap()
        );
    }

    #[async_std::test]
    async fn sink_becoming_addressable() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store
            .apply(broker("default", "default", &[], None))
            .await
            .unwrap();
        let reconciler = reconciler(store.clone());
        let source = test_source("pending", 2, Some(broker_sink("default")));

        let mut pending = reconciler.reconcile(&source).await.unwrap();
        assert!(!pending.converged);
        assert_eq!(pending.status.sink_uri, None);
        assert_eq!(pending.status.status.observed_generation, None);
        let cond = sink_resolved(&mut pending.status);
        assert!(cond.is_unknown());
        assert_eq!(cond.reason.as_deref(), Some("NotAddressable"));
        let pending_ready = ready(&mut pending.status);
        assert!(pending_ready.is_unknown());

        // still pending, nothing moves
        let source = with_status(source, &pending);
        let again = reconciler.reconcile(&source).await.unwrap();
        assert!(!again.changed);

        store
            .apply(broker("default", "default", &[], Some("http://broker.example.com")))
            .await
            .unwrap();
        let mut resolved = reconciler.reconcile(&source).await.unwrap();
        assert!(resolved.converged);
        assert_eq!(resolved.status.status.observed_generation, Some(2));
        assert_eq!(
            resolved.status.sink_uri.as_ref().map(|u| u.as_str()),
            Some("http://broker.example.com/")
        );
        let resolved_ready = ready(&mut resolved.status);
        assert!(resolved_ready.is_true());
        assert!(resolved_ready.last_transition_time >= pending_ready.last_transition_time);
        assert_ne!(resolved_ready.status, pending_ready.status);
    }

    #[async_std::test]
    async fn deleted_sink_keeps_last_uri() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store
            .apply(broker("default", "default", &[], Some("http://broker.example.com")))
            .await
            .unwrap();
        let reconciler = reconciler(store.clone());
        let source = test_source("deleted", 1, Some(broker_sink("default")));
        let first = reconciler.reconcile(&source).await.unwrap();

        let kind = ResourceKind::new("eventing.knative.dev", "v1", "Broker");
        assert!(store.delete(&kind, "default", "default").await);

        let mut source = with_status(source, &first);
        source.metadata.generation = Some(2);
        let mut outcome = reconciler.reconcile(&source).await.unwrap();
        assert!(outcome.changed);
        assert!(outcome.converged);
        assert_eq!(outcome.status.sink_uri, first.status.sink_uri);
        assert_eq!(outcome.status.status.observed_generation, Some(2));
        let cond = sink_resolved(&mut outcome.status);
        assert!(cond.is_false());
        assert_eq!(cond.reason.as_deref(), Some("NotFound"));
        assert!(ready(&mut outcome.status).is_false());
    }

    #[async_std::test]
    async fn missing_sink_is_terminal() {
        let reconciler = reconciler(MemoryStore::new());
        let source = test_source("no-sink", 1, None);
        let mut outcome = reconciler.reconcile(&source).await.unwrap();
        assert!(outcome.converged);
        assert_eq!(sink_resolved(&mut outcome.status).reason.as_deref(), Some("EmptyDestination"));
    }

    #[async_std::test]
    async fn stale_cache_leaves_status_alone() {
        let store = MemoryStore::new();
        store
            .set_stale(&ResourceKind::new("eventing.knative.dev", "v1", "Broker"), "default", true)
            .await;
        let reconciler = reconciler(store);
        let source = test_source("stale", 1, Some(broker_sink("default")));
        let err = reconciler.reconcile(&source).await.unwrap_err();
        assert!(matches!(err, Error::Cache(CacheError::Stale(_))));
        assert!(err.is_retryable());
    }

    #[async_std::test]
    async fn not_addressable_escalates_after_threshold() {
        let store = MemoryStore::new();
        store.apply(broker("default", "default", &[], None)).await.unwrap();
        let reconciler = reconciler(store).with_not_addressable_escalation(Some(Duration::from_secs(60)));
        let source = test_source("escalate", 1, Some(broker_sink("default")));

        let pending = reconciler.reconcile(&source).await.unwrap();
        assert!(!pending.converged);
        let source = with_status(source, &pending);

        let soon = Utc::now() + ChronoDuration::seconds(10);
        let still_pending = reconciler.reconcile_at(&source, soon).await.unwrap();
        assert!(!still_pending.converged);

        let later = Utc::now() + ChronoDuration::seconds(120);
        let mut escalated = reconciler.reconcile_at(&source, later).await.unwrap();
        assert!(escalated.converged);
        assert_eq!(escalated.status.status.observed_generation, Some(1));
        let cond = sink_resolved(&mut escalated.status);
        assert!(cond.is_false());
        assert_eq!(cond.reason.as_deref(), Some("NotAddressable"));

        // stays given up on instead of flapping back to Unknown
        let source = with_status(source, &escalated);
        let next = reconciler.reconcile(&source).await.unwrap();
        assert!(next.converged);
        assert!(!next.changed);
    }

    #[async_std::test]
    async fn missing_namespace_is_an_error() {
        let reconciler = reconciler(MemoryStore::new());
        let mut source = test_source("nowhere", 1, None);
        source.metadata.namespace = None;
        assert!(matches!(reconciler.reconcile(&source).await, Err(Error::MissingName(_))));
    }
}
