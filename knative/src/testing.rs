//! Fixtures shared by the unit tests.
use crate::cache::ObjectLookup;
use crate::duck::v1::{Destination, SourceCondition, SourceSpec, SourceStatus};
use crate::error::Error;
use crate::reconciler::{Source, SourceReconciler, StatusWriter};
use crate::registry::AddressableRegistry;
use crate::resolver::Resolver;
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::{Arc, Mutex};

pub type TestSourceStatus = SourceStatus<SourceCondition>;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "sources.knative.dev",
    version = "v1",
    kind = "TestSource",
    namespaced,
    status = "TestSourceStatus"
)]
pub struct TestSourceSpec {
    #[serde(flatten)]
    pub source: SourceSpec,
}

impl Source for TestSource {
    type Condition = SourceCondition;

    fn source_spec(&self) -> &SourceSpec {
        &self.spec.source
    }

    fn source_status(&self) -> Option<&SourceStatus<SourceCondition>> {
        self.status.as_ref()
    }
}

pub fn test_source(name: &str, generation: i64, sink: Option<Destination>) -> TestSource {
    let mut source = TestSource::new(
        name,
        TestSourceSpec {
            source: SourceSpec {
                sink,
                ce_overrides: None,
            },
        },
    );
    source.metadata.namespace = Some("default".into());
    source.metadata.generation = Some(generation);
    source
}

pub fn mock_path() -> String {
    format!("{}/{}/", env!("CARGO_MANIFEST_DIR"), "../test/mock")
}

pub fn read_mock<T: DeserializeOwned>(filename: &str) -> T {
    let path = mock_path() + filename;
    let yaml = fs::read_to_string(path).expect("path to mock");
    serde_yaml::from_str(&yaml).unwrap()
}

/// A Broker in `namespace`, addressable at `url` when one is given.
pub fn broker(namespace: &str, name: &str, labels: &[(&str, &str)], url: Option<&str>) -> DynamicObject {
    let labels: serde_json::Map<String, serde_json::Value> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
        .collect();
    let status = match url {
        Some(url) => serde_json::json!({ "address": { "url": url } }),
        None => serde_json::json!({}),
    };
    serde_json::from_value(serde_json::json!({
        "apiVersion": "eventing.knative.dev/v1",
        "kind": "Broker",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "status": status,
    }))
    .unwrap()
}

pub fn resolver<L: ObjectLookup + 'static>(lookup: L) -> Resolver<L> {
    Resolver::new(
        Arc::new(lookup),
        Arc::new(AddressableRegistry::with_defaults("cluster.local")),
    )
}

pub fn reconciler<L: ObjectLookup + 'static>(lookup: L) -> SourceReconciler<TestSource, L> {
    SourceReconciler::new(resolver(lookup)).unwrap()
}

/// Remembers every status written, by source name.
#[derive(Default)]
pub struct RecordingWriter {
    written: Mutex<Vec<(String, TestSourceStatus)>>,
}

impl RecordingWriter {
    pub fn written(&self) -> Vec<(String, TestSourceStatus)> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusWriter<TestSource> for RecordingWriter {
    async fn write(&self, source: &TestSource, status: &TestSourceStatus) -> Result<(), Error> {
        let name = source.metadata.name.clone().unwrap_or_default();
        self.written.lock().unwrap().push((name, status.clone()));
        Ok(())
    }
}
