use kube::api::DynamicObject;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum AddressableErr {
    #[error("{0} ({1}) is not an AddressableType: {2}")]
    NotAddressable(String, String, #[source] serde_json::Error),
    #[error("service must have name to be addressable")]
    ServiceMustHaveName,
    #[error("service must have namespace")]
    ServiceMustHaveNamespace,
    #[error("unable to parse url: {0}")]
    UrlParseErr(#[from] url::ParseError),
}

/// The `status.address` of an Addressable.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Addressable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// Deprecated in favor of `url`, still set by older Addressables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Addressable {
    /// The address of the object, `None` when neither `url` nor `hostname` is set yet.
    pub fn url(&self) -> Result<Option<Url>, AddressableErr> {
        match (&self.url, self.hostname.as_deref()) {
            (Some(url), _) => Ok(Some(url.clone())),
            (None, Some(hostname)) if !hostname.is_empty() => {
                Ok(Some(Url::parse(&format!("http://{}", hostname))?))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AddressableStatus {
    #[serde(default)]
    pub address: Option<Addressable>,
}

/// The duck type every Addressable conforms to. Only `status.address` is read.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AddressableType {
    #[serde(default)]
    pub status: Option<AddressableStatus>,
}

/// Reads the address of an object of a particular kind.
///
/// Returning `Ok(None)` means the object is not addressable *yet*.
pub trait AddressAdapter: Send + Sync + Debug {
    fn address(&self, obj: &DynamicObject) -> Result<Option<Url>, AddressableErr>;
}

/// Adapter for kinds that publish `status.address.url` (or the legacy
/// `status.address.hostname`), such as Brokers and Channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusAddress;

impl AddressAdapter for StatusAddress {
    fn address(&self, obj: &DynamicObject) -> Result<Option<Url>, AddressableErr> {
        // deserialize from the borrowed value, avoiding a clone of the object data
        let duck = AddressableType::deserialize(&obj.data).map_err(|e| {
            AddressableErr::NotAddressable(
                obj.metadata.name.clone().unwrap_or_default(),
                obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_else(|| "unknown".into()),
                e,
            )
        })?;
        match duck.status.and_then(|s| s.address) {
            Some(address) => address.url(),
            None => Ok(None),
        }
    }
}

/// Adapter for core v1 Services, which are addressable by their cluster DNS name.
#[derive(Debug, Clone)]
pub struct ServiceAddress {
    cluster_domain: String,
}

impl ServiceAddress {
    pub fn new(cluster_domain: impl Into<String>) -> Self {
        ServiceAddress {
            cluster_domain: cluster_domain.into(),
        }
    }
}

impl Default for ServiceAddress {
    fn default() -> Self {
        ServiceAddress::new("cluster.local")
    }
}

impl AddressAdapter for ServiceAddress {
    fn address(&self, obj: &DynamicObject) -> Result<Option<Url>, AddressableErr> {
        let name = obj.metadata.name.as_deref().ok_or(AddressableErr::ServiceMustHaveName)?;
        let namespace = obj
            .metadata
            .namespace
            .as_deref()
            .ok_or(AddressableErr::ServiceMustHaveNamespace)?;
        Ok(Some(build_service_url(name, namespace, &self.cluster_domain)?))
    }
}

/// Construct the uri from the service metadata
fn build_service_url(name: &str, namespace: &str, cluster_domain: &str) -> Result<Url, AddressableErr> {
    let url = Url::parse(&format!("http://{name}.{namespace}.svc.{cluster_domain}"))?;
    Ok(url)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::read_mock;

    #[test]
    fn broker_uri() {
        let broker = read_mock::<DynamicObject>("default_broker.yaml");
        let uri = StatusAddress.address(&broker).unwrap().expect("broker is addressable");
        assert_eq!(uri.scheme(), "http");
        assert_eq!(uri.host().unwrap().to_string(), "broker-ingress.default.svc.cluster.local");
        assert_eq!(uri.path(), "/default/default");
    }

    #[test]
    fn broker_status_deserializes_into_addressable() {
        let broker = read_mock::<DynamicObject>("default_broker.yaml");
        let addressable: AddressableType = serde_json::from_value(broker.data)
            .expect("broker status deserializes into AddressableType");
        let uri = addressable.status
            .and_then(|s| s.address)
            .and_then(|a| a.url().unwrap())
            .expect("url set on default broker");
        assert_eq!(uri.host().unwrap().to_string(), "broker-ingress.default.svc.cluster.local");
    }

    #[test]
    fn pending_broker_is_not_yet_addressable() {
        let broker = read_mock::<DynamicObject>("pending_broker.yaml");
        assert_eq!(StatusAddress.address(&broker).unwrap(), None);
    }

    #[test]
    fn legacy_hostname_is_addressable() {
        let channel = read_mock::<DynamicObject>("legacy_channel.yaml");
        let uri = StatusAddress.address(&channel).unwrap().expect("hostname is set");
        assert_eq!(uri.as_str(), "http://legacy-kn-channel.default.svc.cluster.local/");
    }

    #[test]
    fn malformed_address_is_an_error() {
        let broker: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "eventing.knative.dev/v1",
            "kind": "Broker",
            "metadata": { "name": "broken", "namespace": "default" },
            "status": { "address": { "url": "not a url" } }
        }))
        .unwrap();
        assert!(matches!(
            StatusAddress.address(&broker),
            Err(AddressableErr::NotAddressable(name, kind, _)) if name == "broken" && kind == "Broker"
        ));
    }

    #[test]
    fn service_uri() {
        let service = read_mock::<DynamicObject>("default_service.yaml");
        let uri = ServiceAddress::default().address(&service).unwrap().expect("services are addressable");
        assert_eq!(uri.scheme(), "http");
        assert_eq!(uri.host().unwrap().to_string(), "default.default.svc.cluster.local");
        assert_eq!(uri.path(), "/");
    }

    #[test]
    fn service_uri_uses_cluster_domain() {
        let service = read_mock::<DynamicObject>("default_service.yaml");
        let uri = ServiceAddress::new("corp.internal").address(&service).unwrap().unwrap();
        assert_eq!(uri.host().unwrap().to_string(), "default.default.svc.corp.internal");
    }
}
