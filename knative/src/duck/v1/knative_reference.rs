use crate::error::ResolveError;
use crate::registry::ResourceKind;
use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// KReference contains enough information to refer to another object.
/// It's a trimmed down version of corev1.ObjectReference, extended with a label
/// selector as an alternative to the name.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KReference {
    /// Kind of the referent.
    /// More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#types-kinds
    pub kind: String,
    /// Namespace of the referent.
    /// More info: https://kubernetes.io/docs/concepts/overview/working-with-objects/namespaces/
    /// This is optional field, it gets defaulted to the object holding it if left out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Name of the referent.
    /// More info: https://kubernetes.io/docs/concepts/overview/working-with-objects/names/#names
    /// Mutually exclusive with `selector`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Selects the referent by label. Resolution requires exactly one match.
    /// Mutually exclusive with `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// API version of the referent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Group of the API, without the version of the group. Combined with `apiVersion` when the
    /// latter carries no group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// How a [`KReference`] picks its referent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Subject<'a> {
    Name(&'a str),
    Selector(&'a LabelSelector),
}

impl KReference {
    pub fn named(api_version: &str, kind: &str, name: &str) -> Self {
        KReference {
            kind: kind.into(),
            name: Some(name.into()),
            api_version: Some(api_version.into()),
            ..Default::default()
        }
    }

    pub fn selected(api_version: &str, kind: &str, selector: LabelSelector) -> Self {
        KReference {
            kind: kind.into(),
            selector: Some(selector),
            api_version: Some(api_version.into()),
            ..Default::default()
        }
    }

    /// Exactly one of `name` or `selector` must be set.
    pub fn subject(&self) -> Result<Subject<'_>, ResolveError> {
        match (self.name.as_deref(), self.selector.as_ref()) {
            (Some(name), None) if !name.is_empty() => Ok(Subject::Name(name)),
            (None, Some(selector)) => Ok(Subject::Selector(selector)),
            (Some(_), Some(_)) => Err(ResolveError::InvalidReference(format!(
                "{} reference sets both name and selector",
                self.kind
            ))),
            _ => Err(ResolveError::InvalidReference(format!(
                "{} reference needs a name or a selector",
                self.kind
            ))),
        }
    }

    /// The apiVersion of the referent, combining `group` and `apiVersion` when the latter is
    /// missing its group.
    pub fn full_api_version(&self) -> Option<String> {
        match (self.api_version.as_ref(), self.group.as_ref()) {
            (Some(api_version), _) if api_version.contains('/') => Some(api_version.clone()),
            (Some(api_version), Some(group)) if !group.is_empty() => {
                Some(format!("{}/{}", group, api_version))
            }
            (Some(api_version), _) => Some(api_version.clone()),
            (None, _) => None,
        }
    }

    pub fn resource_kind(&self) -> Result<ResourceKind, ResolveError> {
        let api_version = self.full_api_version().ok_or_else(|| {
            ResolveError::InvalidReference(format!("{} reference is missing apiVersion", self.kind))
        })?;
        ResourceKind::from_api_version(&api_version, &self.kind)
    }

    /// The namespace of the referent, defaulting to that of the referring object.
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(namespace) if !namespace.is_empty() => namespace,
            _ => default,
        }
    }
}

impl From<KReference> for ObjectReference {
    fn from(reference: KReference) -> ObjectReference {
        let api_version = reference.full_api_version();
        ObjectReference {
            name: reference.name,
            namespace: reference.namespace,
            api_version,
            kind: Some(reference.kind),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn serialize_reference() {
        let reference = KReference::named("eventing.knative.dev/v1", "Broker", "default");
        let json = json!({
            "kind": "Broker",
            "apiVersion": "eventing.knative.dev/v1",
            "name": "default"
        });
        assert_eq!(serde_json::to_value(&reference).unwrap(), json);
    }

    #[test]
    fn deserialize_selector_reference() {
        let reference: KReference = serde_json::from_value(json!({
            "kind": "Broker",
            "apiVersion": "eventing.knative.dev/v1",
            "selector": { "matchLabels": { "team": "payments" } }
        }))
        .unwrap();
        let expected = LabelSelector {
            match_labels: Some(BTreeMap::from([("team".to_string(), "payments".to_string())])),
            ..Default::default()
        };
        assert_eq!(reference.subject().unwrap(), Subject::Selector(&expected));
    }

    #[test]
    fn subject_requires_exactly_one_of_name_and_selector() {
        let both = KReference {
            selector: Some(LabelSelector::default()),
            ..KReference::named("v1", "Service", "svc")
        };
        assert!(matches!(both.subject(), Err(ResolveError::InvalidReference(_))));

        let neither = KReference {
            name: Some(String::new()),
            ..KReference::named("v1", "Service", "svc")
        };
        assert!(matches!(neither.subject(), Err(ResolveError::InvalidReference(_))));
    }

    #[test]
    fn group_is_combined_with_api_version() {
        let reference = KReference {
            api_version: Some("v1".into()),
            group: Some("eventing.knative.dev".into()),
            ..KReference::named("v1", "Broker", "default")
        };
        assert_eq!(reference.full_api_version().as_deref(), Some("eventing.knative.dev/v1"));
        assert_eq!(
            reference.resource_kind().unwrap(),
            ResourceKind::new("eventing.knative.dev", "v1", "Broker")
        );

        let core = KReference::named("v1", "Service", "svc");
        assert_eq!(core.resource_kind().unwrap(), ResourceKind::new("", "v1", "Service"));
    }

    #[test]
    fn namespace_defaults_to_referrer() {
        let mut reference = KReference::named("v1", "Service", "svc");
        assert_eq!(reference.namespace_or("source-ns"), "source-ns");
        reference.namespace = Some("sinks".into());
        assert_eq!(reference.namespace_or("source-ns"), "sinks");
    }
}
