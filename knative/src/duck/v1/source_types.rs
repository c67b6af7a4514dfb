use super::{
    knative_reference::KReference,
    sink_uri::SinkUri,
    status_types::Status,
};
use crate::cache::ObjectLookup;
use crate::derive::ConditionType;
use crate::error::ResolveError;
use crate::resolver::Resolver;
use knative_conditions::{ConditionAccessor, Conditions};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Sink is a reference to an object that will resolve to a uri to use as the sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<Destination>,
    /// CloudEventOverrides defines overrides to control the output format and
    /// modifications of the event sent to the sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ce_overrides: Option<CloudEventOverrides>,
}

impl SourceSpec {
    pub fn ce_overrides(&self) -> Option<CloudEventOverrides> {
        self.ce_overrides.clone()
    }
}

/// Destination represents a target of an invocation over HTTP.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Destination {
    /// Ref points to an Addressable.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<KReference>,
    /// URI can be an absolute URL (non-empty scheme and non-empty host) pointing to the target,
    /// or a relative URI. Relative URIs are resolved against the address retrieved from Ref.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl From<KReference> for Destination {
    fn from(reference: KReference) -> Self {
        Destination {
            ref_: Some(KReference {
                // combine the group and api_version, handling the case that this was done already
                api_version: reference.full_api_version(),
                group: None,
                ..reference
            }),
            uri: None,
        }
    }
}

impl From<Url> for Destination {
    fn from(uri: Url) -> Self {
        Destination {
            ref_: None,
            uri: Some(uri.into()),
        }
    }
}

impl Destination {
    /// A reference to an Addressable with a uri suffix appended to its address.
    pub fn with_suffix(reference: KReference, suffix: &str) -> Self {
        Destination {
            uri: Some(suffix.into()),
            ..Destination::from(reference)
        }
    }

    /// Resolve to a concrete URI. References are looked up in `namespace` unless they name their
    /// own.
    pub async fn resolve_uri<L>(
        &self,
        resolver: &Resolver<L>,
        namespace: &str,
    ) -> Result<SinkUri, ResolveError>
    where
        L: ObjectLookup + ?Sized,
    {
        resolver.resolve(self, namespace).await
    }
}

/// CloudEventOverrides defines arguments for a Source that control the output
/// format of the CloudEvents produced by the Source.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudEventOverrides {
    /// Extensions specify what attribute are added or overridden on the
    /// outbound event. Each `Extensions` key-value pair are set on the event as
    /// an attribute extension independently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<BTreeMap<String, String>>,
}

/// CloudEventAttributes specifies the attributes that a Source
/// uses as part of its CloudEvents.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudEventAttributes {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A baseline [`ConditionType`] for [`SourceStatus`].
///
/// Custom conditions should implement [`SourceConditionType`] in order to be used by
/// [`SourceStatus`].
#[derive(ConditionType, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum SourceCondition {
    Ready,
    /// The sink has been resolved to a [`sink_uri`].
    ///
    /// [`sink_uri`]:./struct.SourceStatus.html#structfield.sink_uri
    #[dependent]
    SinkResolved,
}

/// SourceStatus shows how we expect folks to embed Addressable in
/// their Status field.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus<S: SourceConditionType> {
    /// inherits Status, which currently provides:
    /// * ObservedGeneration - the 'Generation' of the Source that was last
    ///   processed by the controller.
    /// * Conditions - the latest available observations of a resource's current
    ///   state.
    #[serde(flatten)]
    pub status: Status<S>,
    /// SinkURI is the current active sink URI that has been configured for the
    /// Source. Kept when a later resolution fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_uri: Option<SinkUri>,
    /// CloudEventAttributes are the specific attributes that the Source uses
    /// as part of its CloudEvents.
    #[serde(rename = "ceAttributes", default, skip_serializing_if = "Option::is_none")]
    pub cloud_event_attributes: Option<Vec<CloudEventAttributes>>,
}

impl<S: SourceConditionType> ConditionAccessor<S> for SourceStatus<S> {
    fn conditions(&mut self) -> &mut Conditions<S> {
        self.status.conditions()
    }
}

/// Provides management of `sink_uri` on [`SourceStatus`].
///
/// This traits helps to discourage use of the `*sinkresolved()` methods from
/// [`SourceConditionManager`], which must be disambiguated when using a custom [`ConditionType`]
/// that also has `*sinkresolved()` methods.
pub trait SinkManager<S: SourceConditionType>: SourceConditionManager<S> {
    /// Return the [`SourceStatus`] of your CRD Status type.
    fn source_status(&mut self) -> &mut SourceStatus<S>;

    /// Record the resolved sink.
    fn mark_sink(&mut self, uri: SinkUri) {
        self.source_status().sink_uri = Some(uri);
        self.manager().mark_true(S::sinkresolved());
    }

    /// The sink cannot be resolved without a change to the Source or its referent.
    ///
    /// The last resolved `sink_uri` is left in place.
    fn mark_sink_unresolved(&mut self, reason: &str, message: Option<String>) {
        self.manager().mark_false(S::sinkresolved(), reason, message);
    }

    /// The sink is expected to resolve once its referent publishes an address.
    fn mark_sink_pending(&mut self, reason: &str, message: Option<String>) {
        self.manager().mark_unknown(S::sinkresolved(), reason, message);
    }
}

impl<S: SourceConditionType> SinkManager<S> for SourceStatus<S> {
    fn source_status(&mut self) -> &mut SourceStatus<S> {
        self
    }
}
