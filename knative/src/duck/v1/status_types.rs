use knative_conditions::{ConditionAccessor, ConditionType, Conditions};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The fields every Knative resource status carries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Status<C: ConditionType> {
    /// ObservedGeneration is the 'Generation' of the resource that
    /// was last processed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Conditions the latest available observations of a resource's current state.
    #[serde(default)]
    pub conditions: Conditions<C>,
    /// Annotations is additional Status fields for the Resource to save some
    /// additional State as well as convey more information to the user. This is
    /// roughly akin to Annotations on any k8s resource, just the reconciler conveying
    /// richer information outwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl<C: ConditionType> Default for Status<C> {
    fn default() -> Status<C> {
        Status {
            observed_generation: None,
            conditions: Conditions::default(),
            annotations: None,
        }
    }
}

impl<C: ConditionType> ConditionAccessor<C> for Status<C> {
    fn conditions(&mut self) -> &mut Conditions<C> {
        &mut self.conditions
    }
}
