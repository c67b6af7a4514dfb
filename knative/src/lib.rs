mod duck;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod selector;
pub mod tracker;
pub mod workqueue;

#[cfg(test)]
pub(crate) mod testing;

// expose only v1 types
pub use duck::v1::*;

pub use cache::{CacheError, MemoryStore, ObjectCache, ObjectChange, ObjectLookup};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{Error, ResolveError};
pub use reconciler::{KubeStatusWriter, ReconcileOutcome, Source, SourceReconciler, StatusWriter};
pub use registry::{AddressableRegistry, ResourceKind};
pub use resolver::Resolver;

pub mod conditions {
    pub use knative_conditions::{
        Condition, ConditionAccessor, ConditionManager, ConditionSet, ConditionSeverity,
        ConditionStatus, ConditionType, Conditions,
    };
}

pub mod derive {
    pub use knative_derive::ConditionType;
}

#[doc = include_str!("../../README.md")]
#[cfg(doctest)]
pub struct ReadmeDoctests;
