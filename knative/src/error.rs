use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::duck::v1::AddressableErr;
use knative_conditions::ConditionSetError;
use kube::error::Error as KubeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The object cache could not answer a lookup
    #[error("object cache unavailable: {0}")]
    Cache(#[from] CacheError),
    /// A reconcile pass ran past its deadline
    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),
    /// A malformed ConditionType was handed to a reconciler
    #[error("invalid condition set: {0}")]
    ConditionSet(#[from] ConditionSetError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("object is missing {0}")]
    MissingName(String),
    /// Kube errors
    #[error("Error: {0}")]
    KubeError(#[from] KubeError),
}

impl Error {
    /// Whether the key should be requeued with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Cache(_) | Error::Timeout(_) | Error::KubeError(_) => true,
            Error::ConditionSet(_) | Error::Config(_) | Error::MissingName(_) => false,
        }
    }
}

/// Why a [`Destination`](crate::Destination) could not be turned into a URL.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("destination missing ref and uri, expected at least one")]
    EmptyDestination,
    #[error("invalid uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("selector for {kind} in {namespace} matched {count} objects, expected exactly one")]
    AmbiguousReference {
        kind: String,
        namespace: String,
        count: usize,
    },
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("{kind} {namespace}/{name} is not addressable: {reason}")]
    NotAddressable {
        kind: String,
        namespace: String,
        name: String,
        reason: String,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ResolveError {
    /// The condition reason recorded for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            ResolveError::EmptyDestination => "EmptyDestination",
            ResolveError::InvalidUri { .. } => "InvalidURI",
            ResolveError::InvalidReference(_) => "InvalidReference",
            ResolveError::AmbiguousReference { .. } => "AmbiguousReference",
            ResolveError::NotFound { .. } => "NotFound",
            ResolveError::NotAddressable { .. } => "NotAddressable",
            ResolveError::Cache(_) => "CacheUnavailable",
        }
    }

    /// A transient failure is expected to clear up without a change to the Source.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::NotAddressable { .. } | ResolveError::Cache(_))
    }

    pub(crate) fn not_addressable(
        kind: &str,
        namespace: &str,
        name: &str,
        err: Option<AddressableErr>,
    ) -> Self {
        ResolveError::NotAddressable {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            reason: match err {
                Some(err) => err.to_string(),
                None => "address not yet published".into(),
            },
        }
    }
}
