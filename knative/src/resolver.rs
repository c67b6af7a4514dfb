//! Turns a [`Destination`] into the URI events are sent to.
use crate::cache::ObjectLookup;
use crate::duck::v1::{Destination, KReference, SinkUri, Subject};
use crate::error::ResolveError;
use crate::registry::AddressableRegistry;
use crate::selector::Selector;
use std::convert::TryFrom;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

/// Resolves destinations against the objects visible through an [`ObjectLookup`].
///
/// Holds no state of its own; the same inputs and store contents always give the same result.
pub struct Resolver<L: ?Sized> {
    lookup: Arc<L>,
    registry: Arc<AddressableRegistry>,
}

impl<L: ?Sized> Clone for Resolver<L> {
    fn clone(&self) -> Self {
        Resolver {
            lookup: self.lookup.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<L> Resolver<L>
where
    L: ObjectLookup + ?Sized,
{
    pub fn new(lookup: Arc<L>, registry: Arc<AddressableRegistry>) -> Self {
        Resolver { lookup, registry }
    }

    pub fn lookup(&self) -> &Arc<L> {
        &self.lookup
    }

    pub fn registry(&self) -> &AddressableRegistry {
        &self.registry
    }

    /// Resolve `destination`, looking references up in `namespace` unless they name their own.
    #[instrument(level = "debug", skip(self, destination))]
    ///
    /// A direct uri comes back exactly as written.
    pub async fn resolve(&self, destination: &Destination, namespace: &str) -> Result<SinkUri, ResolveError> {
        let uri = destination.uri.as_deref().filter(|uri| !uri.is_empty());
        let resolved = match (&destination.ref_, uri) {
            (None, None) => return Err(ResolveError::EmptyDestination),
            (None, Some(uri)) => parse_absolute(uri)?,
            (Some(reference), suffix) => {
                let base = self.resolve_reference(reference, namespace).await?;
                match suffix {
                    Some(suffix) => compose(&base, suffix)?,
                    None => SinkUri::from(base),
                }
            }
        };
        debug!(uri = %resolved, "resolved");
        Ok(resolved)
    }

    async fn resolve_reference(&self, reference: &KReference, namespace: &str) -> Result<Url, ResolveError> {
        let kind = reference.resource_kind()?;
        let adapter = self.registry.adapter(&kind)?;
        let namespace = reference.namespace_or(namespace);

        let obj = match reference.subject()? {
            Subject::Name(name) => self
                .lookup
                .get(&kind, namespace, name)
                .await?
                .ok_or_else(|| ResolveError::NotFound {
                    kind: kind.kind.clone(),
                    namespace: namespace.into(),
                    name: name.into(),
                })?,
            Subject::Selector(selector) => {
                let selector = Selector::try_from(selector)
                    .map_err(|err| ResolveError::InvalidReference(err.to_string()))?;
                let mut found = self.lookup.list(&kind, namespace, &selector).await?;
                match (found.pop(), found.len()) {
                    (Some(obj), 0) => obj,
                    (None, _) => {
                        return Err(ResolveError::NotFound {
                            kind: kind.kind.clone(),
                            namespace: namespace.into(),
                            name: format!("matching {}", selector),
                        })
                    }
                    (Some(_), rest) => {
                        return Err(ResolveError::AmbiguousReference {
                            kind: kind.kind.clone(),
                            namespace: namespace.into(),
                            count: rest + 1,
                        })
                    }
                }
            }
        };

        let name = obj.metadata.name.as_deref().unwrap_or_default();
        match adapter.address(&obj) {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(ResolveError::not_addressable(&kind.kind, namespace, name, None)),
            Err(err) => Err(ResolveError::not_addressable(&kind.kind, namespace, name, Some(err))),
        }
    }
}

/// A direct uri must be absolute and name a host.
fn parse_absolute(uri: &str) -> Result<SinkUri, ResolveError> {
    SinkUri::parse(uri).map_err(|err| ResolveError::InvalidUri {
        uri: uri.into(),
        reason: err.to_string(),
    })
}

/// Apply a uri reference to the address of the referent.
///
/// A suffix with a scheme replaces the base, an absolute path replaces its path, and a
/// relative path is appended below the base path.
fn compose(base: &Url, suffix: &str) -> Result<SinkUri, ResolveError> {
    if Url::parse(suffix).is_ok() {
        return parse_absolute(suffix);
    }
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(suffix)
        .map(SinkUri::from)
        .map_err(|err| ResolveError::InvalidUri {
            uri: suffix.into(),
            reason: err.to_string(),
        })
}
