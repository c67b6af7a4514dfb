//! Remembers which sink each Source points at, so a change to the sink requeues the Source.
use crate::cache::ObjectChange;
use crate::duck::v1::{Destination, Subject};
use crate::registry::ResourceKind;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Identifies an object of a particular kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind.kind, self.namespace, self.name)
    }
}

/// What a Source's sink reference can be affected by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// A single object
    Named {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },
    /// Any object of the kind in the namespace, since any of them may start or stop matching
    Selected { kind: ResourceKind, namespace: String },
}

impl Target {
    /// The target of `destination`, `None` for a plain URI or a reference that cannot resolve.
    pub fn for_destination(destination: &Destination, namespace: &str) -> Option<Target> {
        let reference = destination.ref_.as_ref()?;
        let kind = reference.resource_kind().ok()?;
        let namespace = reference.namespace_or(namespace).to_string();
        match reference.subject().ok()? {
            Subject::Name(name) => Some(Target::Named {
                kind,
                namespace,
                name: name.into(),
            }),
            Subject::Selector(_) => Some(Target::Selected { kind, namespace }),
        }
    }
}

#[derive(Debug, Default)]
struct Index {
    by_source: HashMap<ObjectKey, Target>,
    by_target: HashMap<Target, BTreeSet<ObjectKey>>,
}

impl Index {
    fn remove(&mut self, source: &ObjectKey) {
        if let Some(previous) = self.by_source.remove(source) {
            if let Some(sources) = self.by_target.get_mut(&previous) {
                sources.remove(source);
                if sources.is_empty() {
                    self.by_target.remove(&previous);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Tracker {
    index: Mutex<Index>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record that `source` currently points at `target`, replacing what it pointed at before.
    pub fn track(&self, source: ObjectKey, target: Option<Target>) {
        let mut index = self.index();
        index.remove(&source);
        if let Some(target) = target {
            index.by_target.entry(target.clone()).or_default().insert(source.clone());
            index.by_source.insert(source, target);
        }
    }

    pub fn untrack(&self, source: &ObjectKey) {
        self.index().remove(source);
    }

    /// Sources whose sink may have changed with `change`, in a stable order.
    pub fn affected(&self, change: &ObjectChange) -> Vec<ObjectKey> {
        let index = self.index();
        let named = Target::Named {
            kind: change.kind.clone(),
            namespace: change.namespace.clone(),
            name: change.name.clone(),
        };
        let selected = Target::Selected {
            kind: change.kind.clone(),
            namespace: change.namespace.clone(),
        };
        let mut sources = BTreeSet::new();
        for target in [named, selected] {
            if let Some(found) = index.by_target.get(&target) {
                sources.extend(found.iter().cloned());
            }
        }
        sources.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.index().by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
