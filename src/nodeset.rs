//! Which agents are entitled to which resources.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::Mutex;

/// One authorisation scope: a resource plural within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    pub group: String,
    pub resource: String,
    pub namespace: String,
}

impl Key {
    pub fn new(
        group: impl Into<String>,
        resource: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Key {
            group: group.into(),
            resource: resource.into(),
            namespace: namespace.into(),
        }
    }

    /// The unrestricted scope.
    pub fn any() -> Self {
        Key::new("*", "*", "*")
    }

    /// The same group/resource granted across all namespaces.
    pub fn all_namespaces(&self) -> Self {
        Key::new(self.group.clone(), self.resource.clone(), "*")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.resource, self.namespace)
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// group/resource/namespace -> agent names.
    data: HashMap<String, HashSet<String>>,
    /// Agents whose authorisation has been resolved this session.
    all: HashSet<String>,
}

/// The in-memory authorisation index.
///
/// Entries accumulate for the lifetime of the process: an agent's scopes
/// are resolved once on first contact and only a restart forgets them.
#[derive(Debug, Default)]
pub struct NodeSet {
    inner: Mutex<Inner>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` has been resolved already.
    pub fn has(&self, name: &str) -> bool {
        self.inner.lock().all.contains(name)
    }

    /// The agents granted exactly `key`.
    pub fn get(&self, key: &Key) -> HashSet<String> {
        self.inner
            .lock()
            .data
            .get(&key.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// The agents entitled to events under `key`: the exact scope, the
    /// all-namespaces form of the same group/resource, and the
    /// unrestricted scope.
    pub fn get_union(&self, key: &Key) -> HashSet<String> {
        let inner = self.inner.lock();
        let mut union = HashSet::new();
        for k in [key.clone(), key.all_namespaces(), Key::any()] {
            if let Some(names) = inner.data.get(&k.to_string()) {
                union.extend(names.iter().cloned());
            }
        }
        union
    }

    /// Atomically marks `name` resolved and adds it to every listed scope.
    pub fn set(&self, name: &str, keys: &[Key]) {
        let mut inner = self.inner.lock();
        inner.all.insert(name.to_owned());
        for key in keys {
            inner
                .data
                .entry(key.to_string())
                .or_default()
                .insert(name.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_agents_are_not_resolved() {
        let set = NodeSet::new();
        assert!(!set.has("edge-1"));
        assert!(set.get(&Key::new("", "pods", "default")).is_empty());
    }

    #[test]
    fn set_marks_resolved_even_with_no_keys() {
        let set = NodeSet::new();
        set.set("edge-1", &[]);
        assert!(set.has("edge-1"));
    }

    #[test]
    fn get_returns_exactly_the_granted_scope() {
        let set = NodeSet::new();
        let pods = Key::new("", "pods", "default");
        set.set("edge-1", std::slice::from_ref(&pods));
        set.set("edge-2", &[Key::new("apps", "deployments", "default")]);

        assert_eq!(
            set.get(&pods),
            HashSet::from(["edge-1".to_owned()])
        );
    }

    #[test]
    fn union_includes_cluster_wide_and_any_grants() {
        let set = NodeSet::new();
        set.set("scoped", &[Key::new("", "pods", "default")]);
        set.set("cluster", &[Key::new("", "pods", "*")]);
        set.set("admin", &[Key::any()]);
        set.set("other", &[Key::new("", "secrets", "default")]);

        let union = set.get_union(&Key::new("", "pods", "default"));
        assert_eq!(
            union,
            HashSet::from([
                "scoped".to_owned(),
                "cluster".to_owned(),
                "admin".to_owned(),
            ])
        );
    }

    #[test]
    fn grants_accumulate_across_set_calls() {
        let set = NodeSet::new();
        let key = Key::new("", "pods", "default");
        set.set("edge-1", std::slice::from_ref(&key));
        set.set("edge-2", std::slice::from_ref(&key));
        assert_eq!(set.get(&key).len(), 2);
    }
}
