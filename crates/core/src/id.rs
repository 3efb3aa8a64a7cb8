//! Stable object identity and set algebra over it.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Identity of a cluster object: group, kind, namespace, name.
///
/// Namespace is empty for cluster-scoped kinds. The canonical string
/// form is `group/namespace/name/kind` and round-trips via [`FromStr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(
        group: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(group, kind, "", name)
    }

    pub fn canonical(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group, self.namespace, self.name, self.kind
        )
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.group, self.namespace, self.name, self.kind
        )
    }
}

// Canonical-form ordering so sorted iteration matches the string form.
impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.group, &self.namespace, &self.name, &self.kind).cmp(&(
            &other.group,
            &other.namespace,
            &other.name,
            &other.kind,
        ))
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("malformed object id {0:?}: expected group/namespace/name/kind")]
    Malformed(String),
    #[error("object id {0:?}: empty {1} field")]
    EmptyField(String, &'static str),
}

impl FromStr for ObjectId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let &[group, namespace, name, kind] = parts.as_slice() else {
            return Err(ParseIdError::Malformed(s.to_string()));
        };
        if name.is_empty() {
            return Err(ParseIdError::EmptyField(s.to_string(), "name"));
        }
        if kind.is_empty() {
            return Err(ParseIdError::EmptyField(s.to_string(), "kind"));
        }
        Ok(ObjectId::new(group, kind, namespace, name))
    }
}

/// Unordered set of [`ObjectId`] with fast membership.
///
/// Iteration order of [`ObjectIdSet::iter`] is unspecified; use
/// [`ObjectIdSet::sorted`] when determinism matters.
#[derive(Debug, Clone, Default)]
pub struct ObjectIdSet {
    items: FxHashSet<ObjectId>,
}

impl ObjectIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ObjectId) -> bool {
        self.items.insert(id)
    }

    pub fn remove(&mut self, id: &ObjectId) -> bool {
        self.items.remove(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.items.contains(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectId> {
        self.items.iter()
    }

    /// Members sorted by canonical form.
    pub fn sorted(&self) -> Vec<ObjectId> {
        let mut out: Vec<ObjectId> = self.items.iter().cloned().collect();
        out.sort();
        out
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut items = self.items.clone();
        items.extend(other.items.iter().cloned());
        Self { items }
    }

    /// Members of `self` absent from `other` (A \ B).
    pub fn diff(&self, other: &Self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .filter(|id| !other.contains(id))
                .cloned()
                .collect(),
        }
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .filter(|id| other.contains(id))
                .cloned()
                .collect(),
        }
    }
}

// Set equality ignores insertion order.
impl PartialEq for ObjectIdSet {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl Eq for ObjectIdSet {}

impl FromIterator<ObjectId> for ObjectIdSet {
    fn from_iter<T: IntoIterator<Item = ObjectId>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl Extend<ObjectId> for ObjectIdSet {
    fn extend<T: IntoIterator<Item = ObjectId>>(&mut self, iter: T) {
        self.items.extend(iter);
    }
}

impl From<Vec<ObjectId>> for ObjectIdSet {
    fn from(v: Vec<ObjectId>) -> Self {
        v.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a ObjectIdSet {
    type Item = &'a ObjectId;
    type IntoIter = std::collections::hash_set::Iter<'a, ObjectId>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(ns: &str, name: &str) -> ObjectId {
        ObjectId::new("apps", "Deployment", ns, name)
    }

    #[test]
    fn canonical_round_trips() {
        let cases = vec![
            ObjectId::new("apps", "Deployment", "prod", "api"),
            ObjectId::cluster_scoped("", "Namespace", "prod"),
            ObjectId::new("", "ConfigMap", "default", "cfg"),
        ];
        for want in cases {
            let parsed: ObjectId = want.canonical().parse().unwrap();
            assert_eq!(parsed, want);
        }
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(matches!(
            "a/b/c".parse::<ObjectId>(),
            Err(ParseIdError::Malformed(_))
        ));
        assert!(matches!(
            "a/b/c/d/e".parse::<ObjectId>(),
            Err(ParseIdError::Malformed(_))
        ));
        assert!(matches!(
            "apps/ns//Deployment".parse::<ObjectId>(),
            Err(ParseIdError::EmptyField(_, "name"))
        ));
        assert!(matches!(
            "apps/ns/api/".parse::<ObjectId>(),
            Err(ParseIdError::EmptyField(_, "kind"))
        ));
    }

    #[test]
    fn set_algebra() {
        let a: ObjectIdSet = vec![id("ns", "a"), id("ns", "b")].into();
        let b: ObjectIdSet = vec![id("ns", "b"), id("ns", "c")].into();

        let union = a.union(&b);
        assert_eq!(union.len(), 3);
        assert!(union.contains(&id("ns", "c")));

        let diff = a.diff(&b);
        assert_eq!(diff, vec![id("ns", "a")].into());

        let inter = a.intersection(&b);
        assert_eq!(inter, vec![id("ns", "b")].into());
    }

    #[test]
    fn equality_ignores_order() {
        let a: ObjectIdSet = vec![id("ns", "a"), id("ns", "b")].into();
        let b: ObjectIdSet = vec![id("ns", "b"), id("ns", "a")].into();
        assert_eq!(a, b);
    }

    #[test]
    fn sorted_is_deterministic() {
        let set: ObjectIdSet = vec![id("z", "x"), id("a", "y"), id("a", "b")].into();
        let sorted = set.sorted();
        let mut canon: Vec<String> = sorted.iter().map(|i| i.canonical()).collect();
        let mut expect = canon.clone();
        expect.sort();
        canon.sort();
        assert_eq!(canon, expect);
        assert_eq!(sorted.len(), 3);
    }
}
