//! Ordered, duplicate-free sets of virtual-path dependencies.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::virtual_path::VirtualPath;

/// Everything that, if changed, invalidates a compiled artifact.
///
/// Membership is unique and case-insensitive. Insertion order is kept so that
/// diagnostics and persisted records list dependencies in discovery order,
/// with the unit's own path first.
#[derive(Clone, Default)]
pub struct DependencySet {
    ordered: Vec<VirtualPath>,
    index: HashSet<VirtualPath>,
}

impl DependencySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set containing only `path`.
    pub fn single(path: VirtualPath) -> Self {
        let mut set = Self::new();
        set.insert(path);
        set
    }

    /// Adds a path. Returns `false` if it was already present.
    pub fn insert(&mut self, path: VirtualPath) -> bool {
        if self.index.contains(&path) {
            return false;
        }
        self.index.insert(path.clone());
        self.ordered.push(path);
        true
    }

    /// Adds every path from `other`, keeping first-seen order.
    pub fn extend(&mut self, other: impl IntoIterator<Item = VirtualPath>) {
        for path in other {
            self.insert(path);
        }
    }

    /// Returns `true` if `path` is a member.
    pub fn contains(&self, path: &VirtualPath) -> bool {
        self.index.contains(path)
    }

    /// Iterates in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, VirtualPath> {
        self.ordered.iter()
    }

    /// Returns the members in insertion order.
    pub fn as_slice(&self) -> &[VirtualPath] {
        &self.ordered
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Returns `true` if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Returns the members sorted by comparison key.
    ///
    /// Hashing uses this order so that two sets with the same members always
    /// hash identically.
    pub fn sorted(&self) -> Vec<&VirtualPath> {
        let mut sorted: Vec<&VirtualPath> = self.ordered.iter().collect();
        sorted.sort();
        sorted
    }
}

impl PartialEq for DependencySet {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for DependencySet {}

impl std::fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ordered.iter()).finish()
    }
}

impl FromIterator<VirtualPath> for DependencySet {
    fn from_iter<I: IntoIterator<Item = VirtualPath>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl<'a> IntoIterator for &'a DependencySet {
    type Item = &'a VirtualPath;
    type IntoIter = std::slice::Iter<'a, VirtualPath>;

    fn into_iter(self) -> Self::IntoIter {
        self.ordered.iter()
    }
}

impl Serialize for DependencySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.ordered.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DependencySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let paths = Vec::<VirtualPath>::deserialize(deserializer)?;
        Ok(paths.into_iter().collect())
    }
}
