//! Process-lifetime memory tier.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::result::BuildResult;

/// Key to result map shared by every thread of the process.
///
/// There is no eviction policy: entries live until invalidated or until the
/// owning cache is dropped.
#[derive(Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<String, Arc<BuildResult>>>,
}

impl MemoryTier {
    /// Creates an empty tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `key` without validating the entry.
    pub fn get(&self, key: &str) -> Option<Arc<BuildResult>> {
        self.entries.read().get(key).cloned()
    }

    /// Stores `result` under `key`, replacing any previous entry.
    pub fn insert(&self, key: &str, result: Arc<BuildResult>) {
        self.entries.write().insert(key.to_string(), result);
    }

    /// Removes `key`.
    pub fn remove(&self, key: &str) -> Option<Arc<BuildResult>> {
        self.entries.write().remove(key)
    }

    /// Removes `key` only if it still maps to `expected`.
    ///
    /// A stale entry found by one thread must not evict a fresh entry another
    /// thread stored in the meantime.
    pub fn remove_if_same(&self, key: &str, expected: &Arc<BuildResult>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultKind;
    use kiln_common::{ContentHash, DependencySet, VirtualPath};

    fn result() -> Arc<BuildResult> {
        let path = VirtualPath::parse("~/a.aspx").unwrap();
        Arc::new(BuildResult::new(
            ResultKind::Compiled,
            path.clone(),
            DependencySet::single(path),
            ContentHash::EMPTY,
            ContentHash::EMPTY,
        ))
    }

    #[test]
    fn insert_get_remove() {
        let tier = MemoryTier::new();
        let r = result();
        tier.insert("a", Arc::clone(&r));
        assert!(Arc::ptr_eq(&tier.get("a").unwrap(), &r));
        assert_eq!(tier.len(), 1);
        assert!(tier.remove("a").is_some());
        assert!(tier.is_empty());
    }

    #[test]
    fn remove_if_same_spares_replacements() {
        let tier = MemoryTier::new();
        let old = result();
        let new = result();
        tier.insert("a", Arc::clone(&new));
        assert!(!tier.remove_if_same("a", &old));
        assert!(tier.get("a").is_some());
        assert!(tier.remove_if_same("a", &new));
        assert!(tier.get("a").is_none());
    }
}
