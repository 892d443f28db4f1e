//! Combined hashing of dependency sets and freshness checks.

use kiln_common::{ContentHash, DependencySet, HashCombiner, VfsError, VirtualFileSystem, VirtualPath};

use crate::result::BuildResult;

/// Whether a cached result still matches the current sources and settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Dependencies and configuration are unchanged.
    Fresh,
    /// The configuration hash differs.
    SemanticChanged,
    /// A dependency's content changed.
    DependenciesChanged,
    /// A dependency no longer exists; the file set changed structurally.
    DependencyMissing(VirtualPath),
}

impl Freshness {
    /// `true` only for [`Freshness::Fresh`].
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }

    /// A short label for logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::SemanticChanged => "configuration changed",
            Freshness::DependenciesChanged => "dependency changed",
            Freshness::DependencyMissing(_) => "dependency missing",
        }
    }
}

/// Hashes dependency sets through a virtual file system.
pub struct DependencyHasher<'a> {
    vfs: &'a dyn VirtualFileSystem,
}

impl<'a> DependencyHasher<'a> {
    /// Creates a hasher reading through `vfs`.
    pub fn new(vfs: &'a dyn VirtualFileSystem) -> Self {
        Self { vfs }
    }

    /// Combines the hashes of every member of `deps`, in key order.
    ///
    /// Directory members contribute their recursive directory hash. A
    /// missing file fails with [`VfsError::NotFound`].
    pub fn hash(&self, deps: &DependencySet) -> Result<ContentHash, VfsError> {
        let mut combiner = HashCombiner::new();
        for path in deps.sorted() {
            combiner.add_str(path.key());
            combiner.add_hash(&self.vfs.hash(path)?);
        }
        Ok(combiner.finish())
    }

    /// Checks stored hashes against the current state.
    ///
    /// Only security failures are returned as errors; every other read
    /// problem makes the entry stale.
    pub fn check(
        &self,
        deps: &DependencySet,
        stored_dependencies_hash: ContentHash,
        stored_semantic_hash: ContentHash,
        current_semantic_hash: ContentHash,
    ) -> Result<Freshness, VfsError> {
        if stored_semantic_hash != current_semantic_hash {
            return Ok(Freshness::SemanticChanged);
        }
        if let Some(missing) = deps
            .iter()
            .find(|p| !p.is_directory() && !self.vfs.exists(p))
        {
            return Ok(Freshness::DependencyMissing(missing.clone()));
        }
        match self.hash(deps) {
            Ok(current) if current == stored_dependencies_hash => Ok(Freshness::Fresh),
            Ok(_) => Ok(Freshness::DependenciesChanged),
            Err(e) if e.is_security_failure() => Err(e),
            Err(VfsError::NotFound(path)) => Ok(Freshness::DependencyMissing(path)),
            Err(_) => Ok(Freshness::DependenciesChanged),
        }
    }

    /// Checks a result against the current state.
    pub fn check_result(
        &self,
        result: &BuildResult,
        current_semantic_hash: ContentHash,
    ) -> Result<Freshness, VfsError> {
        self.check(
            result.dependencies(),
            result.dependencies_hash(),
            result.semantic_hash(),
            current_semantic_hash,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::MemoryFileSystem;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    fn setup() -> (MemoryFileSystem, DependencySet) {
        let vfs = MemoryFileSystem::with_files([
            ("~/a.aspx", "A"),
            ("~/b.master", "B"),
            ("~/c.aspx", "C"),
        ])
        .unwrap();
        let deps: DependencySet = [vp("~/a.aspx"), vp("~/b.master")].into_iter().collect();
        (vfs, deps)
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let (vfs, deps) = setup();
        let hasher = DependencyHasher::new(&vfs);
        let reversed: DependencySet = [vp("~/b.master"), vp("~/a.aspx")].into_iter().collect();
        assert_eq!(hasher.hash(&deps).unwrap(), hasher.hash(&reversed).unwrap());
    }

    #[test]
    fn member_change_is_detected_unrelated_change_is_not() {
        let (vfs, deps) = setup();
        let hasher = DependencyHasher::new(&vfs);
        let config = ContentHash::from_bytes(b"cfg");
        let stored = hasher.hash(&deps).unwrap();

        vfs.write(&vp("~/c.aspx"), b"C2");
        assert_eq!(
            hasher.check(&deps, stored, config, config).unwrap(),
            Freshness::Fresh
        );

        vfs.write(&vp("~/b.master"), b"B2");
        assert_eq!(
            hasher.check(&deps, stored, config, config).unwrap(),
            Freshness::DependenciesChanged
        );
    }

    #[test]
    fn semantic_change_is_detected_first() {
        let (vfs, deps) = setup();
        let hasher = DependencyHasher::new(&vfs);
        let stored = hasher.hash(&deps).unwrap();
        let freshness = hasher
            .check(
                &deps,
                stored,
                ContentHash::from_bytes(b"old"),
                ContentHash::from_bytes(b"new"),
            )
            .unwrap();
        assert_eq!(freshness, Freshness::SemanticChanged);
    }

    #[test]
    fn missing_dependency_is_structural() {
        let (vfs, deps) = setup();
        let hasher = DependencyHasher::new(&vfs);
        let config = ContentHash::from_bytes(b"cfg");
        let stored = hasher.hash(&deps).unwrap();
        vfs.remove(&vp("~/b.master"));
        assert_eq!(
            hasher.check(&deps, stored, config, config).unwrap(),
            Freshness::DependencyMissing(vp("~/b.master"))
        );
    }

    #[test]
    fn denied_dependency_propagates() {
        let (vfs, deps) = setup();
        let hasher = DependencyHasher::new(&vfs);
        let config = ContentHash::from_bytes(b"cfg");
        let stored = hasher.hash(&deps).unwrap();
        vfs.deny(&vp("~/a.aspx"));
        assert!(hasher
            .check(&deps, stored, config, config)
            .unwrap_err()
            .is_security_failure());
    }

    #[test]
    fn directory_members_use_directory_hash() {
        let vfs = MemoryFileSystem::with_files([("~/App_Code/a.cs", "one")]).unwrap();
        let deps = DependencySet::single(VirtualPath::directory("~/App_Code").unwrap());
        let hasher = DependencyHasher::new(&vfs);
        let before = hasher.hash(&deps).unwrap();
        vfs.write(&vp("~/App_Code/b.cs"), b"two");
        assert_ne!(before, hasher.hash(&deps).unwrap());
    }
}
