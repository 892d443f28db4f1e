//! Transitive dependency resolution.

use std::collections::VecDeque;

use kiln_common::{DependencySet, VirtualFileSystem, VirtualPath};
use tracing::debug;

use crate::error::BuildError;
use crate::toolchain::DependencyParser;
use crate::unit::{BuildUnit, SourceClassifier};

/// Expands a unit's direct dependencies into the full set of files whose
/// change invalidates its result.
///
/// Resolution walks a flat worklist, so cycles between templates terminate.
/// Nothing is compiled and no cache state is touched.
pub struct DependencyResolver<'a> {
    vfs: &'a dyn VirtualFileSystem,
    parser: &'a dyn DependencyParser,
    classifier: &'a SourceClassifier,
}

impl<'a> DependencyResolver<'a> {
    /// Creates a resolver.
    pub fn new(
        vfs: &'a dyn VirtualFileSystem,
        parser: &'a dyn DependencyParser,
        classifier: &'a SourceClassifier,
    ) -> Self {
        Self {
            vfs,
            parser,
            classifier,
        }
    }

    /// Resolves the dependency set of `unit`, its own path first.
    ///
    /// A dangling reference fails with [`BuildError::MissingDependency`].
    pub fn resolve(&self, unit: &BuildUnit) -> Result<DependencySet, BuildError> {
        let mut set = DependencySet::single(unit.path.clone());
        let mut queue: VecDeque<VirtualPath> = unit
            .dependencies
            .iter()
            .chain(&unit.companions)
            .cloned()
            .collect();

        while let Some(dep) = queue.pop_front() {
            if !set.insert(dep.clone()) {
                continue;
            }
            if !self.vfs.exists(&dep) {
                return Err(BuildError::MissingDependency {
                    path: unit.path.clone(),
                    missing: dep,
                });
            }
            let Some(kind) = self.classifier.classify(&dep) else {
                continue;
            };
            if dep.is_directory() || !kind.has_dependencies() {
                continue;
            }
            let source = self.vfs.read(&dep)?;
            let parsed = self
                .parser
                .parse(&dep, kind, &source)
                .map_err(|diagnostics| BuildError::Parse {
                    path: dep.clone(),
                    diagnostics,
                })?;
            queue.extend(parsed.dependencies);
            queue.extend(parsed.companions);
        }

        debug!(path = %unit.path, count = set.len(), "resolved dependencies");
        Ok(set)
    }
}
