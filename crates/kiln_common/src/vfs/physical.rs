//! Physical file system rooted at the application directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{VfsError, VirtualFileSystem};
use crate::virtual_path::VirtualPath;

/// Maps `~/a/b` onto `<root>/a/b` on disk.
#[derive(Debug, Clone)]
pub struct PhysicalFileSystem {
    root: PathBuf,
}

impl PhysicalFileSystem {
    /// Creates a file system rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the physical application root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl VirtualFileSystem for PhysicalFileSystem {
    fn exists(&self, path: &VirtualPath) -> bool {
        let physical = path.to_physical(&self.root);
        if path.is_directory() {
            physical.is_dir()
        } else {
            physical.is_file()
        }
    }

    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>, VfsError> {
        std::fs::read(path.to_physical(&self.root)).map_err(|e| VfsError::from_io(path, e))
    }

    fn last_modified(&self, path: &VirtualPath) -> Result<SystemTime, VfsError> {
        std::fs::metadata(path.to_physical(&self.root))
            .and_then(|m| m.modified())
            .map_err(|e| VfsError::from_io(path, e))
    }

    fn file_size(&self, path: &VirtualPath) -> Result<u64, VfsError> {
        std::fs::metadata(path.to_physical(&self.root))
            .map(|m| m.len())
            .map_err(|e| VfsError::from_io(path, e))
    }

    fn list(&self, dir: &VirtualPath) -> Result<Vec<VirtualPath>, VfsError> {
        let physical = dir.to_physical(&self.root);
        let entries = std::fs::read_dir(&physical).map_err(|e| VfsError::from_io(dir, e))?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| VfsError::from_io(dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_dir = entry.path().is_dir();
            let child = if is_dir {
                VirtualPath::directory(&format!("{dir}{name}"))
            } else {
                VirtualPath::parse(&format!("{dir}{name}"))
            };
            // Names that cannot be expressed as virtual paths are invisible.
            if let Ok(child) = child {
                children.push(child);
            }
        }
        children.sort();
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_lists_disk_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shop")).unwrap();
        std::fs::write(dir.path().join("default.aspx"), "home").unwrap();
        std::fs::write(dir.path().join("shop").join("cart.aspx"), "cart").unwrap();

        let fs = PhysicalFileSystem::new(dir.path());
        let cart = VirtualPath::parse("~/shop/cart.aspx").unwrap();
        assert_eq!(fs.read(&cart).unwrap(), b"cart");
        assert_eq!(fs.file_size(&cart).unwrap(), 4);
        assert!(fs.exists(&VirtualPath::directory("~/shop").unwrap()));
        assert!(!fs.exists(&VirtualPath::parse("~/shop").unwrap()));

        let root = fs.list(&VirtualPath::root()).unwrap();
        let names: Vec<_> = root.iter().map(|p| p.as_str().to_string()).collect();
        assert_eq!(names, vec!["~/default.aspx", "~/shop/"]);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fs = PhysicalFileSystem::new(dir.path());
        let err = fs
            .read(&VirtualPath::parse("~/missing.aspx").unwrap())
            .unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
    }

    #[test]
    fn file_hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.aspx"), "one").unwrap();
        let fs = PhysicalFileSystem::new(dir.path());
        let a = VirtualPath::parse("~/a.aspx").unwrap();
        let h1 = fs.file_hash(&a).unwrap();
        std::fs::write(dir.path().join("a.aspx"), "two").unwrap();
        assert_ne!(h1, fs.file_hash(&a).unwrap());
    }
}
