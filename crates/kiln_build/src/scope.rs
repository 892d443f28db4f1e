//! Directory-compilation scopes.

use std::fmt;

use kiln_common::{HashCombiner, VirtualPath};

/// The compilation boundary a unit belongs to.
///
/// Units from different scopes are never placed in the same batch. Ordering
/// puts the special directories before web directories, matching the order
/// in which they are built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompilationScope {
    /// The global resources directory.
    GlobalResources,
    /// The web references directory.
    WebReferences,
    /// A configured subdirectory of the code directory, by folder name.
    SubCode(String),
    /// The main code directory, minus its configured subdirectories.
    MainCode,
    /// The global application file.
    Application,
    /// A local resources folder.
    LocalResources(VirtualPath),
    /// One theme, by name.
    Theme(String),
    /// An ordinary content directory.
    WebDirectory(VirtualPath),
}

impl CompilationScope {
    /// The assembly name for scopes that always compile to one fixed
    /// output, `None` for scopes whose batches are named dynamically.
    pub fn fixed_assembly_name(&self) -> Option<String> {
        match self {
            CompilationScope::GlobalResources => Some("App_GlobalResources".to_string()),
            CompilationScope::WebReferences => Some("App_WebReferences".to_string()),
            CompilationScope::SubCode(name) => Some(format!("App_SubCode_{name}")),
            CompilationScope::MainCode => Some("App_Code".to_string()),
            CompilationScope::Application => Some("App_global.asax".to_string()),
            CompilationScope::Theme(name) => Some(format!("App_Theme_{name}")),
            CompilationScope::LocalResources(_) | CompilationScope::WebDirectory(_) => None,
        }
    }

    /// Prefix for dynamically named assemblies of this scope.
    pub fn assembly_prefix(&self) -> &'static str {
        match self {
            CompilationScope::LocalResources(_) => "App_LocalResources",
            _ => "App_Web",
        }
    }

    /// Returns `true` for the scopes built before any page.
    pub fn is_top_level(&self) -> bool {
        matches!(
            self,
            CompilationScope::GlobalResources
                | CompilationScope::WebReferences
                | CompilationScope::SubCode(_)
                | CompilationScope::MainCode
                | CompilationScope::Application
        )
    }

    pub(crate) fn hash_into(&self, h: &mut HashCombiner) {
        h.add_str(&self.to_string());
    }
}

impl fmt::Display for CompilationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationScope::GlobalResources => write!(f, "global resources"),
            CompilationScope::WebReferences => write!(f, "web references"),
            CompilationScope::SubCode(name) => write!(f, "code subdirectory {name}"),
            CompilationScope::MainCode => write!(f, "code"),
            CompilationScope::Application => write!(f, "application"),
            CompilationScope::LocalResources(dir) => write!(f, "local resources {dir}"),
            CompilationScope::Theme(name) => write!(f, "theme {name}"),
            CompilationScope::WebDirectory(dir) => write!(f, "directory {dir}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_names() {
        assert_eq!(
            CompilationScope::SubCode("Vb".into()).fixed_assembly_name().as_deref(),
            Some("App_SubCode_Vb")
        );
        assert_eq!(
            CompilationScope::MainCode.fixed_assembly_name().as_deref(),
            Some("App_Code")
        );
        let web = CompilationScope::WebDirectory(VirtualPath::root());
        assert!(web.fixed_assembly_name().is_none());
        assert_eq!(web.assembly_prefix(), "App_Web");
    }

    #[test]
    fn special_directories_sort_first() {
        let mut scopes = vec![
            CompilationScope::WebDirectory(VirtualPath::root()),
            CompilationScope::MainCode,
            CompilationScope::SubCode("a".into()),
            CompilationScope::GlobalResources,
        ];
        scopes.sort();
        assert_eq!(scopes[0], CompilationScope::GlobalResources);
        assert_eq!(scopes[1], CompilationScope::SubCode("a".into()));
        assert_eq!(scopes[2], CompilationScope::MainCode);
    }
}
