//! Application-relative virtual paths.
//!
//! Every source unit, directory, and dependency is addressed by a
//! [`VirtualPath`] of the form `~/dir/file.ext` (directories keep a trailing
//! slash, e.g. `~/dir/`). Paths compare case-insensitively, so `~/Default.ASPX`
//! and `~/default.aspx` name the same unit.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Characters that are never valid inside a virtual path segment.
const INVALID_CHARS: &[char] = &[':', '*', '?', '"', '<', '>', '|', '\0'];

/// Errors produced when parsing or combining virtual paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// A `..` segment walked above the application root.
    #[error("virtual path '{0}' escapes the application root")]
    AboveRoot(String),

    /// The path contains a character that cannot appear in a virtual path.
    #[error("virtual path '{path}' contains invalid character '{ch}'")]
    InvalidCharacter {
        /// The rejected input.
        path: String,
        /// The offending character.
        ch: char,
    },

    /// A file path was required but a directory path was given (or vice versa).
    #[error("'{0}' is not a file path")]
    NotAFile(String),
}

/// A normalized, case-insensitive, application-relative path.
#[derive(Clone)]
pub struct VirtualPath {
    /// Display form, original casing preserved.
    path: String,
    /// Lower-cased comparison key.
    key: String,
}

impl VirtualPath {
    /// The application root, `~/`.
    pub fn root() -> Self {
        Self::from_normalized("~/".to_string())
    }

    /// Parses and normalizes a virtual path.
    ///
    /// Accepts `~/a/b`, `/a/b` and `a/b` (all application-relative),
    /// backslashes, duplicate slashes, `.` and `..` segments. A trailing slash
    /// marks a directory.
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let raw = input.trim().replace('\\', "/");
        if let Some(ch) = raw.chars().find(|c| INVALID_CHARS.contains(c)) {
            return Err(PathError::InvalidCharacter {
                path: input.to_string(),
                ch,
            });
        }

        let body = raw.strip_prefix('~').unwrap_or(&raw);
        let is_dir = body.is_empty() || body.ends_with('/');

        let mut segments: Vec<&str> = Vec::new();
        for segment in body.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::AboveRoot(input.to_string()));
                    }
                }
                other => segments.push(other),
            }
        }

        let mut path = String::from("~/");
        path.push_str(&segments.join("/"));
        if is_dir && !segments.is_empty() {
            path.push('/');
        }
        Ok(Self::from_normalized(path))
    }

    /// Parses a path and forces it to be a directory.
    pub fn directory(input: &str) -> Result<Self, PathError> {
        let parsed = Self::parse(input)?;
        if parsed.is_directory() {
            return Ok(parsed);
        }
        Ok(Self::from_normalized(format!("{}/", parsed.path)))
    }

    /// Parses a path that must name a file.
    pub fn file(input: &str) -> Result<Self, PathError> {
        let parsed = Self::parse(input)?;
        if parsed.is_directory() {
            return Err(PathError::NotAFile(input.to_string()));
        }
        Ok(parsed)
    }

    fn from_normalized(path: String) -> Self {
        let key = path.to_lowercase();
        Self { path, key }
    }

    /// Returns the display form of the path.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Returns the lower-cased comparison key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` for directory paths (trailing slash).
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Returns `true` for the application root.
    pub fn is_root(&self) -> bool {
        self.path == "~/"
    }

    /// Iterates over the path segments below the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path[2..].split('/').filter(|s| !s.is_empty())
    }

    /// Returns the last segment (without trailing slash); empty for the root.
    pub fn file_name(&self) -> &str {
        self.segments().last().unwrap_or("")
    }

    /// Returns the lower-cased extension of a file path, including the dot.
    pub fn extension(&self) -> Option<String> {
        if self.is_directory() {
            return None;
        }
        let name = self.file_name();
        let dot = name.rfind('.')?;
        if dot == 0 {
            return None;
        }
        Some(name[dot..].to_lowercase())
    }

    /// Returns the containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        let trimmed = self.path.trim_end_matches('/');
        let slash = trimmed.rfind('/')?;
        Some(Self::from_normalized(trimmed[..=slash].to_string()))
    }

    /// Resolves `relative` against this path.
    ///
    /// Application-relative inputs (`~/x`, `/x`) ignore the base. Otherwise the
    /// base is this path if it is a directory, or its parent if it is a file.
    pub fn join(&self, relative: &str) -> Result<VirtualPath, PathError> {
        let trimmed = relative.trim();
        if trimmed.starts_with('~') || trimmed.starts_with('/') || trimmed.starts_with('\\') {
            return Self::parse(trimmed);
        }
        let base = if self.is_directory() {
            self.clone()
        } else {
            self.parent().unwrap_or_else(Self::root)
        };
        Self::parse(&format!("{}{}", base.path, trimmed))
    }

    /// Returns `true` if this path is `dir` itself or lies beneath it.
    pub fn is_within(&self, dir: &VirtualPath) -> bool {
        dir.is_directory() && self.key.starts_with(&dir.key)
    }

    /// Derives the cache key for this path.
    ///
    /// The key is the lower-cased file name followed by a 32-bit hash of the
    /// lower-cased parent directory, e.g. `default.aspx.1a2b3c4d`. The
    /// application root maps to `root`.
    pub fn cache_key(&self) -> String {
        let trimmed = self.key.trim_end_matches('/');
        if trimmed == "~" {
            return "root".to_string();
        }
        let (dir, name) = match trimmed.rfind('/') {
            Some(slash) => (&trimmed[..slash], &trimmed[slash + 1..]),
            None => ("~", trimmed),
        };
        let dir_hash = xxhash_rust::xxh3::xxh3_64(dir.as_bytes()) as u32;
        format!("{name}.{dir_hash:08x}")
    }

    /// Maps this path onto a physical directory tree rooted at `root`.
    pub fn to_physical(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for segment in self.segments() {
            out.push(segment);
        }
        out
    }
}

impl PartialEq for VirtualPath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for VirtualPath {}

impl Hash for VirtualPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for VirtualPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl fmt::Debug for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPath({})", self.path)
    }
}

impl Serialize for VirtualPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path)
    }
}

impl<'de> Deserialize<'de> for VirtualPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VirtualPath::parse(&s).map_err(serde::de::Error::custom)
    }
}
