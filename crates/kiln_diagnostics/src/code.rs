//! Diagnostic codes with category prefixes.
//!
//! The prefix tells tooling at a glance whether a failure is the user's to
//! fix (`P`, `C`) or an infrastructure condition (`I`, `L`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// The category of a diagnostic code, determining its prefix letter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Category {
    /// A source unit could not be turned into a syntax tree, prefixed with `P`.
    Parse,
    /// The compiler rejected generated code, prefixed with `C`.
    Compile,
    /// Lock, timeout, cache, or file-system failures, prefixed with `I`.
    Infrastructure,
    /// Process lifecycle signals such as restart-required, prefixed with `L`.
    Lifecycle,
    /// Non-fatal findings, prefixed with `W`.
    Warning,
}

impl Category {
    /// Returns the single-character prefix for this category.
    pub fn prefix(self) -> char {
        match self {
            Category::Parse => 'P',
            Category::Compile => 'C',
            Category::Infrastructure => 'I',
            Category::Lifecycle => 'L',
            Category::Warning => 'W',
        }
    }

    /// Returns `true` for categories describing problems in user sources.
    pub fn is_user_error(self) -> bool {
        matches!(self, Category::Parse | Category::Compile)
    }
}

/// A category prefix plus a numeric identifier, displayed as e.g. `P001`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct DiagnosticCode {
    /// The category of this diagnostic.
    pub category: Category,
    /// The numeric identifier within the category.
    pub number: u16,
}

impl DiagnosticCode {
    /// Creates a new diagnostic code.
    pub const fn new(category: Category, number: u16) -> Self {
        Self { category, number }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03}", self.category.prefix(), self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        assert_eq!(DiagnosticCode::new(Category::Parse, 1).to_string(), "P001");
        assert_eq!(
            DiagnosticCode::new(Category::Infrastructure, 42).to_string(),
            "I042"
        );
        assert_eq!(DiagnosticCode::new(Category::Lifecycle, 101).to_string(), "L101");
    }

    #[test]
    fn user_vs_infrastructure() {
        assert!(Category::Parse.is_user_error());
        assert!(Category::Compile.is_user_error());
        assert!(!Category::Infrastructure.is_user_error());
        assert!(!Category::Lifecycle.is_user_error());
    }

    #[test]
    fn serde_roundtrip() {
        let code = DiagnosticCode::new(Category::Compile, 7);
        let json = serde_json::to_string(&code).unwrap();
        let back: DiagnosticCode = serde_json::from_str(&json).unwrap();
        assert_eq!(code, back);
    }
}
