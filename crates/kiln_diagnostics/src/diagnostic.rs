//! Structured diagnostic messages attributed to a source file and line.

use crate::code::DiagnosticCode;
use crate::severity::Severity;
use kiln_common::VirtualPath;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a diagnostic was detected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// The source unit.
    pub path: VirtualPath,
    /// 1-based line number, when known.
    pub line: Option<u32>,
}

impl Location {
    /// A location covering a whole file.
    pub fn file(path: VirtualPath) -> Self {
        Self { path, line: None }
    }

    /// A location on a specific line.
    pub fn line(path: VirtualPath, line: u32) -> Self {
        Self {
            path,
            line: Some(line),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}", self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// A build diagnostic: severity, code, message, and optional location.
///
/// Parse and compile errors always carry a location; infrastructure
/// conditions (drained lock, unload timeout) usually do not.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity level of this diagnostic.
    pub severity: Severity,
    /// The code identifying the kind of diagnostic.
    pub code: DiagnosticCode,
    /// The main message.
    pub message: String,
    /// The file and line the diagnostic is attributed to.
    pub location: Option<Location>,
    /// Explanatory footnotes.
    pub notes: Vec<String>,
}

impl Diagnostic {
    /// Creates an error diagnostic.
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
            location: None,
            notes: Vec::new(),
        }
    }

    /// Creates a warning diagnostic.
    pub fn warning(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message)
        }
    }

    /// Attributes this diagnostic to a location.
    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Adds a note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Returns the path this diagnostic is attributed to, if any.
    pub fn path(&self) -> Option<&VirtualPath> {
        self.location.as_ref().map(|l| &l.path)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.severity, self.code, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " ({location})")?;
        }
        Ok(())
    }
}
