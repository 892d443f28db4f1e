//! Structured build diagnostics, accumulation, and terminal rendering.
//!
//! Parse and compile failures carry [`Diagnostic`] values attributed to a
//! virtual path and line. The thread-safe [`DiagnosticSink`] collects them
//! across parallel syntax-tree generation, and [`TerminalRenderer`] formats
//! them for people.

#![warn(missing_docs)]

pub mod code;
pub mod diagnostic;
pub mod renderer;
pub mod severity;
pub mod sink;

pub use code::{Category, DiagnosticCode};
pub use diagnostic::{Diagnostic, Location};
pub use renderer::{DiagnosticRenderer, TerminalRenderer};
pub use severity::Severity;
pub use sink::DiagnosticSink;
