//! Human-readable diagnostic rendering.

use crate::diagnostic::Diagnostic;
use kiln_common::VirtualFileSystem;

/// Formats diagnostics into output strings.
pub trait DiagnosticRenderer {
    /// Renders a single diagnostic, reading source lines through `vfs`.
    fn render(&self, diag: &Diagnostic, vfs: &dyn VirtualFileSystem) -> String;
}

/// Renders diagnostics in a rustc-style terminal format:
///
/// ```text
/// error[P001]: unclosed server tag
///   --> ~/shop/cart.aspx:3
///    |
///  3 | <asp:Label runat="server"
///    |
///    = note: ...
/// ```
pub struct TerminalRenderer {
    /// Whether to use ANSI color codes in output.
    pub color: bool,
}

impl TerminalRenderer {
    /// Creates a new terminal renderer.
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    fn header(&self, diag: &Diagnostic) -> String {
        let label = format!("{}[{}]", diag.severity, diag.code);
        if !self.color {
            return label;
        }
        let color = if diag.severity.is_error() { "31" } else { "33" };
        format!("\x1b[1;{color}m{label}\x1b[0m")
    }
}

impl DiagnosticRenderer for TerminalRenderer {
    fn render(&self, diag: &Diagnostic, vfs: &dyn VirtualFileSystem) -> String {
        let mut out = format!("{}: {}\n", self.header(diag), diag.message);

        if let Some(location) = &diag.location {
            out.push_str(&format!("  --> {location}\n"));
            // The source line is best-effort; the file may be gone by now.
            let source_line = location.line.and_then(|line| {
                let content = vfs.read(&location.path).ok()?;
                let text = String::from_utf8_lossy(&content).into_owned();
                let nth = text.lines().nth(line.checked_sub(1)? as usize)?.to_string();
                Some((line, nth))
            });
            if let Some((line, text)) = source_line {
                let line_num = line.to_string();
                let padding = " ".repeat(line_num.len());
                out.push_str(&format!("{padding} |\n"));
                out.push_str(&format!("{line_num} | {text}\n"));
                out.push_str(&format!("{padding} |\n"));
            }
        }

        for note in &diag.notes {
            out.push_str(&format!("   = note: {note}\n"));
        }
        out
    }
}
