//! Severity-tagged diagnostic stream.
//!
//! Everything user-facing goes through [`Diagnostics`]: one line per report,
//! prefixed with its severity. Warnings never stop a compilation; errors are
//! reported here and then surfaced as [`crate::error::BackendError`] values.
//! Internal tracing uses the `log` crate and is separate from this stream.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Write};

/// Severity of a single diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

/// Diagnostic sink shared by the driver and the pipeline.
///
/// Compilation is single-threaded, so interior mutability through
/// `RefCell`/`Cell` is enough to let stages report through a shared
/// reference.
pub struct Diagnostics {
    sink: RefCell<Box<dyn Write>>,
    errors: Cell<usize>,
    warnings: Cell<usize>,
}

impl Diagnostics {
    /// Diagnostics writing to standard error.
    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()))
    }

    /// Diagnostics writing to an arbitrary sink (used by tests to capture
    /// output).
    pub fn new(sink: Box<dyn Write>) -> Self {
        Self {
            sink: RefCell::new(sink),
            errors: Cell::new(0),
            warnings: Cell::new(0),
        }
    }

    /// Report one diagnostic line.
    pub fn report(&self, severity: Severity, message: impl fmt::Display) {
        match severity {
            Severity::Error => self.errors.set(self.errors.get() + 1),
            Severity::Warning => self.warnings.set(self.warnings.get() + 1),
            Severity::Note => {}
        }
        let mut sink = self.sink.borrow_mut();
        // A failing diagnostic sink must not abort the compilation itself.
        let _ = writeln!(sink, "{severity}: {message}");
        let _ = sink.flush();
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.report(Severity::Error, message);
    }

    pub fn warning(&self, message: impl fmt::Display) {
        self.report(Severity::Warning, message);
    }

    pub fn note(&self, message: impl fmt::Display) {
        self.report(Severity::Note, message);
    }

    pub fn error_count(&self) -> usize {
        self.errors.get()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.get()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::stderr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lines_are_severity_tagged() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let diags = Diagnostics::new(Box::new(buf.clone()));

        diags.warning("relax-all ignored: output is not an object file");
        diags.error("something broke");
        diags.note("for reference");

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            text,
            "warning: relax-all ignored: output is not an object file\n\
             error: something broke\n\
             note: for reference\n"
        );
        assert_eq!(diags.error_count(), 1);
        assert_eq!(diags.warning_count(), 1);
    }
}
