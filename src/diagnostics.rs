/// Diagnostic reporting.
///
/// Five severities with distinct policies:
///   • Info     — printed, never counted.
///   • Warning  — counted; terminal bell on the first warning or error.
///   • Error    — counted; the reporting parser then skips to the next
///                closing parenthesis and resumes.
///   • Severe   — an Error raised for expectation failures while parsing.
///   • Fatal    — carried as a `FatalError`; releases the database lock
///                and exits the job with code 3.
///
/// Messages are mirrored into an echo buffer so an open listing file can
/// replay them in place.

use std::io::Write;

use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Default)]
pub struct DiagnosticEngine {
    /// Errors in the current translation unit.
    pub errors: u32,
    /// Warnings in the current translation unit.
    pub warnings: u32,
    /// Errors accumulated across the whole job.
    pub total_errors: u32,
    /// Formatted messages awaiting replay into the listing.
    echo: Vec<String>,
    pub verbose: bool,
}

impl DiagnosticEngine {
    pub fn new(verbose: bool) -> Self {
        DiagnosticEngine {
            verbose,
            ..Default::default()
        }
    }

    /// Start counters for a new translation unit, folding the previous
    /// unit's errors into the job total.
    pub fn start_unit(&mut self) {
        self.total_errors += self.errors;
        self.errors = 0;
        self.warnings = 0;
    }

    pub fn finish_job(&mut self) {
        self.total_errors += self.errors;
        self.errors = 0;
    }

    fn beep(&self) {
        if self.warnings + self.errors == 1 {
            let _ = std::io::stderr().write_all(b"\x07");
        }
    }

    fn emit(&mut self, label: &str, colored_label: String, file: &str, line: u32, msg: &str) {
        let text = format!("{}: {}, line {}\n\t{}", label, file, line, msg);
        eprintln!("{}: {}, line {}\n\t{}", colored_label, file, line, msg);
        self.echo.push(text);
    }

    pub fn info(&mut self, file: &str, line: u32, msg: &str) {
        self.emit("Info", "Info".normal().to_string(), file, line, msg);
    }

    pub fn warning(&mut self, file: &str, line: u32, msg: &str) {
        self.warnings += 1;
        self.emit("Warning", "Warning".yellow().to_string(), file, line, msg);
        self.beep();
    }

    pub fn error(&mut self, file: &str, line: u32, msg: &str) {
        self.errors += 1;
        self.emit("Error", "Error".red().to_string(), file, line, msg);
        self.beep();
    }

    pub fn output(&self, msg: &str) {
        println!("{}", msg);
    }

    /// Drain the pending echo lines for the listing writer.
    pub fn take_echo(&mut self) -> Vec<String> {
        std::mem::take(&mut self.echo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_counters_fold_into_job_total() {
        let mut d = DiagnosticEngine::new(false);
        d.error("a.sc", 1, "one");
        d.error("a.sc", 2, "two");
        d.start_unit();
        assert_eq!(d.errors, 0);
        assert_eq!(d.total_errors, 2);
        d.error("b.sc", 1, "three");
        d.finish_job();
        assert_eq!(d.total_errors, 3);
    }

    #[test]
    fn warnings_do_not_count_as_errors() {
        let mut d = DiagnosticEngine::new(false);
        d.warning("a.sc", 1, "w");
        d.info("a.sc", 1, "i");
        d.finish_job();
        assert_eq!(d.total_errors, 0);
        assert_eq!(d.warnings, 1);
    }
}
