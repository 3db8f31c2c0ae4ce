use crate::frontend::span::Span;

/// Classification of every diagnostic the toolchain can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexical,
    Syntax,
    Semantic,
    Runtime,
    Compilation,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            ErrorKind::Lexical => "LEXICAL ERROR",
            ErrorKind::Syntax => "SYNTAX ERROR",
            ErrorKind::Semantic => "SEMANTIC ERROR",
            ErrorKind::Runtime => "RUNTIME ERROR",
            ErrorKind::Compilation => "COMPILATION ERROR",
        }
    }
}

/// A single reported error with enough context to print a caret diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub source_line: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.kind.label())?;

        if self.span.line > 0 {
            write!(f, " at line {}", self.span.line)?;
            if self.span.column > 0 {
                write!(f, ", column {}", self.span.column)?;
            }
        }

        write!(f, ": {}", self.message)?;

        if !self.source_line.is_empty() {
            write!(f, "\n{}", self.source_line)?;
            let caret_col = self.span.column.max(1) - 1;
            write!(f, "\n{}^", " ".repeat(caret_col))?;
        }

        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// Accumulates diagnostics across the pipeline stages.
///
/// The reporter never aborts control flow itself; each stage checks
/// `has_errors` and decides whether to continue. Keeping the original
/// source around lets `report` attach the offending line for
/// caret-pointing output.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    errors: Vec<Diagnostic>,
    source: String,
}

impl ErrorReporter {
    pub fn new() -> Self {
        ErrorReporter::default()
    }

    pub fn set_source(&mut self, source: &str) {
        self.source = source.to_string();
    }

    pub fn report(&mut self, kind: ErrorKind, message: impl Into<String>, span: Span) {
        let source_line = if span.line > 0 {
            self.line_at(span.line)
        } else {
            String::new()
        };
        self.errors.push(Diagnostic {
            kind,
            message: message.into(),
            span,
            source_line,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// Writes every accumulated diagnostic to stderr.
    pub fn print_all(&self) {
        for error in &self.errors {
            eprintln!("{}", error);
        }
    }

    fn line_at(&self, line_num: usize) -> String {
        self.source
            .lines()
            .nth(line_num.saturating_sub(1))
            .unwrap_or("")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_with_caret() {
        let mut reporter = ErrorReporter::new();
        reporter.set_source("let x = @;\n");
        reporter.report(
            ErrorKind::Lexical,
            "Unexpected character '@'.",
            Span::new(8, 9, 1, 9),
        );

        let formatted = reporter.errors()[0].to_string();
        assert!(formatted.contains("[LEXICAL ERROR]"));
        assert!(formatted.contains("at line 1, column 9"));
        assert!(formatted.contains("let x = @;"));
        assert!(formatted.ends_with("        ^"));
    }

    #[test]
    fn test_format_without_location() {
        let mut reporter = ErrorReporter::new();
        reporter.report(ErrorKind::Compilation, "internal error", Span::none());

        let formatted = reporter.errors()[0].to_string();
        assert_eq!(formatted, "[COMPILATION ERROR]: internal error");
    }

    #[test]
    fn test_runtime_error_without_column() {
        let mut reporter = ErrorReporter::new();
        reporter.set_source("print(1/0);");
        reporter.report(
            ErrorKind::Runtime,
            "Division by zero.",
            Span::new(0, 0, 1, 0),
        );

        let formatted = reporter.errors()[0].to_string();
        assert!(formatted.starts_with("[RUNTIME ERROR] at line 1: Division by zero."));
        assert!(!formatted.contains("column"));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut reporter = ErrorReporter::new();
        reporter.report(ErrorKind::Syntax, "oops", Span::none());
        assert!(reporter.has_errors());

        reporter.clear();
        assert!(!reporter.has_errors());
        assert!(reporter.errors().is_empty());
    }

    #[test]
    fn test_line_lookup_last_line_without_newline() {
        let mut reporter = ErrorReporter::new();
        reporter.set_source("first;\nsecond");
        reporter.report(ErrorKind::Syntax, "bad", Span::new(7, 8, 2, 1));

        assert_eq!(reporter.errors()[0].source_line, "second");
    }
}
