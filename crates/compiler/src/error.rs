use std::fmt;

/// A single parse/compile-time problem, already formatted the way the
/// scanner's line tracking and the parser's synchronization points see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    pub line: i32,
    /// Best-effort excerpt of the token the error was raised at: `None` for
    /// an already-malformed (`Error`-kind) token, `Some(" at end")` at EOF,
    /// `Some(" at 'lexeme'")` otherwise.
    pub excerpt: Option<String>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        if let Some(excerpt) = &self.excerpt {
            write!(f, "{excerpt}")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}
