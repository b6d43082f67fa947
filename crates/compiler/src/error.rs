//! Compile-time diagnostics.

use std::fmt;

/// A single compile error, pinned to the token that triggered it.
///
/// Errors accumulate during panic-mode recovery; the parser keeps
/// consuming tokens after a failure so one run reports as many genuine
/// problems as possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    /// Rendered location: empty, ` at end`, or ` at 'lexeme'`.
    pub location: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[line {}] Error{}: {}",
            self.line, self.location, self.message
        )
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats_location() {
        let err = CompileError {
            line: 3,
            location: " at 'var'".to_string(),
            message: "Expect expression.".to_string(),
        };
        assert_eq!(err.to_string(), "[line 3] Error at 'var': Expect expression.");
    }
}
