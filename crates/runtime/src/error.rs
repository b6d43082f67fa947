//! Interpreter error types.
//!
//! Two taxonomies, kept separate because they map to different process
//! exit codes: compile errors (the program never ran) and runtime errors
//! (the program died mid-flight, with a stack trace).

use std::fmt;

use ember_compiler::CompileError;

/// A runtime failure, carrying the unwound call stack. Trace entries run
/// outermost first, so the innermost frame reads last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Result type of [`crate::Vm::interpret`].
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(errors) => {
                let mut first = true;
                for error in errors {
                    if !first {
                        writeln!(f)?;
                    }
                    first = false;
                    write!(f, "{error}")?;
                }
                Ok(())
            }
            InterpretError::Runtime(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for InterpretError {}

impl From<Vec<CompileError>> for InterpretError {
    fn from(errors: Vec<CompileError>) -> Self {
        InterpretError::Compile(errors)
    }
}

impl From<RuntimeError> for InterpretError {
    fn from(error: RuntimeError) -> Self {
        InterpretError::Runtime(error)
    }
}
