//! Ember runtime: the stack-based virtual machine.
//!
//! [`Vm::interpret`] takes a source string through the compiler and runs
//! the resulting top-level function on a shared value stack with call
//! frames, open/closed upvalues, method dispatch, and single inheritance.
//! The VM owns the heap; its stack, frames, globals, open-upvalue list,
//! and interned `"init"` string are the collector's roots during
//! execution, and double as the base roots for collections triggered
//! while compiling REPL input.

pub mod natives;

mod error;
mod vm;

pub use error::{InterpretError, RuntimeError};
pub use vm::{Vm, VmOptions};

// Re-exported so hosts can install natives and inspect diagnostics
// without depending on the lower crates directly.
pub use ember_compiler::CompileError;
pub use ember_core::value::Value;
