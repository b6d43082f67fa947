//! Built-in native functions.
//!
//! The registry is deliberately tiny; hosts extend it through
//! [`crate::Vm::define_native`] before running code.

use std::time::{SystemTime, UNIX_EPOCH};

use ember_core::value::Value;

/// `clock()` — seconds since the Unix epoch, as a number.
pub fn clock(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default();
    Value::Number(seconds)
}
