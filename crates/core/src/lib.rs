//! Ember core: the runtime substrate shared by the compiler and the VM.
//!
//! Key design principles:
//! - `Value`: what Ember programs talk about (nil, booleans, numbers, objects)
//! - `Gc<T>`: implementation detail (a copyable handle into the managed heap)
//! - `Heap`: the single chokepoint for allocation, interning, and collection
//!
//! The compiler and the VM both allocate through `Heap`; every allocation
//! site hands the heap a [`Trace`] view of its live roots so a collection
//! can run at any allocation point.

pub mod chunk;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{Heap, NoRoots, Trace};
pub use object::{
    Gc, HeapObj, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader,
    ObjInstance, ObjKind, ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueState,
};
pub use table::Table;
pub use value::Value;
