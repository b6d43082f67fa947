//! Heap object representation.
//!
//! Every managed object is a `#[repr(C)]` struct whose first field is an
//! [`ObjHeader`]: a type tag, the collector's mark bit, and an intrusive
//! `next` link threading every live object into the heap's sweep list.
//! Objects are reached through [`Gc<T>`], a copyable raw-pointer handle.
//! Because the header always comes first, a typed handle can be erased to
//! [`ObjRef`] and recovered by checking the tag, without any vtables.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Type tag stored in every object header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
}

/// Common header of every heap object.
#[repr(C)]
#[derive(Debug)]
pub struct ObjHeader {
    pub kind: ObjKind,
    /// Set during the mark phase, cleared by sweep.
    pub marked: bool,
    /// Intrusive link in the heap's list of every live object.
    pub next: *mut ObjHeader,
}

impl ObjHeader {
    pub fn new(kind: ObjKind) -> Self {
        ObjHeader {
            kind,
            marked: false,
            next: std::ptr::null_mut(),
        }
    }
}

/// A copyable handle to a heap-managed object.
///
/// `Gc` is a raw pointer under the hood: the heap owns the allocation and
/// frees it during sweep. Handles stay valid exactly as long as the object
/// is reachable from the roots passed to [`crate::heap::Heap::allocate`],
/// which is the invariant the compiler and VM maintain by rooting every
/// in-flight value before the next allocation.
///
/// Dereferencing (including `DerefMut`) is unchecked; the single-threaded
/// execution model means there is exactly one mutator, and call sites keep
/// at most one mutable path to an object at a time.
pub struct Gc<T> {
    ptr: NonNull<T>,
}

impl<T> Gc<T> {
    /// Wrap a raw allocation produced by `Box::into_raw`.
    ///
    /// # Safety
    /// `ptr` must point to a live heap object owned by the collector.
    pub(crate) unsafe fn from_raw(ptr: *mut T) -> Gc<T> {
        Gc {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Reinterpret the handle as pointing to another object type.
    ///
    /// # Safety
    /// Sound only between an object type and [`ObjHeader`] (in either
    /// direction), relying on the header-first `#[repr(C)]` layout.
    pub(crate) unsafe fn cast<U>(self) -> Gc<U> {
        Gc {
            ptr: self.ptr.cast(),
        }
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

// Identity comparison: two handles are equal when they point at the same
// object. Interning makes this the correct equality for strings as well.
impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Gc<T> {}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({:p})", self.ptr.as_ptr())
    }
}

/// A type-erased object handle, as stored in [`Value::Obj`].
pub type ObjRef = Gc<ObjHeader>;

impl Gc<ObjHeader> {
    fn downcast<T: HeapObj>(self) -> Option<Gc<T>> {
        (self.kind == T::KIND).then(|| unsafe { self.cast() })
    }

    pub fn as_string(self) -> Option<Gc<ObjString>> {
        self.downcast()
    }

    pub fn as_function(self) -> Option<Gc<ObjFunction>> {
        self.downcast()
    }

    pub fn as_native(self) -> Option<Gc<ObjNative>> {
        self.downcast()
    }

    pub fn as_closure(self) -> Option<Gc<ObjClosure>> {
        self.downcast()
    }

    pub fn as_upvalue(self) -> Option<Gc<ObjUpvalue>> {
        self.downcast()
    }

    pub fn as_class(self) -> Option<Gc<ObjClass>> {
        self.downcast()
    }

    pub fn as_instance(self) -> Option<Gc<ObjInstance>> {
        self.downcast()
    }

    pub fn as_bound_method(self) -> Option<Gc<ObjBoundMethod>> {
        self.downcast()
    }
}

/// Implemented by every managed object type so the heap can write headers,
/// account bytes, and erase handles generically. Only used generically
/// (never as a trait object), so `Sized` is fine and lets the default
/// accounting use `size_of`.
pub trait HeapObj: Sized {
    const KIND: ObjKind;

    fn header(&self) -> &ObjHeader;
    fn header_mut(&mut self) -> &mut ObjHeader;

    /// Bytes charged against the allocator for this object. Must be stable
    /// over the object's lifetime so allocate/free accounting is symmetric;
    /// growable side tables (class methods, instance fields) are therefore
    /// not charged.
    fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

impl<T: HeapObj> Gc<T> {
    /// Erase the static type; the header tag still records it.
    pub fn as_obj(self) -> ObjRef {
        unsafe { self.cast() }
    }
}

macro_rules! impl_heap_obj {
    ($ty:ty, $kind:expr) => {
        impl HeapObj for $ty {
            const KIND: ObjKind = $kind;

            fn header(&self) -> &ObjHeader {
                &self.header
            }

            fn header_mut(&mut self) -> &mut ObjHeader {
                &mut self.header
            }
        }
    };
}

/// An interned, immutable string.
#[repr(C)]
#[derive(Debug)]
pub struct ObjString {
    pub header: ObjHeader,
    /// FNV-1a hash, cached for table probing.
    pub hash: u32,
    pub chars: Box<str>,
}

impl ObjString {
    pub fn new(chars: &str, hash: u32) -> Self {
        ObjString {
            header: ObjHeader::new(ObjKind::String),
            hash,
            chars: chars.into(),
        }
    }

    /// 32-bit FNV-1a over the raw bytes.
    pub fn hash_str(chars: &str) -> u32 {
        let mut hash: u32 = 2166136261;
        for byte in chars.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(16777619);
        }
        hash
    }
}

impl HeapObj for ObjString {
    const KIND: ObjKind = ObjKind::String;

    fn header(&self) -> &ObjHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjHeader {
        &mut self.header
    }

    fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.chars.len()
    }
}

/// A compiled function: its bytecode chunk plus call metadata.
///
/// Allocated empty when compilation of the function begins (so the
/// compiler chain can root it) and filled in as code is emitted; immutable
/// once it reaches the VM.
#[repr(C)]
#[derive(Debug)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<Gc<ObjString>>,
}

impl ObjFunction {
    pub fn new() -> Self {
        ObjFunction {
            header: ObjHeader::new(ObjKind::Function),
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }
    }
}

impl Default for ObjFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl_heap_obj!(ObjFunction, ObjKind::Function);

/// Host function callable from Ember code.
pub type NativeFn = fn(&[Value]) -> Value;

#[repr(C)]
pub struct ObjNative {
    pub header: ObjHeader,
    pub function: NativeFn,
}

impl ObjNative {
    pub fn new(function: NativeFn) -> Self {
        ObjNative {
            header: ObjHeader::new(ObjKind::Native),
            function,
        }
    }
}

impl_heap_obj!(ObjNative, ObjKind::Native);

/// A function together with the upvalues it captured at creation.
#[repr(C)]
#[derive(Debug)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: Gc<ObjFunction>,
    /// Filled in by the `Closure` opcode right after allocation, while the
    /// closure sits rooted on the VM stack.
    pub upvalues: Vec<Gc<ObjUpvalue>>,
}

impl ObjClosure {
    pub fn new(function: Gc<ObjFunction>) -> Self {
        ObjClosure {
            header: ObjHeader::new(ObjKind::Closure),
            function,
            upvalues: Vec::with_capacity(function.upvalue_count),
        }
    }
}

impl_heap_obj!(ObjClosure, ObjKind::Closure);

/// Where a captured variable currently lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still on the VM stack, at this slot index.
    Open(usize),
    /// Hoisted off the stack; the upvalue owns the value now.
    Closed(Value),
}

/// Indirection cell capturing a variable from an enclosing function.
#[repr(C)]
#[derive(Debug)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub state: UpvalueState,
    /// Link in the VM's list of open upvalues, sorted by decreasing slot.
    pub next_open: Option<Gc<ObjUpvalue>>,
}

impl ObjUpvalue {
    pub fn new(slot: usize, next_open: Option<Gc<ObjUpvalue>>) -> Self {
        ObjUpvalue {
            header: ObjHeader::new(ObjKind::Upvalue),
            state: UpvalueState::Open(slot),
            next_open,
        }
    }

    /// The stack slot this upvalue watches, while it is still open.
    pub fn open_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}

impl_heap_obj!(ObjUpvalue, ObjKind::Upvalue);

#[repr(C)]
#[derive(Debug)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: Gc<ObjString>,
    /// Method name -> closure. Inheritance copies the parent's table in.
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: Gc<ObjString>) -> Self {
        ObjClass {
            header: ObjHeader::new(ObjKind::Class),
            name,
            methods: Table::new(),
        }
    }
}

impl_heap_obj!(ObjClass, ObjKind::Class);

#[repr(C)]
#[derive(Debug)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: Gc<ObjClass>,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: Gc<ObjClass>) -> Self {
        ObjInstance {
            header: ObjHeader::new(ObjKind::Instance),
            class,
            fields: Table::new(),
        }
    }
}

impl_heap_obj!(ObjInstance, ObjKind::Instance);

/// A method closure paired with the receiver it was looked up on.
#[repr(C)]
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: Gc<ObjClosure>,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: Gc<ObjClosure>) -> Self {
        ObjBoundMethod {
            header: ObjHeader::new(ObjKind::BoundMethod),
            receiver,
            method,
        }
    }
}

impl_heap_obj!(ObjBoundMethod, ObjKind::BoundMethod);

pub(crate) fn write_function(f: &mut fmt::Formatter<'_>, function: Gc<ObjFunction>) -> fmt::Result {
    match function.name {
        Some(name) => write!(f, "<fn {}>", name.chars),
        None => write!(f, "<script>"),
    }
}

/// Canonical display form of an object, used by `print` and diagnostics.
pub(crate) fn write_object(f: &mut fmt::Formatter<'_>, obj: ObjRef) -> fmt::Result {
    match obj.kind {
        ObjKind::String => {
            let string = unsafe { obj.cast::<ObjString>() };
            write!(f, "{}", string.chars)
        }
        ObjKind::Function => write_function(f, unsafe { obj.cast() }),
        ObjKind::Native => write!(f, "<native fn>"),
        ObjKind::Closure => {
            let closure = unsafe { obj.cast::<ObjClosure>() };
            write_function(f, closure.function)
        }
        ObjKind::Upvalue => write!(f, "upvalue"),
        ObjKind::Class => {
            let class = unsafe { obj.cast::<ObjClass>() };
            write!(f, "{}", class.name.chars)
        }
        ObjKind::Instance => {
            let instance = unsafe { obj.cast::<ObjInstance>() };
            write!(f, "{} instance", instance.class.name.chars)
        }
        ObjKind::BoundMethod => {
            let bound = unsafe { obj.cast::<ObjBoundMethod>() };
            write_function(f, bound.method.function)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_matches_reference_vectors() {
        // Reference values for the 32-bit FNV-1a function.
        assert_eq!(ObjString::hash_str(""), 0x811c9dc5);
        assert_eq!(ObjString::hash_str("a"), 0xe40c292c);
        assert_eq!(ObjString::hash_str("foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_header_is_first_field() {
        // The erase/downcast scheme relies on the header living at offset 0.
        assert_eq!(std::mem::offset_of!(ObjString, header), 0);
        assert_eq!(std::mem::offset_of!(ObjFunction, header), 0);
        assert_eq!(std::mem::offset_of!(ObjClosure, header), 0);
        assert_eq!(std::mem::offset_of!(ObjUpvalue, header), 0);
        assert_eq!(std::mem::offset_of!(ObjClass, header), 0);
        assert_eq!(std::mem::offset_of!(ObjInstance, header), 0);
        assert_eq!(std::mem::offset_of!(ObjBoundMethod, header), 0);
    }
}
