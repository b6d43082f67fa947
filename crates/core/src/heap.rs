//! The managed heap and its mark–sweep collector.
//!
//! All object allocation funnels through [`Heap::allocate`] (or
//! [`Heap::intern`] for strings), which charges the allocation against
//! `bytes_allocated` and may run a full collection before the new object
//! is linked in. Collection is stop-the-world and precise: the caller
//! hands every allocation a [`Trace`] view of its live roots, the marker
//! blackens objects through a gray worklist kept outside the managed heap,
//! the intern table drops its unmarked strings (it is the one weak
//! reference set in the system), and sweep unlinks and frees whatever is
//! left white.
//!
//! ## Rooting discipline
//!
//! A collection can happen inside any `allocate`/`intern` call, so every
//! handle held across one must be reachable from the roots passed in. In
//! practice the VM parks in-flight values on its stack (a root) and the
//! compiler keeps in-progress functions in its compiler chain (also a
//! root) before allocating.

use tracing::{debug, trace};

use crate::object::{
    Gc, HeapObj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader, ObjInstance,
    ObjKind, ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// A set of collector roots. Implementations mark every handle they hold
/// live via the `mark_*` methods on [`Heap`].
pub trait Trace {
    fn trace(&self, heap: &mut Heap);
}

/// The empty root set, for contexts with no live handles yet (heap
/// bring-up, unit tests).
pub struct NoRoots;

impl Trace for NoRoots {
    fn trace(&self, _heap: &mut Heap) {}
}

pub struct Heap {
    /// Head of the intrusive list threading every live object.
    objects: *mut ObjHeader,
    /// Weak map of every live string, keyed by contents.
    strings: Table,
    /// Gray worklist; host-allocated so marking never recurses into the
    /// managed heap.
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect on every allocation (debug aid for shaking out unrooted
    /// handles).
    stress: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_stress(false)
    }

    pub fn with_stress(stress: bool) -> Self {
        Heap {
            objects: std::ptr::null_mut(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stress,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Read-only view of the intern table.
    pub fn strings(&self) -> &Table {
        &self.strings
    }

    /// Move `payload` onto the managed heap.
    ///
    /// May collect before the object is created, so every handle inside
    /// `payload` — and every handle the caller still needs afterwards —
    /// must be reachable from `roots`.
    pub fn allocate<T: HeapObj>(&mut self, payload: T, roots: &dyn Trace) -> Gc<T> {
        self.bytes_allocated += payload.byte_size();
        if self.stress || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }

        let mut boxed = Box::new(payload);
        let header = boxed.header_mut();
        debug_assert_eq!(header.kind, T::KIND);
        header.marked = false;
        header.next = self.objects;
        let ptr = Box::into_raw(boxed);
        self.objects = ptr.cast::<ObjHeader>();
        trace!(ptr = ?ptr, kind = ?T::KIND, "allocate");
        unsafe { Gc::from_raw(ptr) }
    }

    /// Return the canonical string object for `chars`, allocating and
    /// interning one if this byte sequence has not been seen before.
    pub fn intern(&mut self, chars: &str, roots: &dyn Trace) -> Gc<ObjString> {
        let hash = ObjString::hash_str(chars);
        if let Some(existing) = self.strings.find_string(chars, hash) {
            return existing;
        }
        let string = self.allocate(ObjString::new(chars, hash), roots);
        // The intern table holds the string weakly; it is not a root.
        self.strings.put(string, Value::Nil);
        string
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, mut obj: ObjRef) {
        if obj.marked {
            return;
        }
        obj.marked = true;
        trace!(ptr = ?obj.as_ptr(), kind = ?obj.kind, "mark");
        self.gray.push(obj);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key.as_obj());
            self.mark_value(value);
        }
    }

    /// Run a full collection with the given roots.
    pub fn collect(&mut self, roots: &dyn Trace) {
        let before = self.bytes_allocated;
        debug!(bytes = before, "gc begin");

        roots.trace(self);
        self.trace_references();
        self.strings.remove_white();
        self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        debug!(
            collected = before - self.bytes_allocated,
            live = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }
    }

    /// Mark everything a gray object points at.
    fn blacken(&mut self, obj: ObjRef) {
        trace!(ptr = ?obj.as_ptr(), kind = ?obj.kind, "blacken");
        match obj.kind {
            // Strings and natives have no outgoing edges.
            ObjKind::String | ObjKind::Native => {}
            ObjKind::Upvalue => {
                let upvalue = unsafe { obj.cast::<ObjUpvalue>() };
                if let UpvalueState::Closed(value) = upvalue.state {
                    self.mark_value(value);
                }
            }
            ObjKind::Function => {
                let function = unsafe { obj.cast::<ObjFunction>() };
                if let Some(name) = function.name {
                    self.mark_object(name.as_obj());
                }
                for &constant in &function.chunk.constants {
                    self.mark_value(constant);
                }
            }
            ObjKind::Closure => {
                let closure = unsafe { obj.cast::<ObjClosure>() };
                self.mark_object(closure.function.as_obj());
                for &upvalue in &closure.upvalues {
                    self.mark_object(upvalue.as_obj());
                }
            }
            ObjKind::Class => {
                let class = unsafe { obj.cast::<ObjClass>() };
                self.mark_object(class.name.as_obj());
                self.mark_table(&class.methods);
            }
            ObjKind::Instance => {
                let instance = unsafe { obj.cast::<ObjInstance>() };
                self.mark_object(instance.class.as_obj());
                self.mark_table(&instance.fields);
            }
            ObjKind::BoundMethod => {
                let bound = unsafe { obj.cast::<ObjBoundMethod>() };
                self.mark_value(bound.receiver);
                self.mark_object(bound.method.as_obj());
            }
        }
    }

    /// Walk the object list, unlinking and freeing unmarked objects and
    /// clearing the mark bit on survivors.
    fn sweep(&mut self) {
        let mut prev: *mut ObjHeader = std::ptr::null_mut();
        let mut object = self.objects;
        while !object.is_null() {
            unsafe {
                if (*object).marked {
                    (*object).marked = false;
                    prev = object;
                    object = (*object).next;
                } else {
                    let unreached = object;
                    object = (*object).next;
                    if prev.is_null() {
                        self.objects = object;
                    } else {
                        (*prev).next = object;
                    }
                    self.free_object(unreached);
                }
            }
        }
    }

    /// Reconstruct the owning box for `ptr` and drop it, releasing the
    /// object's owned storage (string bytes, chunk vectors, tables).
    ///
    /// # Safety
    /// `ptr` must be an unlinked object allocated by this heap, and no
    /// live handle to it may remain.
    unsafe fn free_object(&mut self, ptr: *mut ObjHeader) {
        unsafe {
            trace!(ptr = ?ptr, kind = ?(*ptr).kind, "free");
            match (*ptr).kind {
                ObjKind::String => {
                    let obj = Box::from_raw(ptr.cast::<ObjString>());
                    self.bytes_allocated -= obj.byte_size();
                }
                ObjKind::Function => {
                    let obj = Box::from_raw(ptr.cast::<ObjFunction>());
                    self.bytes_allocated -= obj.byte_size();
                }
                ObjKind::Native => {
                    let obj = Box::from_raw(ptr.cast::<ObjNative>());
                    self.bytes_allocated -= obj.byte_size();
                }
                ObjKind::Closure => {
                    let obj = Box::from_raw(ptr.cast::<ObjClosure>());
                    self.bytes_allocated -= obj.byte_size();
                }
                ObjKind::Upvalue => {
                    let obj = Box::from_raw(ptr.cast::<ObjUpvalue>());
                    self.bytes_allocated -= obj.byte_size();
                }
                ObjKind::Class => {
                    let obj = Box::from_raw(ptr.cast::<ObjClass>());
                    self.bytes_allocated -= obj.byte_size();
                }
                ObjKind::Instance => {
                    let obj = Box::from_raw(ptr.cast::<ObjInstance>());
                    self.bytes_allocated -= obj.byte_size();
                }
                ObjKind::BoundMethod => {
                    let obj = Box::from_raw(ptr.cast::<ObjBoundMethod>());
                    self.bytes_allocated -= obj.byte_size();
                }
            }
        }
    }

    #[cfg(test)]
    fn object_count(&self) -> usize {
        let mut count = 0;
        let mut object = self.objects;
        while !object.is_null() {
            count += 1;
            object = unsafe { (*object).next };
        }
        count
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut object = self.objects;
        while !object.is_null() {
            let next = unsafe { (*object).next };
            unsafe { self.free_object(object) };
            object = next;
        }
        self.objects = std::ptr::null_mut();
    }
}
