//! The virtual machine.
//!
//! One dispatch loop reads a byte at a time from the current call frame's
//! chunk and switches on the opcode. All frames share a single value
//! stack; a frame's locals live at `stack[slots..]`, with slot 0 holding
//! the callee (the receiver, inside methods). Captured variables go
//! through upvalue cells: open ones index into the stack, and are hoisted
//! ("closed") in place when their slot is about to be discarded, so
//! closures keep working after their defining frame returns.
//!
//! The VM owns the heap. Every allocation site passes a [`VmRoots`] view
//! of the stack, frames, globals, open-upvalue list, and the interned
//! `"init"` string, so a collection can run at any allocation point; any
//! value in flight is parked on the stack first.

use std::io::{self, Write};

use tracing::trace;

use ember_compiler::compile;
use ember_core::chunk::OpCode;
use ember_core::heap::{Heap, NoRoots, Trace};
use ember_core::object::{
    Gc, HeapObj, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative,
    ObjString, ObjUpvalue, UpvalueState,
};
use ember_core::table::Table;
use ember_core::value::Value;

use crate::error::{InterpretError, RuntimeError};
use crate::natives;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

/// One active invocation: the closure being run, the index of its next
/// instruction, and where its slot window starts on the value stack.
struct CallFrame {
    closure: Gc<ObjClosure>,
    ip: usize,
    slots: usize,
}

/// The VM's root set, rebuilt from borrows of the live fields at each
/// allocation site.
struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a Table,
    open_upvalues: Option<Gc<ObjUpvalue>>,
    init_string: Gc<ObjString>,
}

impl Trace for VmRoots<'_> {
    fn trace(&self, heap: &mut Heap) {
        for &value in self.stack {
            heap.mark_value(value);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure.as_obj());
        }
        let mut upvalue = self.open_upvalues;
        while let Some(current) = upvalue {
            heap.mark_object(current.as_obj());
            upvalue = current.next_open;
        }
        heap.mark_table(self.globals);
        heap.mark_object(self.init_string.as_obj());
    }
}

/// Tuning knobs threaded through from the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Collect on every allocation; slow, but flushes out rooting bugs.
    pub stress_gc: bool,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Head of the open-upvalue list, sorted by decreasing stack slot.
    open_upvalues: Option<Gc<ObjUpvalue>>,
    /// Interned `"init"`, kept alive for initializer lookup on every
    /// class construction.
    init_string: Gc<ObjString>,
    /// Where `print` writes; swappable so tests can capture output.
    out: Box<dyn Write>,
}

// Rebuilds a `VmRoots` from `self`'s fields. A macro rather than a method
// so the borrow of `heap` stays disjoint from the borrows of the root
// fields at the call site.
macro_rules! vm_roots {
    ($vm:expr) => {
        VmRoots {
            stack: &$vm.stack,
            frames: &$vm.frames,
            globals: &$vm.globals,
            open_upvalues: $vm.open_upvalues,
            init_string: $vm.init_string,
        }
    };
}

impl Vm {
    pub fn new() -> Vm {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Vm {
        let mut heap = Heap::with_stress(options.stress_gc);
        let init_string = heap.intern("init", &NoRoots);
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            out: Box::new(io::stdout()),
        };
        vm.define_native("clock", natives::clock);
        vm
    }

    /// Redirect `print` output (stdout by default).
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    /// Read-only view of the heap, for host inspection.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Install a host function as a global binding.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        // Both objects park on the stack so a collection inside either
        // allocation sees them.
        let name = self.intern(name);
        self.push(Value::from(name));
        let native = self.allocate(ObjNative::new(function));
        self.push(Value::from(native));
        self.globals.put(name, Value::from(native));
        self.pop();
        self.pop();
    }

    /// Compile and run one program (or REPL line). Globals, classes, and
    /// interned strings persist across calls on the same `Vm`.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = {
            let roots = vm_roots!(self);
            compile(source, &mut self.heap, &roots)?
        };
        // Root the fresh function before the closure allocation can
        // collect.
        self.push(Value::from(function));
        let closure = self.allocate(ObjClosure::new(function));
        self.pop();
        self.push(Value::from(closure));
        self.call(closure, 0)?;
        self.run().map_err(InterpretError::from)
    }

    // ---- allocation (every site roots the VM state) -----------------------

    fn allocate<T: HeapObj>(&mut self, payload: T) -> Gc<T> {
        let roots = vm_roots!(self);
        self.heap.allocate(payload, &roots)
    }

    fn intern(&mut self, text: &str) -> Gc<ObjString> {
        let roots = vm_roots!(self);
        self.heap.intern(text, &roots)
    }

    // ---- stack ------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ---- frame and chunk access -------------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames
            .last()
            .expect("call frame stack is never empty while running")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("call frame stack is never empty while running")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = u16::from(self.read_byte());
        let lo = u16::from(self.read_byte());
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frame();
        frame.closure.function.chunk.constants[index]
    }

    fn read_string(&mut self) -> Gc<ObjString> {
        self.read_constant()
            .as_string()
            .expect("constant operand is an interned string")
    }

    // ---- error construction -----------------------------------------------

    /// Build a runtime error with the current stack trace (innermost frame
    /// last), then unwind everything.
    fn runtime_error(&mut self, message: &str) -> RuntimeError {
        let mut stack_trace = Vec::new();
        for frame in &self.frames {
            let function = frame.closure.function;
            let line = function
                .chunk
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            match function.name {
                Some(name) => stack_trace.push(format!("[line {}] in {}()", line, name.chars)),
                None => stack_trace.push(format!("[line {line}] in script")),
            }
        }
        self.reset_stack();
        RuntimeError {
            message: message.to_string(),
            trace: stack_trace,
        }
    }

    // ---- calls and method dispatch ----------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Some(obj) = callee.as_obj() else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        if let Some(closure) = obj.as_closure() {
            self.call(closure, argc)
        } else if let Some(native) = obj.as_native() {
            let argc = argc as usize;
            let top = self.stack.len();
            let result = (native.function)(&self.stack[top - argc..]);
            // The arguments and the callee all pop; the result replaces
            // them.
            self.stack.truncate(top - argc - 1);
            self.push(result);
            Ok(())
        } else if let Some(class) = obj.as_class() {
            let instance = self.allocate(ObjInstance::new(class));
            let top = self.stack.len();
            self.stack[top - argc as usize - 1] = Value::from(instance);
            if let Some(initializer) = class.methods.get(self.init_string).and_then(Value::as_closure)
            {
                self.call(initializer, argc)
            } else if argc != 0 {
                Err(self.runtime_error(&format!("Expected 0 arguments but got {argc}.")))
            } else {
                Ok(())
            }
        } else if let Some(bound) = obj.as_bound_method() {
            let top = self.stack.len();
            self.stack[top - argc as usize - 1] = bound.receiver;
            self.call(bound.method, argc)
        } else {
            Err(self.runtime_error("Can only call functions and classes."))
        }
    }

    fn call(&mut self, closure: Gc<ObjClosure>, argc: u8) -> Result<(), RuntimeError> {
        let argc = argc as usize;
        let arity = closure.function.arity;
        if argc != arity {
            return Err(self.runtime_error(&format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        trace!(depth = self.frames.len(), "call");
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    /// `Invoke`: fused property access + call. A field shadowing a method
    /// falls back to the plain get-then-call path.
    fn invoke(&mut self, name: Gc<ObjString>, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Some(instance) = receiver.as_instance() else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        if let Some(field) = instance.fields.get(name) {
            let top = self.stack.len();
            self.stack[top - argc as usize - 1] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(instance.class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: Gc<ObjClass>,
        name: Gc<ObjString>,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        let Some(method) = class.methods.get(name).and_then(Value::as_closure) else {
            return Err(self.runtime_error(&format!("Undefined property '{}'.", name.chars)));
        };
        self.call(method, argc)
    }

    /// Method lookup that materializes a bound method over the receiver at
    /// the stack top.
    fn bind_method(&mut self, class: Gc<ObjClass>, name: Gc<ObjString>) -> Result<(), RuntimeError> {
        let Some(method) = class.methods.get(name).and_then(Value::as_closure) else {
            return Err(self.runtime_error(&format!("Undefined property '{}'.", name.chars)));
        };
        let receiver = self.peek(0);
        let bound = self.allocate(ObjBoundMethod::new(receiver, method));
        self.pop();
        self.push(Value::from(bound));
        Ok(())
    }

    // ---- upvalues ---------------------------------------------------------

    /// Find or create the open upvalue for `slot`. The list is sorted by
    /// decreasing slot, so the scan stops at the first entry at or below
    /// the target and capture stays O(distance-from-top).
    fn capture_upvalue(&mut self, slot: usize) -> Gc<ObjUpvalue> {
        let mut prev: Option<Gc<ObjUpvalue>> = None;
        let mut current = self.open_upvalues;
        while let Some(upvalue) = current {
            match upvalue.open_slot() {
                Some(s) if s > slot => {
                    prev = Some(upvalue);
                    current = upvalue.next_open;
                }
                _ => break,
            }
        }
        if let Some(upvalue) = current
            && upvalue.open_slot() == Some(slot)
        {
            return upvalue;
        }

        let created = self.allocate(ObjUpvalue::new(slot, current));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(mut prev) => prev.next_open = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`: copy the stack value
    /// into the cell and unlink it, so gets and sets keep hitting the same
    /// storage after the slot is discarded.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(mut upvalue) = self.open_upvalues {
            let Some(slot) = upvalue.open_slot() else {
                break;
            };
            if slot < last {
                break;
            }
            upvalue.state = UpvalueState::Closed(self.stack[slot]);
            self.open_upvalues = upvalue.next_open.take();
        }
    }

    // ---- binary helpers ---------------------------------------------------

    fn binary_number_op(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Sub => Value::Number(a - b),
            OpCode::Mult => Value::Number(a * b),
            // IEEE-754 semantics: division by zero yields an infinity or
            // NaN, not an error.
            OpCode::Div => Value::Number(a / b),
            OpCode::Greater => Value::Bool(a > b),
            OpCode::Less => Value::Bool(a < b),
            _ => unreachable!("not a binary numeric opcode"),
        };
        self.push(result);
        Ok(())
    }

    // ---- the dispatch loop ------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(self.runtime_error("Unknown opcode."));
            };
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater | OpCode::Less => self.binary_number_op(op)?,
                OpCode::Add => {
                    if let (Some(b), Some(a)) = (self.peek(0).as_string(), self.peek(1).as_string())
                    {
                        // Concatenation; operands stay on the stack so the
                        // interning allocation sees them as roots.
                        let mut chars = String::with_capacity(a.chars.len() + b.chars.len());
                        chars.push_str(&a.chars);
                        chars.push_str(&b.chars);
                        let result = self.intern(&chars);
                        self.pop();
                        self.pop();
                        self.push(Value::from(result));
                    } else if let (Some(b), Some(a)) =
                        (self.peek(0).as_number(), self.peek(1).as_number())
                    {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    } else {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                }
                OpCode::Sub | OpCode::Mult | OpCode::Div => self.binary_number_op(op)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{value}");
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.put(name, value);
                    self.pop();
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let Some(value) = self.globals.get(name) else {
                        return Err(self
                            .runtime_error(&format!("Undefined variable '{}'.", name.chars)));
                    };
                    self.push(value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    // Assignment never creates a global; undo the insert if
                    // the name was unknown.
                    if self.globals.put(name, value) {
                        self.globals.delete(name);
                        return Err(self
                            .runtime_error(&format!("Undefined variable '{}'.", name.chars)));
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame().closure.upvalues[index];
                    let value = match upvalue.state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let mut upvalue = self.frame().closure.upvalues[index];
                    match upvalue.state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => upvalue.state = UpvalueState::Closed(value),
                    }
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure => {
                    let function = self
                        .read_constant()
                        .as_function()
                        .expect("closure constant is a function");
                    let upvalue_count = function.upvalue_count;
                    let mut closure = self.allocate(ObjClosure::new(function));
                    // Rooted immediately; the captures below may allocate.
                    self.push(Value::from(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().slots;
                            self.capture_upvalue(base + index)
                        } else {
                            self.frame().closure.upvalues[index]
                        };
                        closure.upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self
                        .frames
                        .pop()
                        .expect("call frame stack is never empty while running");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        // Popping the script closure leaves a clean stack.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.allocate(ObjClass::new(name));
                    self.push(Value::from(class));
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let Some(instance) = self.peek(0).as_instance() else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    if let Some(value) = instance.fields.get(name) {
                        self.pop();
                        self.push(value);
                    } else {
                        self.bind_method(instance.class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let Some(mut instance) = self.peek(1).as_instance() else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    // Fields win unconditionally, even over a method of the
                    // same name.
                    instance.fields.put(name, self.peek(0));
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let mut class = self
                        .peek(1)
                        .as_class()
                        .expect("method declaration binds into a class");
                    class.methods.put(name, method);
                    self.pop();
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::Inherit => {
                    let Some(superclass) = self.peek(1).as_class() else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let mut subclass = self
                        .peek(0)
                        .as_class()
                        .expect("inherit target is the class just declared");
                    // Snapshot semantics: methods added to the superclass
                    // later are not seen by the subclass.
                    subclass.methods.add_all_from(&superclass.methods);
                    self.pop();
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self
                        .pop()
                        .as_class()
                        .expect("'super' slot always holds a class");
                    self.bind_method(superclass, name)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = self
                        .pop()
                        .as_class()
                        .expect("'super' slot always holds a class");
                    self.invoke_from_class(superclass, name, argc)?;
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_native_registers_global() {
        let mut vm = Vm::new();
        let name = vm.intern("clock");
        let value = vm.globals.get(name).expect("clock is installed");
        assert!(value.as_obj().and_then(|obj| obj.as_native()).is_some());
    }

    #[test]
    fn test_stack_discipline() {
        let mut vm = Vm::new();
        vm.push(Value::Number(1.0));
        vm.push(Value::Number(2.0));
        assert_eq!(vm.peek(0), Value::Number(2.0));
        assert_eq!(vm.peek(1), Value::Number(1.0));
        assert_eq!(vm.pop(), Value::Number(2.0));
        assert_eq!(vm.pop(), Value::Number(1.0));
    }

    #[test]
    fn test_capture_upvalue_dedups_and_sorts() {
        let mut vm = Vm::new();
        vm.push(Value::Number(10.0));
        vm.push(Value::Number(20.0));

        let first = vm.capture_upvalue(1);
        let zeroth = vm.capture_upvalue(0);
        let again = vm.capture_upvalue(1);
        assert_eq!(first, again);
        assert_ne!(first, zeroth);

        // Head of the open list points at the highest slot.
        let head = vm.open_upvalues.expect("open list is non-empty");
        assert_eq!(head.open_slot(), Some(1));
        let next = head.next_open.expect("second entry");
        assert_eq!(next.open_slot(), Some(0));
        assert!(next.next_open.is_none());
    }

    #[test]
    fn test_close_upvalues_hoists_values() {
        let mut vm = Vm::new();
        vm.push(Value::Number(10.0));
        vm.push(Value::Number(20.0));
        let upper = vm.capture_upvalue(1);
        let lower = vm.capture_upvalue(0);

        vm.close_upvalues(1);
        match upper.state {
            UpvalueState::Closed(value) => assert_eq!(value, Value::Number(20.0)),
            UpvalueState::Open(_) => panic!("slot 1 should have closed"),
        }
        // Slot 0 is below the threshold and stays open, now at the head.
        assert_eq!(vm.open_upvalues, Some(lower));
        assert_eq!(lower.open_slot(), Some(0));
    }
}
