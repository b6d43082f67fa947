//! End-to-end interpreter tests: whole programs through `Vm::interpret`,
//! asserting on captured `print` output and on the error taxonomy.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use ember_runtime::{InterpretError, RuntimeError, Value, Vm};

/// A `Write` sink the test can read back after handing a clone to the VM.
#[derive(Clone, Default)]
struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedOutput {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

fn capture(vm: &mut Vm) -> SharedOutput {
    let out = SharedOutput::default();
    vm.set_output(Box::new(out.clone()));
    out
}

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let mut vm = Vm::new();
    let out = capture(&mut vm);
    let result = vm.interpret(source);
    (result, out.contents())
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    if let Err(error) = result {
        panic!("program failed: {error}\noutput so far: {output}");
    }
    output
}

fn run_runtime_error(source: &str) -> RuntimeError {
    match run(source).0 {
        Err(InterpretError::Runtime(error)) => error,
        Err(InterpretError::Compile(errors)) => {
            panic!("expected runtime error, got compile errors: {errors:?}")
        }
        Ok(()) => panic!("expected runtime error, program succeeded"),
    }
}

#[test]
fn test_arithmetic_print() {
    assert_eq!(run_ok("print 1 + 2;"), "3\n");
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run_ok("print -4 + 1;"), "-3\n");
    assert_eq!(run_ok("print 7 / 2;"), "3.5\n");
}

#[test]
fn test_division_follows_ieee() {
    assert_eq!(run_ok("print 1 / 0;"), "inf\n");
    assert_eq!(run_ok("print -1 / 0;"), "-inf\n");
    assert_eq!(run_ok("print 0 / 0;"), "NaN\n");
}

#[test]
fn test_comparison_and_equality() {
    assert_eq!(run_ok("print 1 < 2;"), "true\n");
    assert_eq!(run_ok("print 2 <= 2;"), "true\n");
    assert_eq!(run_ok("print 3 > 4;"), "false\n");
    assert_eq!(run_ok("print \"a\" == \"a\";"), "true\n");
    assert_eq!(run_ok("print \"a\" == \"b\";"), "false\n");
    assert_eq!(run_ok("print nil == false;"), "false\n");
    assert_eq!(run_ok("print 1 == \"1\";"), "false\n");
}

#[test]
fn test_truthiness() {
    assert_eq!(run_ok("print !nil;"), "true\n");
    assert_eq!(run_ok("print !false;"), "true\n");
    assert_eq!(run_ok("print !0;"), "false\n");
    assert_eq!(run_ok("print !\"\";"), "false\n");
}

#[test]
fn test_string_concatenation_interns_result() {
    let mut vm = Vm::new();
    let out = capture(&mut vm);
    vm.interpret("var s = \"a\" + \"b\" + \"c\"; print s;")
        .expect("program runs");
    assert_eq!(out.contents(), "abc\n");
    let abc_entries = vm
        .heap()
        .strings()
        .iter()
        .filter(|(key, _)| &*key.chars == "abc")
        .count();
    assert_eq!(abc_entries, 1);
}

#[test]
fn test_globals_round_trip() {
    assert_eq!(run_ok("var a = 1; print a; a = a + 1; print a;"), "1\n2\n");
    assert_eq!(run_ok("var u; print u;"), "nil\n");
}

#[test]
fn test_locals_and_shadowing() {
    assert_eq!(
        run_ok("var a = \"global\"; { var a = \"local\"; print a; } print a;"),
        "local\nglobal\n"
    );
}

#[test]
fn test_control_flow() {
    assert_eq!(run_ok("if (1 < 2) print \"yes\"; else print \"no\";"), "yes\n");
    assert_eq!(run_ok("if (nil) print \"yes\"; else print \"no\";"), "no\n");
    assert_eq!(
        run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"),
        "0\n1\n2\n"
    );
    assert_eq!(
        run_ok("for (var i = 0; i < 3; i = i + 1) print i;"),
        "0\n1\n2\n"
    );
}

#[test]
fn test_logical_operators_leave_operand_values() {
    assert_eq!(run_ok("print 1 and 2;"), "2\n");
    assert_eq!(run_ok("print nil and 2;"), "nil\n");
    assert_eq!(run_ok("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(run_ok("print 1 or 2;"), "1\n");
    // Short-circuiting must skip the right operand entirely; `boom` is
    // undefined and would be a runtime error if evaluated.
    assert_eq!(run_ok("print false and boom();"), "false\n");
    assert_eq!(run_ok("print true or boom();"), "true\n");
}

#[test]
fn test_function_calls_and_recursion() {
    assert_eq!(
        run_ok("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
        "55\n"
    );
    assert_eq!(run_ok("fun f() {} print f();"), "nil\n");
    assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
}

#[test]
fn test_closure_retains_captured_variable() {
    // The captured `x` outlives `outer`'s frame and keeps its state across
    // calls.
    let source = "\
fun outer() { var x = 1; fun inner() { x = x + 1; print x; } return inner; }
var f = outer(); f(); f();";
    assert_eq!(run_ok(source), "2\n3\n");
}

#[test]
fn test_two_closures_share_one_upvalue() {
    let source = "\
fun pair() {
  var n = 0;
  fun bump() { n = n + 1; }
  fun read() { print n; }
  bump(); bump(); read();
}
pair();";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn test_initializer_contract() {
    assert_eq!(run_ok("class P { init(n) { this.n = n; } } print P(7).n;"), "7\n");
    // init returns the receiver even when invoked through an explicit
    // bare return.
    assert_eq!(
        run_ok("class P { init() { this.x = 1; return; } } print P().x;"),
        "1\n"
    );
}

#[test]
fn test_inheritance_and_super() {
    let source = "\
class A { greet() { print \"A\"; } }
class B < A { greet() { super.greet(); print \"B\"; } }
B().greet();";
    assert_eq!(run_ok(source), "A\nB\n");
}

#[test]
fn test_inherited_method_without_override() {
    let source = "\
class A { hello() { print \"hi\"; } }
class B < A { }
B().hello();";
    assert_eq!(run_ok(source), "hi\n");
}

#[test]
fn test_bound_method_carries_receiver() {
    let source = "\
class C { init() { this.x = 5; } get() { return this.x; } }
var g = C().get;
print g();";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn test_field_shadows_method() {
    let source = "\
class C { m() { return 1; } }
var c = C();
c.m = 2;
print c.m;";
    assert_eq!(run_ok(source), "2\n");
    // The Invoke fast path must also honor a shadowing field holding a
    // callable.
    let source = "\
fun nine() { return 9; }
class C { m() { return 1; } }
var c = C();
c.m = nine;
print c.m();";
    assert_eq!(run_ok(source), "9\n");
}

#[test]
fn test_object_display_forms() {
    assert_eq!(run_ok("class C {} print C;"), "C\n");
    assert_eq!(run_ok("class C {} print C();"), "C instance\n");
    assert_eq!(run_ok("print clock;"), "<native fn>\n");
}

#[test]
fn test_undefined_variable() {
    let error = run_runtime_error("print missing;");
    assert_eq!(error.message, "Undefined variable 'missing'.");
    assert_eq!(error.trace, vec!["[line 1] in script"]);
}

#[test]
fn test_assignment_does_not_create_globals() {
    let error = run_runtime_error("x = 1;");
    assert_eq!(error.message, "Undefined variable 'x'.");
}

#[test]
fn test_type_errors() {
    assert_eq!(
        run_runtime_error("print 1 + \"a\";").message,
        "Operands must be two numbers or two strings."
    );
    assert_eq!(
        run_runtime_error("print 1 < \"a\";").message,
        "Operands must be numbers."
    );
    assert_eq!(run_runtime_error("print -\"a\";").message, "Operand must be a number.");
}

#[test]
fn test_calling_non_callable() {
    assert_eq!(
        run_runtime_error("var x = 1; x();").message,
        "Can only call functions and classes."
    );
    assert_eq!(
        run_runtime_error("\"str\"();").message,
        "Can only call functions and classes."
    );
}

#[test]
fn test_wrong_arity() {
    let error = run_runtime_error("fun f(a) {} f(1, 2);");
    assert_eq!(error.message, "Expected 1 arguments but got 2.");
    let error = run_runtime_error("class C { init(a) {} } C();");
    assert_eq!(error.message, "Expected 1 arguments but got 0.");
    let error = run_runtime_error("class C {} C(1);");
    assert_eq!(error.message, "Expected 0 arguments but got 1.");
}

#[test]
fn test_property_access_on_non_instance() {
    assert_eq!(
        run_runtime_error("var x = 1; print x.field;").message,
        "Only instances have properties."
    );
    assert_eq!(
        run_runtime_error("var x = 1; x.field = 2;").message,
        "Only instances have fields."
    );
    assert_eq!(
        run_runtime_error("var x = 1; x.m();").message,
        "Only instances have methods."
    );
}

#[test]
fn test_undefined_property() {
    let error = run_runtime_error("class C {} print C().nope;");
    assert_eq!(error.message, "Undefined property 'nope'.");
    let error = run_runtime_error("class C {} C().nope();");
    assert_eq!(error.message, "Undefined property 'nope'.");
}

#[test]
fn test_superclass_must_be_a_class() {
    let error = run_runtime_error("var NotAClass = 1; class B < NotAClass {}");
    assert_eq!(error.message, "Superclass must be a class.");
}

#[test]
fn test_stack_overflow_unwinds_with_trace() {
    let error = run_runtime_error("fun f() { f(); } f();");
    assert_eq!(error.message, "Stack overflow.");
    // Innermost frames come last and carry the function name.
    assert_eq!(error.trace.first().map(String::as_str), Some("[line 1] in script"));
    assert_eq!(error.trace.last().map(String::as_str), Some("[line 1] in f()"));
    assert!(error.trace.len() > 2);
}

#[test]
fn test_runtime_error_trace_orders_frames() {
    let source = "\
fun inner() { return 1 + nil; }
fun outer() { inner(); }
outer();";
    let error = run_runtime_error(source);
    assert_eq!(error.message, "Operands must be two numbers or two strings.");
    assert_eq!(
        error.trace,
        vec![
            "[line 3] in script",
            "[line 2] in outer()",
            "[line 1] in inner()",
        ]
    );
}

#[test]
fn test_compile_errors_do_not_execute() {
    let (result, output) = run("print \"side effect\"; var = 1;");
    match result {
        Err(InterpretError::Compile(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].message, "Expect variable name.");
        }
        other => panic!("expected compile failure, got {other:?}"),
    }
    assert_eq!(output, "");
}

#[test]
fn test_vm_survives_runtime_error() {
    let mut vm = Vm::new();
    let out = capture(&mut vm);
    assert!(vm.interpret("print boom;").is_err());
    vm.interpret("print \"recovered\";").expect("vm is reusable");
    assert_eq!(out.contents(), "recovered\n");
}

#[test]
fn test_repl_style_state_persists_across_interpretations() {
    let mut vm = Vm::new();
    let out = capture(&mut vm);
    vm.interpret("var counter = 10;").expect("line 1");
    vm.interpret("fun bump() { counter = counter + 1; }").expect("line 2");
    vm.interpret("bump(); print counter;").expect("line 3");
    assert_eq!(out.contents(), "11\n");
}

#[test]
fn test_host_installed_native() {
    fn answer(_args: &[Value]) -> Value {
        Value::Number(42.0)
    }
    let mut vm = Vm::new();
    let out = capture(&mut vm);
    vm.define_native("answer", answer);
    vm.interpret("print answer();").expect("native call runs");
    assert_eq!(out.contents(), "42\n");
}

#[test]
fn test_clock_native_is_installed() {
    assert_eq!(run_ok("print clock() > 0;"), "true\n");
}
