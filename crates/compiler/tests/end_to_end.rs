//! Source-to-bytecode end-to-end tests exercising `quill_compiler::compile`
//! together with `quill_vm::Vm`. These live here (rather than as unit tests
//! inside `quill-vm`) because `quill-compiler` already depends on
//! `quill-vm`; a dev-dependency in the other direction would force cargo to
//! build two distinct copies of `quill-vm` for `quill-vm`'s own test binary.

use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use quill_core::ObjClosure;
use quill_vm::{RuntimeError, Vm};

/// `Write` sink that a test keeps a handle to after the `Vm` it was handed
/// to has taken ownership, so printed output can be asserted on.
#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn new() -> Self {
        SharedBuf(Arc::new(Mutex::new(Vec::new())))
    }

    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), RuntimeError>, String) {
    let stdout = SharedBuf::new();
    let mut vm = Vm::with_io(Box::new(stdout.clone()), Box::new(io::Cursor::new(Vec::new())));
    let function_handle = quill_compiler::compile(source, vm.heap_mut()).expect("program compiles");
    let closure_handle = vm
        .heap_mut()
        .alloc_closure(ObjClosure::new(function_handle, 0), |_| {});
    let result = vm.interpret(closure_handle);
    (result, stdout.contents())
}

#[test]
fn end_to_end_arithmetic_precedence() {
    let (result, out) = run("print 1 + 2 * 3;");
    assert!(result.is_ok());
    assert_eq!(out, "7\n");
}

#[test]
fn end_to_end_string_concatenation() {
    let (result, out) = run(r#"var a="foo"; var b="bar"; print a+b;"#);
    assert!(result.is_ok());
    assert_eq!(out, "foobar\n");
}

#[test]
fn end_to_end_closure_counter() {
    let (result, out) = run(
        "fun mk(){var x=0; fun inc(){x=x+1; return x;} return inc;} \
         var f=mk(); print f(); print f(); print f();",
    );
    assert!(result.is_ok());
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn end_to_end_class_inheritance() {
    let (result, out) = run("class A{greet(){print \"hi\";}} class B < A{} B().greet();");
    assert!(result.is_ok());
    assert_eq!(out, "hi\n");
}

#[test]
fn end_to_end_init_and_field_access() {
    let (result, out) = run("class P{init(n){this.n=n;} pr(){print this.n;}} var p=P(42); p.pr();");
    assert!(result.is_ok());
    assert_eq!(out, "42\n");
}

#[test]
fn end_to_end_negating_non_number_is_runtime_error() {
    let (result, _out) = run("print -true;");
    let err = result.unwrap_err();
    assert_eq!(err.message, "Operand must be a number.");
}

#[test]
fn end_to_end_while_loop() {
    let (result, out) = run("var i=0; while(i<3){print i; i=i+1;}");
    assert!(result.is_ok());
    assert_eq!(out, "0\n1\n2\n");
}
