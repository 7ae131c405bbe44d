//! The call-frame stack, value stack and dispatch loop that execute a
//! compiled closure.

use std::io::{self, BufRead, Write};
use std::sync::OnceLock;
use std::time::Instant;

use quill_core::{
    fnv1a, is_falsy, values_equal, Handle, NativeContext, NativeFn, Obj, ObjBoundMethod,
    ObjClass, ObjClosure, ObjInstance, ObjNative, ObjUpvalue, OpCode, Table, Value,
};

use crate::error::{RuntimeError, StackFrame};
use crate::heap::Heap;

const MAX_FRAMES: usize = 64;
const STACK_MAX: usize = MAX_FRAMES * 256;

struct CallFrame {
    closure: Handle,
    ip: usize,
    base: usize,
}

/// Owns every piece of mutable state a running program needs: the heap,
/// the value and frame stacks, the globals table, and the open-upvalue
/// list. There is exactly one `Vm` per program run; nothing here is a
/// process-wide singleton.
pub struct Vm {
    heap: Heap,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    /// Sorted by descending `stack_index`, per the invariant that no two
    /// open upvalues ever alias the same slot.
    open_upvalues: Vec<Handle>,
    init_string: Handle,
    stdout: Box<dyn Write>,
    stdin: Box<dyn BufRead>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_io(Box::new(io::stdout()), Box::new(io::BufReader::new(io::stdin())))
    }

    pub fn with_io(stdout: Box<dyn Write>, stdin: Box<dyn BufRead>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init".to_string(), |_| {});
        let mut vm = Vm {
            heap,
            frames: Vec::with_capacity(MAX_FRAMES),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            stdout,
            stdin,
        };
        vm.define_native("clock", 0, native_clock);
        vm.define_native("to_string", 1, native_to_string);
        vm.define_native("readline", 0, native_readline);
        vm
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let name_handle = self.heap.intern_string(name.to_string(), |_| {});
        let native_handle = self.heap.alloc_native(ObjNative { name, arity, function }, |_| {});
        self.globals.set(name_handle, fnv1a(name.as_bytes()), Value::object(native_handle));
    }

    /// Runs `closure` (the top-level script, already wrapped as a
    /// closure) to completion.
    pub fn interpret(&mut self, closure: Handle) -> Result<(), RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.push(Value::object(closure));
        self.call_value(Value::object(closure), 0)?;
        self.run()
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // -- root marking ---------------------------------------------------

    fn mark_roots(heap: &mut Heap, frames: &[CallFrame], stack: &[Value], globals: &Table, open_upvalues: &[Handle], init_string: Handle) {
        for &value in stack {
            heap.mark_value(value);
        }
        for frame in frames {
            heap.mark_handle(frame.closure);
        }
        for &upvalue in open_upvalues {
            heap.mark_handle(upvalue);
        }
        for (_, value) in globals.iter() {
            heap.mark_value(value);
        }
        heap.mark_handle(init_string);
    }

    fn alloc(&mut self, obj: Obj) -> Handle {
        let frames = &self.frames;
        let stack = &self.stack;
        let globals = &self.globals;
        let open_upvalues = &self.open_upvalues;
        let init_string = self.init_string;
        self.heap.allocate(obj, |h| Self::mark_roots(h, frames, stack, globals, open_upvalues, init_string))
    }

    fn intern(&mut self, bytes: String) -> Handle {
        let frames = &self.frames;
        let stack = &self.stack;
        let globals = &self.globals;
        let open_upvalues = &self.open_upvalues;
        let init_string = self.init_string;
        self.heap
            .intern_string(bytes, |h| Self::mark_roots(h, frames, stack, globals, open_upvalues, init_string))
    }

    // -- runtime errors ---------------------------------------------------

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let closure = self.heap.get(frame.closure).as_closure().expect("frame closure");
            let function = self.heap.get(closure.function).as_function().expect("closure function");
            let line = function.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(-1);
            let name = function
                .name
                .map(|h| self.heap.get_string(h).to_string())
                .unwrap_or_default();
            trace.push(StackFrame { function_name: name, line });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError::new(message, trace)
    }

    // -- calling ---------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if !callee.is_object() {
            return Err(self.runtime_error("Can only call functions and classes."));
        }
        let handle = callee.as_object();
        match self.heap.get(handle) {
            Obj::Closure(_) => self.call_closure(handle, argc),
            Obj::Native(_) => self.call_native(handle, argc),
            Obj::Class(_) => self.call_class(handle, argc),
            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let base = self.stack.len() - argc - 1;
                self.stack[base] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure_handle: Handle, argc: usize) -> Result<(), RuntimeError> {
        let closure = self.heap.get(closure_handle).as_closure().expect("closure handle");
        let function_handle = closure.function;
        let arity = self.heap.get(function_handle).as_function().expect("function handle").arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, base });
        Ok(())
    }

    fn call_class(&mut self, class_handle: Handle, argc: usize) -> Result<(), RuntimeError> {
        let instance = self.alloc(Obj::Instance(ObjInstance::new(class_handle)));
        let base = self.stack.len() - argc - 1;
        self.stack[base] = Value::object(instance);
        let initializer = self
            .heap
            .get(class_handle)
            .as_class()
            .expect("class handle")
            .methods
            .get(self.init_string, fnv1a(b"init"));
        match initializer {
            Some(init) => self.call_closure(init.as_object(), argc),
            None => {
                if argc != 0 {
                    return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                }
                Ok(())
            }
        }
    }

    fn call_native(&mut self, native_handle: Handle, argc: usize) -> Result<(), RuntimeError> {
        let native = self.heap.get(native_handle).as_native().expect("native handle");
        let arity = native.arity as usize;
        let function = native.function;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        let args_start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        let result = {
            let frames = &self.frames;
            let stack = &self.stack;
            let globals = &self.globals;
            let open_upvalues = &self.open_upvalues;
            let init_string = self.init_string;
            let mut ctx = NativeCtx {
                heap: &mut self.heap,
                stdin: &mut self.stdin,
                frames,
                stack,
                globals,
                open_upvalues,
                init_string,
            };
            function(&args, &mut ctx)
        };
        match result {
            Ok(value) => {
                self.stack.truncate(args_start - 1);
                self.push(value);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn invoke(&mut self, name: Handle, hash: u32, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        if !receiver.is_object() {
            return Err(self.runtime_error("Only instances have methods."));
        }
        let receiver_handle = receiver.as_object();
        let (class_handle, field) = match self.heap.get(receiver_handle) {
            Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        if let Some(value) = field {
            let base = self.stack.len() - argc - 1;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        self.invoke_from_class(class_handle, name, hash, argc)
    }

    fn invoke_from_class(&mut self, class_handle: Handle, name: Handle, hash: u32, argc: usize) -> Result<(), RuntimeError> {
        let method = self.heap.get(class_handle).as_class().expect("class handle").methods.get(name, hash);
        match method {
            Some(method) => self.call_closure(method.as_object(), argc),
            None => {
                let method_name = self.heap.get_string(name).to_string();
                Err(self.runtime_error(format!("Undefined property '{method_name}'.")))
            }
        }
    }

    fn bind_method(&mut self, class_handle: Handle, name: Handle, hash: u32) -> Result<(), RuntimeError> {
        let method = self.heap.get(class_handle).as_class().expect("class handle").methods.get(name, hash);
        let method = match method {
            Some(m) => m,
            None => {
                let method_name = self.heap.get_string(name).to_string();
                return Err(self.runtime_error(format!("Undefined property '{method_name}'.")));
            }
        };
        let receiver = self.pop();
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method: method.as_object() }));
        self.push(Value::object(bound));
        Ok(())
    }

    // -- upvalues ---------------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> Handle {
        if let Some(pos) = self.open_upvalues.iter().position(|&h| {
            matches!(self.heap.get(h).as_upvalue(), Some(ObjUpvalue::Open { stack_index: s }) if *s == stack_index)
        }) {
            return self.open_upvalues[pos];
        }
        let handle = self.alloc(Obj::Upvalue(ObjUpvalue::Open { stack_index }));
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|&h| match self.heap.get(h).as_upvalue() {
                Some(ObjUpvalue::Open { stack_index: s }) => *s < stack_index,
                _ => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let handle = self.open_upvalues[i];
            let stack_index = match self.heap.get(handle).as_upvalue() {
                Some(ObjUpvalue::Open { stack_index }) => *stack_index,
                _ => {
                    i += 1;
                    continue;
                }
            };
            if stack_index >= from {
                let value = self.stack[stack_index];
                *self.heap.get_mut(handle).as_upvalue_mut().unwrap() = ObjUpvalue::Closed(value);
                self.open_upvalues.remove(i);
            } else {
                i += 1;
            }
        }
    }

    // -- bytecode access ---------------------------------------------------

    fn current_function(&self, frame_index: usize) -> Handle {
        let closure_handle = self.frames[frame_index].closure;
        self.heap.get(closure_handle).as_closure().expect("closure").function
    }

    fn read_byte(&mut self) -> u8 {
        let idx = self.frames.len() - 1;
        let ip = self.frames[idx].ip;
        let function = self.current_function(idx);
        let byte = self.heap.get(function).as_function().expect("function").chunk.code[ip];
        self.frames[idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        let function_idx = self.frames.len() - 1;
        let function = self.current_function(function_idx);
        self.heap.get(function).as_function().expect("function").chunk.constants[idx]
    }

    fn read_string(&mut self) -> Handle {
        self.read_constant().as_object()
    }

    // -- dispatch ----------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.stack.len() > STACK_MAX {
                return Err(self.runtime_error("Stack overflow."));
            }
            let op = match OpCode::try_from(self.read_byte()) {
                Ok(op) => op,
                Err(byte) => panic!("unreachable opcode {byte}"),
            };

            #[cfg(feature = "trace-execution")]
            tracing::trace!(?op, stack = ?self.stack, "dispatch");

            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::nil()),
                OpCode::True => self.push(Value::boolean(true)),
                OpCode::False => self.push(Value::boolean(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let idx = self.frames.len() - 1;
                    let base = self.frames[idx].base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let idx = self.frames.len() - 1;
                    let base = self.frames[idx].base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = fnv1a(self.heap.get_string(name).as_bytes());
                    match self.globals.get(name, hash) {
                        Some(v) => self.push(v),
                        None => {
                            let n = self.heap.get_string(name).to_string();
                            return Err(self.runtime_error(format!("Undefined variable '{n}'.")));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = fnv1a(self.heap.get_string(name).as_bytes());
                    let value = self.pop();
                    self.globals.set(name, hash, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = fnv1a(self.heap.get_string(name).as_bytes());
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        let n = self.heap.get_string(name).to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{n}'.")));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let idx = self.frames.len() - 1;
                    let closure = self.heap.get(self.frames[idx].closure).as_closure().unwrap();
                    let upvalue_handle = closure.upvalues[slot];
                    let value = match self.heap.get(upvalue_handle).as_upvalue().unwrap() {
                        ObjUpvalue::Closed(v) => *v,
                        ObjUpvalue::Open { stack_index } => self.stack[*stack_index],
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let idx = self.frames.len() - 1;
                    let closure = self.heap.get(self.frames[idx].closure).as_closure().unwrap();
                    let upvalue_handle = closure.upvalues[slot];
                    let value = self.peek(0);
                    let stack_index = match self.heap.get(upvalue_handle).as_upvalue().unwrap() {
                        ObjUpvalue::Closed(_) => None,
                        ObjUpvalue::Open { stack_index } => Some(*stack_index),
                    };
                    match stack_index {
                        Some(i) => self.stack[i] = value,
                        None => *self.heap.get_mut(upvalue_handle).as_upvalue_mut().unwrap() = ObjUpvalue::Closed(value),
                    }
                }
                OpCode::GetProperty => self.op_get_property()?,
                OpCode::SetProperty => self.op_set_property()?,
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let hash = fnv1a(self.heap.get_string(name).as_bytes());
                    let superclass = self.pop().as_object();
                    self.bind_method(superclass, name, hash)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(values_equal(a, b)));
                }
                OpCode::Greater => self.binary_cmp(|a, b| a > b)?,
                OpCode::Less => self.binary_cmp(|a, b| a < b)?,
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.binary_num(|a, b| a - b)?,
                OpCode::Multiply => self.binary_num(|a, b| a * b)?,
                OpCode::Divide => self.binary_num(|a, b| a / b)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::boolean(is_falsy(v)));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(self.runtime_error("Operand must be a number."));
                    }
                    let v = self.pop();
                    self.push(Value::number(-v.as_number()));
                }
                OpCode::Print => {
                    let v = self.pop();
                    let text = self.display_value(v);
                    let _ = writeln!(self.stdout, "{text}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    let idx = self.frames.len() - 1;
                    self.frames[idx].ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if is_falsy(self.peek(0)) {
                        let idx = self.frames.len() - 1;
                        self.frames[idx].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    let idx = self.frames.len() - 1;
                    self.frames[idx].ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let hash = fnv1a(self.heap.get_string(name).as_bytes());
                    let argc = self.read_byte() as usize;
                    self.invoke(name, hash, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let hash = fnv1a(self.heap.get_string(name).as_bytes());
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop().as_object();
                    self.invoke_from_class(superclass, name, hash, argc)?;
                }
                OpCode::Closure => self.op_closure(),
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let idx = self.frames.len() - 1;
                    let base = self.frames[idx].base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(ObjClass::new(name)));
                    self.push(Value::object(class));
                }
                OpCode::Inherit => self.op_inherit()?,
                OpCode::Method => self.op_method(),
            }
        }
    }

    fn op_get_property(&mut self) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        if !receiver.is_object() {
            return Err(self.runtime_error("Only instances have properties."));
        }
        let receiver_handle = receiver.as_object();
        if self.heap.get(receiver_handle).as_instance().is_none() {
            return Err(self.runtime_error("Only instances have properties."));
        }
        let name = self.read_string();
        let hash = fnv1a(self.heap.get_string(name).as_bytes());
        let (class_handle, field) = {
            let instance = self.heap.get(receiver_handle).as_instance().unwrap();
            (instance.class, instance.fields.get(name, hash))
        };
        if let Some(value) = field {
            self.pop();
            self.push(value);
            return Ok(());
        }
        self.bind_method(class_handle, name, hash)
    }

    fn op_set_property(&mut self) -> Result<(), RuntimeError> {
        let receiver = self.peek(1);
        if !receiver.is_object() {
            return Err(self.runtime_error("Only instances have fields."));
        }
        let receiver_handle = receiver.as_object();
        if self.heap.get(receiver_handle).as_instance().is_none() {
            return Err(self.runtime_error("Only instances have fields."));
        }
        let name = self.read_string();
        let hash = fnv1a(self.heap.get_string(name).as_bytes());
        let value = self.pop();
        let receiver_again = self.pop();
        let instance = self.heap.get_mut(receiver_again.as_object()).as_instance_mut().unwrap();
        instance.fields.set(name, hash, value);
        self.push(value);
        Ok(())
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.is_number() && b.is_number() {
            self.pop();
            self.pop();
            self.push(Value::number(a.as_number() + b.as_number()));
            return Ok(());
        }
        let both_strings = a.is_object()
            && b.is_object()
            && self.heap.get(a.as_object()).as_string().is_some()
            && self.heap.get(b.as_object()).as_string().is_some();
        if both_strings {
            let mut result = self.heap.get_string(a.as_object()).to_string();
            result.push_str(self.heap.get_string(b.as_object()));
            let handle = self.intern(result);
            self.pop();
            self.pop();
            self.push(Value::object(handle));
            return Ok(());
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    fn binary_num(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        self.pop();
        self.pop();
        self.push(Value::number(f(a.as_number(), b.as_number())));
        Ok(())
    }

    fn binary_cmp(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        self.pop();
        self.pop();
        self.push(Value::boolean(f(a.as_number(), b.as_number())));
        Ok(())
    }

    fn op_closure(&mut self) {
        let function_value = self.read_constant();
        let function_handle = function_value.as_object();
        let upvalue_count = self.heap.get(function_handle).as_function().unwrap().upvalue_count as usize;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let idx = self.frames.len() - 1;
                let base = self.frames[idx].base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let idx = self.frames.len() - 1;
                let enclosing = self.heap.get(self.frames[idx].closure).as_closure().unwrap();
                upvalues.push(enclosing.upvalues[index]);
            }
        }
        let mut closure = ObjClosure::new(function_handle, upvalue_count);
        closure.upvalues = upvalues;
        let handle = self.alloc(Obj::Closure(closure));
        self.push(Value::object(handle));
    }

    fn op_inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass_value = self.peek(1);
        let is_class = superclass_value.is_object() && self.heap.get(superclass_value.as_object()).as_class().is_some();
        if !is_class {
            return Err(self.runtime_error("Superclass must be a class."));
        }
        let superclass_handle = superclass_value.as_object();
        let subclass_value = self.peek(0);
        let subclass_handle = subclass_value.as_object();
        let super_methods = {
            let sup = self.heap.get(superclass_handle).as_class().unwrap();
            let mut table = Table::new();
            table.add_all(&sup.methods);
            table
        };
        self.heap.get_mut(subclass_handle).as_class_mut().unwrap().methods.add_all(&super_methods);
        self.pop();
        Ok(())
    }

    fn op_method(&mut self) {
        let name = self.read_string();
        let hash = fnv1a(self.heap.get_string(name).as_bytes());
        let method = self.pop();
        let class_handle = self.peek(0).as_object();
        self.heap.get_mut(class_handle).as_class_mut().unwrap().methods.set(name, hash, method);
    }

    fn display_value(&self, v: Value) -> String {
        if v.is_nil() {
            return "nil".to_string();
        }
        if v.is_bool() {
            return v.as_bool().to_string();
        }
        if v.is_number() {
            return format_number(v.as_number());
        }
        let handle = v.as_object();
        match self.heap.get(handle) {
            Obj::String(s) => s.bytes.clone(),
            Obj::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", self.heap.get_string(n)),
                None => "<script>".to_string(),
            },
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(c) => self.display_value(Value::object(c.function)),
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Class(c) => self.heap.get_string(c.name).to_string(),
            Obj::Instance(i) => format!("{} instance", self.heap.get_string(self.heap.get(i.class).as_class().unwrap().name)),
            Obj::BoundMethod(b) => self.display_value(Value::object(b.method)),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number the way `to_string` does: `%.0f` for values that are
/// mathematically integral (and small enough to render exactly), `%g`
/// style otherwise.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

struct NativeCtx<'a> {
    heap: &'a mut Heap,
    stdin: &'a mut dyn BufRead,
    frames: &'a [CallFrame],
    stack: &'a [Value],
    globals: &'a Table,
    open_upvalues: &'a [Handle],
    init_string: Handle,
}

impl NativeContext for NativeCtx<'_> {
    fn intern(&mut self, bytes: String) -> Value {
        let handle = self.heap.intern_string(bytes, |h| {
            Vm::mark_roots(h, self.frames, self.stack, self.globals, self.open_upvalues, self.init_string)
        });
        Value::object(handle)
    }

    fn display(&self, value: Value) -> String {
        if value.is_nil() {
            return "nil".to_string();
        }
        if value.is_bool() {
            return value.as_bool().to_string();
        }
        if value.is_number() {
            return format_number(value.as_number());
        }
        match self.heap.get(value.as_object()) {
            Obj::String(s) => s.bytes.clone(),
            Obj::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", self.heap.get_string(n)),
                None => "<script>".to_string(),
            },
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(c) => self.display(Value::object(c.function)),
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Class(c) => self.heap.get_string(c.name).to_string(),
            Obj::Instance(i) => format!("{} instance", self.heap.get_string(self.heap.get(i.class).as_class().unwrap().name)),
            Obj::BoundMethod(b) => self.display(Value::object(b.method)),
        }
    }

    fn read_line(&mut self) -> Result<String, String> {
        let mut line = String::new();
        match self.stdin.read_line(&mut line) {
            Ok(0) => Err("Unexpected end of input.".to_string()),
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                Ok(line)
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

fn native_clock(_args: &[Value], _ctx: &mut dyn NativeContext) -> Result<Value, String> {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    Ok(Value::number(start.elapsed().as_secs_f64()))
}

fn native_to_string(args: &[Value], ctx: &mut dyn NativeContext) -> Result<Value, String> {
    let v = args.first().copied().unwrap_or(Value::nil());
    let text = ctx.display(v);
    Ok(ctx.intern(text))
}

fn native_readline(_args: &[Value], ctx: &mut dyn NativeContext) -> Result<Value, String> {
    let line = ctx.read_line()?;
    Ok(ctx.intern(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{Chunk as CoreChunk, ObjFunction};

    fn script_closure(vm: &mut Vm, build: impl FnOnce(&mut CoreChunk, &mut Vm)) -> Handle {
        let mut function = ObjFunction::new(None);
        build(&mut function.chunk, vm);
        function.chunk.write_op(OpCode::Return, 1);
        let function_handle = vm.alloc(Obj::Function(function));
        vm.alloc(Obj::Closure(ObjClosure::new(function_handle, 0)))
    }

    #[test]
    fn arithmetic_precedence() {
        let mut vm = Vm::with_io(Box::new(Vec::new()), Box::new(io::Cursor::new(Vec::new())));
        let closure = script_closure(&mut vm, |chunk, vm_ref| {
            let one = chunk.add_constant(Value::number(1.0)).unwrap();
            let two = chunk.add_constant(Value::number(2.0)).unwrap();
            let three = chunk.add_constant(Value::number(3.0)).unwrap();
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(one, 1);
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(two, 1);
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(three, 1);
            chunk.write_op(OpCode::Multiply, 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_op(OpCode::Print, 1);
            let _ = vm_ref;
        });
        assert!(vm.interpret(closure).is_ok());
    }

    #[test]
    fn negating_a_bool_is_a_runtime_error() {
        let mut vm = Vm::with_io(Box::new(Vec::new()), Box::new(io::Cursor::new(Vec::new())));
        let closure = script_closure(&mut vm, |chunk, _vm| {
            chunk.write_op(OpCode::True, 1);
            chunk.write_op(OpCode::Negate, 1);
        });
        let err = vm.interpret(closure).unwrap_err();
        assert_eq!(err.message, "Operand must be a number.");
    }

    #[test]
    fn string_concatenation_interns_result() {
        let mut vm = Vm::with_io(Box::new(Vec::new()), Box::new(io::Cursor::new(Vec::new())));
        let closure = script_closure(&mut vm, |chunk, vm_ref| {
            let a = vm_ref.intern("foo".to_string());
            let b = vm_ref.intern("bar".to_string());
            let a_idx = chunk.add_constant(Value::object(a)).unwrap();
            let b_idx = chunk.add_constant(Value::object(b)).unwrap();
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(a_idx, 1);
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(b_idx, 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_op(OpCode::Print, 1);
        });
        assert!(vm.interpret(closure).is_ok());
    }

    // Source-to-bytecode end-to-end tests that exercise `Vm` together with
    // `quill_compiler::compile` live in `crates/compiler/tests/end_to_end.rs`
    // instead of here: quill-compiler depends on quill-vm, so a dev-dependency
    // from quill-vm back onto quill-compiler would make cargo build two
    // distinct copies of quill-vm (one for this crate's unit tests, one as
    // the compiler's ordinary dependency), and types like `Heap` would no
    // longer unify between them.
}
