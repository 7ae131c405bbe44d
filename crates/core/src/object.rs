//! Heap object variants.
//!
//! Every object that lives on the VM's heap is one variant of [`Obj`]. The
//! heap itself (allocation, marking, sweeping) is owned by `quill-vm`; this
//! crate only describes the shape of what gets stored. A [`Handle`] is an
//! index into that heap's slot arena rather than a raw pointer, so moving
//! the heap around (or running under Miri) never invalidates object
//! identity.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// A reference to a heap-allocated object.
///
/// Carries a generation counter alongside the slot index so a stale handle
/// (held past a sweep that freed and reused its slot) can be detected rather
/// than silently aliasing an unrelated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

impl Handle {
    pub fn new(index: u32, generation: u32) -> Self {
        Handle { index, generation }
    }
}

/// A heap-allocated UTF-8 string, interned by content.
///
/// The hash is computed once at construction and reused by the hash table
/// and by the intern table's lookup so equal strings never rehash their
/// bytes.
#[derive(Debug, Clone)]
pub struct ObjString {
    pub bytes: String,
    pub hash: u32,
}

impl ObjString {
    pub fn new(bytes: String) -> Self {
        let hash = fnv1a(bytes.as_bytes());
        ObjString { bytes, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.bytes
    }
}

/// 32-bit FNV-1a, used to hash every interned string exactly once.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A compiled function: its arity, its own chunk of bytecode, and how many
/// upvalues its closures must capture.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<Handle>,
}

impl ObjFunction {
    pub fn new(name: Option<Handle>) -> Self {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

/// Everything a native function needs from the outside world that it has
/// no other way to reach: the heap, for interning a freshly built string
/// or rendering an arbitrary value to text, and the host's input stream.
/// Implemented by the VM; this crate only describes the seam.
pub trait NativeContext {
    fn intern(&mut self, bytes: String) -> Value;
    fn display(&self, value: Value) -> String;
    fn read_line(&mut self) -> Result<String, String>;
}

/// Signature for a host (native) function: receives its arguments and a
/// context for reaching the heap, and returns either a value or an error
/// message. Failure is reported via `Err`, matching the "success-out
/// parameter" contract in the spec rather than panicking across the call
/// boundary.
pub type NativeFn = fn(&[Value], &mut dyn NativeContext) -> Result<Value, String>;

pub struct ObjNative {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative").field("name", &self.name).finish()
    }
}

/// A function paired with its captured environment.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

impl ObjClosure {
    pub fn new(function: Handle, upvalue_count: usize) -> Self {
        ObjClosure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }
}

/// Either "open" (aliases a live slot on the value stack) or "closed"
/// (owns its value after the frame that created it has returned).
///
/// `location` is a stack index rather than a raw pointer: the contract in
/// the spec is satisfied either way, and an index survives the value
/// stack being stored in a plain growable `Vec`.
#[derive(Debug, Clone, Copy)]
pub enum ObjUpvalue {
    Open { stack_index: usize },
    Closed(Value),
}

/// A class: its name and its own (non-inherited-and-copied-in) method
/// table. Methods are stored as `Value::Object` closures so the table can
/// be shared verbatim with instance field lookup.
#[derive(Debug)]
pub struct ObjClass {
    pub name: Handle,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: Handle) -> Self {
        ObjClass {
            name,
            methods: Table::new(),
        }
    }
}

/// An instance of a class: its own field table plus a reference to the
/// class that was used to construct it.
#[derive(Debug)]
pub struct ObjInstance {
    pub class: Handle,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: Handle) -> Self {
        ObjInstance {
            class,
            fields: Table::new(),
        }
    }
}

/// A method pre-bound to the receiver it was looked up on.
#[derive(Debug, Clone, Copy)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: Handle,
}

/// The sum type stored behind every [`Handle`].
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native fn",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        match self {
            Obj::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut ObjFunction> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        match self {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&ObjUpvalue> {
        match self {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_upvalue_mut(&mut self) -> Option<&mut ObjUpvalue> {
        match self {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut ObjClass> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut ObjInstance> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        match self {
            Obj::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&ObjNative> {
        match self {
            Obj::Native(n) => Some(n),
            _ => None,
        }
    }
}
