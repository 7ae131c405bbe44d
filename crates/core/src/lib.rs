//! Core data structures shared by the compiler and the VM: the `Value`
//! representation, the heap object model, bytecode chunks, and the
//! open-addressed hash table used for globals, methods and fields.
//!
//! Allocation, string interning and garbage collection all live in
//! `quill-vm`, which owns the heap these types describe.

pub mod chunk;
#[cfg(feature = "nanbox")]
pub mod nanbox;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode, MAX_CONSTANTS, MAX_JUMP};
pub use object::{
    fnv1a, Handle, NativeContext, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure,
    ObjFunction, ObjInstance, ObjNative, ObjString, ObjUpvalue,
};
pub use table::Table;
pub use value::{is_falsy, values_equal, Value};
