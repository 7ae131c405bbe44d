//! Compiles source text into a bytecode function the VM can run directly,
//! in a single left-to-right pass with no intermediate AST.

pub mod compiler;
pub mod disassemble;
pub mod error;
pub mod scanner;

pub use compiler::compile;
pub use error::CompileError;
