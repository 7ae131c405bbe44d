//! Error types raised while running (as opposed to compiling) a program.

use std::fmt;

/// A single entry of the call stack captured when a runtime error occurs,
/// innermost frame first.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function_name: String,
    pub line: i32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.function_name.is_empty() {
            write!(f, "[line {}] in script", self.line)
        } else {
            write!(f, "[line {}] in {}()", self.line, self.function_name)
        }
    }
}

/// A runtime fault: a type error, an undefined variable, a native function
/// failure, or stack overflow, paired with the call stack active when it
/// was raised.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub stack_trace: Vec<StackFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, stack_trace: Vec<StackFrame>) -> Self {
        RuntimeError {
            message: message.into(),
            stack_trace,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.stack_trace {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
