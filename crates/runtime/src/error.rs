//! Runtime error type.

use std::fmt;

/// A runtime failure with the source line it surfaced on and the call
/// stack at that point (innermost frame first).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub trace: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        RuntimeError {
            message: message.into(),
            line,
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.message)?;
        for frame in &self.trace {
            write!(f, "\n    {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
