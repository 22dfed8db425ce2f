//! Compiler front end for the Noxy language.
//!
//! The pipeline is lexer → parser → single-pass bytecode compiler:
//!
//! ```text
//! source ──tokenize──▶ tokens ──parse──▶ AST ──compile──▶ Chunk
//! ```
//!
//! [`Parser`] accumulates `[line:col]` diagnostics and recovers at
//! newlines; [`compile`] fails fast with a `[line N]` message. Both feed
//! off a [`CompileSession`] so REPL lines and module loads share global
//! types and struct definitions.

pub mod ast;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod types;

pub use compiler::{compile, CompileError, CompileSession, StructInfo};
pub use lexer::{tokenize, Lexer};
pub use parser::{ParseError, Parser};
pub use types::Type;
