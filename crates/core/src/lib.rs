//! Core runtime primitives for the Noxy language.
//!
//! This crate holds the pieces shared by the compiler and the VM:
//! the runtime [`Value`] model, the bytecode [`Chunk`] and its
//! [`OpCode`] set, and the CSP conduits ([`Channel`], [`WaitGroup`])
//! that back Noxy's routines.
//!
//! Nothing in here executes bytecode; the VM lives in `noxy-runtime`
//! and the lexer/parser/compiler in `noxy-compiler`.

pub mod channel;
pub mod chunk;
pub mod value;
pub mod waitgroup;

pub use channel::{Channel, SelectWaker, TryRecv, TrySend};
pub use chunk::{Chunk, OpCode};
pub use value::{
    Closure, Function, Globals, Instance, MapKey, RefTarget, StructShape, UpvalueCell,
    UpvalueState, Value,
};
pub use waitgroup::WaitGroup;

/// Maximum depth of a routine's value stack.
pub const STACK_MAX: usize = 2048;

/// Maximum depth of a routine's call-frame stack.
pub const FRAMES_MAX: usize = 64;
