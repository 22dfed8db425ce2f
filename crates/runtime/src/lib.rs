//! Runtime for the Noxy language.
//!
//! The centerpiece is the stack [`Vm`]: a bytecode interpreter with call
//! frames, closure upvalues, first-class references, and a `when`
//! multi-channel select. Around it live the routine scheduler (host
//! threads sharing globals), the native function registry, string/JSON
//! formatting, the file module loader, and the out-of-process plugin
//! host.
//!
//! Typical embedding:
//!
//! ```no_run
//! use noxy_runtime::{script, Vm};
//!
//! let mut vm = Vm::new();
//! let mut session = script::base_session();
//! script::run_source(&mut vm, &mut session, "print(1 + 2)\n", None, false).unwrap();
//! vm.routines.wait_all();
//! ```

pub mod builtins;
pub mod error;
pub mod format;
pub mod json;
pub mod modules;
pub mod plugin;
pub mod routines;
pub mod script;
pub mod vm;

pub use error::RuntimeError;
pub use modules::FileModuleLoader;
pub use routines::Routines;
pub use script::{base_session, run_source, NoxyError};
pub use vm::{ModuleLoader, NativeFn, Output, Vm};
