//! Compile-and-run orchestration shared by the CLI, the REPL, and tests.

use std::fmt;
use std::sync::Arc;

use noxy_compiler::{compile, CompileError, CompileSession, ParseError, Parser};
use noxy_core::value::{Function, Value};

use crate::builtins::NATIVE_NAMES;
use crate::error::RuntimeError;
use crate::vm::Vm;

/// Any failure on the source-to-exit path. Parse errors arrive as the
/// parser's accumulated list; compile and runtime failures are single.
#[derive(Debug)]
pub enum NoxyError {
    Parse(Vec<ParseError>),
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl fmt::Display for NoxyError {
    // One line per diagnostic, matching the CLI's stderr contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoxyError::Parse(errors) => {
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", error)?;
                }
                Ok(())
            }
            NoxyError::Compile(error) => write!(f, "{}", error),
            NoxyError::Runtime(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for NoxyError {}

/// A compiler session pre-seeded with the native function names.
pub fn base_session() -> CompileSession {
    CompileSession::with_natives(NATIVE_NAMES.iter().copied())
}

/// Parse, compile, and execute a source string on the given VM. The
/// session accumulates globals/structs so REPL lines build on each other.
pub fn run_source(
    vm: &mut Vm,
    session: &mut CompileSession,
    source: &str,
    file: Option<&str>,
    disassembly: bool,
) -> Result<(), NoxyError> {
    let program = Parser::new(source).parse().map_err(NoxyError::Parse)?;
    let script = compile(&program, session, file).map_err(NoxyError::Compile)?;
    if disassembly {
        print!("{}", disassemble_program(&script));
    }
    vm.interpret(script).map_err(NoxyError::Runtime)
}

/// Disassemble a script chunk and, recursively, every function constant.
pub fn disassemble_program(script: &Arc<Function>) -> String {
    let mut out = String::new();
    let mut pending = vec![Arc::clone(script)];
    while let Some(function) = pending.pop() {
        out.push_str(&function.chunk.disassemble(&function.name));
        for constant in &function.chunk.constants {
            if let Value::Function(inner) = constant {
                pending.push(Arc::clone(inner));
            }
        }
    }
    out
}
