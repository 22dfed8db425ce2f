//! Noxy CLI
//!
//! `noxy <script.nx>` compiles and runs a script (exit 0 on success, 1 on
//! any parse/compile/runtime error, diagnostics on stderr). With no
//! arguments it starts the REPL. `--disassembly` prints each compiled
//! chunk before execution; `--get` fetches a git-hosted dependency into
//! `noxy_libs/` and records it in `noxy.mod`.

mod manifest;
mod pkg;
mod repl;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser as ClapParser;
use tracing_subscriber::EnvFilter;

use noxy_runtime::{base_session, run_source, FileModuleLoader, Vm};

#[derive(ClapParser)]
#[command(name = "noxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Noxy programming language", long_about = None)]
struct Cli {
    /// Script to compile and run; omit to start the REPL
    script: Option<PathBuf>,

    /// Print compiled bytecode before execution
    #[arg(long)]
    disassembly: bool,

    /// Fetch a git dependency (repo[@version]) into noxy_libs/
    #[arg(long, value_name = "REPO[@VERSION]")]
    get: Option<String>,
}

fn main() {
    let filter = EnvFilter::try_from_env("NOXY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(spec) = cli.get {
        if let Err(e) = pkg::get(&spec) {
            eprintln!("error: {}", e);
            process::exit(1);
        }
        return;
    }

    let code = match cli.script {
        Some(path) => {
            // Host panics are a safety net here, not control flow: report
            // and exit non-zero instead of aborting mid-line.
            match catch_unwind(AssertUnwindSafe(|| run_script(&path, cli.disassembly))) {
                Ok(code) => code,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<String>()
                        .map(String::as_str)
                        .or_else(|| panic.downcast_ref::<&str>().copied())
                        .unwrap_or("unknown panic");
                    eprintln!("error: internal panic: {}", message);
                    1
                }
            }
        }
        None => repl::run(),
    };
    process::exit(code);
}

fn run_script(path: &Path, disassembly: bool) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: {}: {}", path.display(), e);
            return 1;
        }
    };

    let mut vm = Vm::new();
    vm.loader = Some(FileModuleLoader::for_script(Some(path)));
    let mut session = base_session();

    match run_source(
        &mut vm,
        &mut session,
        &source,
        path.to_str(),
        disassembly,
    ) {
        Ok(()) => {
            vm.routines.wait_all();
            0
        }
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    }
}
