//! Module loading end to end: `use` forms against real files.

use std::io::Write;
use std::sync::{Arc, Mutex};

use noxy_runtime::{base_session, run_source, FileModuleLoader, NoxyError, Output, Vm};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_with_root(root: &std::path::Path, source: &str) -> Result<String, NoxyError> {
    let buf = SharedBuf::default();
    let out: Output = Arc::new(Mutex::new(Box::new(buf.clone())));
    let mut vm = Vm::with_output(out);
    vm.loader = Some(FileModuleLoader::new(vec![root.to_path_buf()]));
    let mut session = base_session();
    let result = run_source(&mut vm, &mut session, source, None, false);
    vm.routines.wait_all();
    result?;
    let bytes = buf.0.lock().unwrap().clone();
    Ok(String::from_utf8(bytes).unwrap())
}

fn write_module(dir: &std::path::Path, rel: &str, source: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, source).unwrap();
}

const UTIL_NX: &str = "let base: int = 10\n\
                       func triple(n: int) -> int\n\
                       \treturn n * 3\n\
                       end\n";

#[test]
fn test_use_select_names() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "util.nx", UTIL_NX);
    let output = run_with_root(
        dir.path(),
        "use util select triple, base\nprint(triple(3))\nprint(base)\n",
    )
    .unwrap();
    assert_eq!(output, "9\n10\n");
}

#[test]
fn test_use_with_alias() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "util.nx", UTIL_NX);
    let output = run_with_root(dir.path(), "use util as u\nprint(u.triple(4))\n").unwrap();
    assert_eq!(output, "12\n");
}

#[test]
fn test_use_select_all() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "util.nx", UTIL_NX);
    let output =
        run_with_root(dir.path(), "use util select *\nprint(triple(base))\n").unwrap();
    assert_eq!(output, "30\n");
}

#[test]
fn test_dotted_module_path() {
    let dir = tempfile::tempdir().unwrap();
    write_module(
        dir.path(),
        "net/http.nx",
        "func status_line(code: int) -> string\n\treturn f\"HTTP {code}\"\nend\n",
    );
    let output = run_with_root(
        dir.path(),
        "use net.http as http\nprint(http.status_line(200))\n",
    )
    .unwrap();
    assert_eq!(output, "HTTP 200\n");
}

#[test]
fn test_module_cache_loads_once() {
    // The module's top-level print runs once even when imported twice.
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "loud.nx", "print(\"loaded\")\nlet x: int = 1\n");
    let output = run_with_root(
        dir.path(),
        "use loud as a\nuse loud as b\nprint(a.x + b.x)\n",
    )
    .unwrap();
    assert_eq!(output, "loaded\n2\n");
}

#[test]
fn test_missing_module_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = run_with_root(dir.path(), "use nothing_here\n").unwrap_err();
    assert!(err.to_string().contains("module 'nothing_here' not found"));
}

#[test]
fn test_module_runtime_error_carries_path() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "bad.nx", "print(1 / 0)\n");
    let err = run_with_root(dir.path(), "use bad\n").unwrap_err();
    let message = err.to_string();
    assert!(message.contains("bad.nx"));
    assert!(message.contains("division by zero"));
}

#[test]
fn test_circular_import_detected() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "a.nx", "use b\n");
    write_module(dir.path(), "b.nx", "use a\n");
    let err = run_with_root(dir.path(), "use a\n").unwrap_err();
    assert!(err.to_string().contains("circular import"));
}
