//! File-backed module loader.
//!
//! `use net.http` resolves the dotted name against the loader's search
//! roots (the importing script's directory, the working directory, and
//! `noxy_libs/`), trying `net/http.nx` and then `net/http/mod.nx`. The
//! module compiles and runs in a fresh compiler session and VM with its
//! own globals; its resulting global table (minus the pre-installed
//! natives) becomes the exported module map. Errors are wrapped with the
//! originating path.
//!
//! The VM's module cache deduplicates loads; this loader only guards
//! against import cycles.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use noxy_compiler::{compile, CompileSession, Parser};
use noxy_core::value::{MapKey, Value};

use crate::builtins::NATIVE_NAMES;
use crate::vm::{ModuleLoader, Vm};

pub struct FileModuleLoader {
    roots: Vec<PathBuf>,
    /// Modules currently being loaded, for cycle detection.
    loading: Mutex<HashSet<String>>,
}

impl FileModuleLoader {
    pub fn new(roots: Vec<PathBuf>) -> Arc<Self> {
        Arc::new(FileModuleLoader {
            roots,
            loading: Mutex::new(HashSet::new()),
        })
    }

    /// Search roots for a script at `script_path`: its directory, the
    /// working directory, and `noxy_libs/` under each.
    pub fn for_script(script_path: Option<&Path>) -> Arc<Self> {
        let mut roots = Vec::new();
        if let Some(dir) = script_path.and_then(Path::parent) {
            roots.push(dir.to_path_buf());
            roots.push(dir.join("noxy_libs"));
        }
        if let Ok(cwd) = std::env::current_dir() {
            roots.push(cwd.clone());
            roots.push(cwd.join("noxy_libs"));
        }
        Self::new(roots)
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let rel = name.replace('.', "/");
        for root in &self.roots {
            let file = root.join(format!("{}.nx", rel));
            if file.is_file() {
                return Some(file);
            }
            let dir_entry = root.join(&rel).join("mod.nx");
            if dir_entry.is_file() {
                return Some(dir_entry);
            }
        }
        None
    }

    fn load_file(&self, name: &str, path: &Path, vm: &Vm) -> Result<Value, String> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| format!("module '{}' ({}): {}", name, path.display(), e))?;

        let program = Parser::new(&source).parse().map_err(|errors| {
            let mut message = format!("module '{}' ({}):", name, path.display());
            for error in errors {
                message.push_str("\n  ");
                message.push_str(&error.to_string());
            }
            message
        })?;

        let mut session = CompileSession::with_natives(NATIVE_NAMES.iter().copied());
        let script = compile(&program, &mut session, path.to_str())
            .map_err(|e| format!("module '{}' ({}): {}", name, path.display(), e))?;

        let mut module_vm = vm.fork_for_module();
        module_vm
            .interpret(script)
            .map_err(|e| format!("module '{}' ({}): {}", name, path.display(), e))?;

        // Export the module's globals, minus the pre-installed natives.
        let natives: HashSet<&str> = NATIVE_NAMES.iter().copied().collect();
        let globals = module_vm
            .globals
            .lock()
            .expect("module globals lock poisoned");
        let mut exports = HashMap::new();
        for (key, value) in globals.iter() {
            if natives.contains(key.as_str()) && matches!(value, Value::Native(_)) {
                continue;
            }
            exports.insert(MapKey::Str(key.as_str().into()), value.clone());
        }
        Ok(Value::map(exports))
    }
}

impl ModuleLoader for FileModuleLoader {
    fn load(&self, name: &str, vm: &Vm) -> Result<Value, String> {
        let Some(path) = self.resolve(name) else {
            return Err(format!("module '{}' not found", name));
        };
        {
            let mut loading = self.loading.lock().expect("module loading set poisoned");
            if !loading.insert(name.to_string()) {
                return Err(format!("circular import of module '{}'", name));
            }
        }
        tracing::debug!(module = name, path = %path.display(), "compiling module");
        let result = self.load_file(name, &path, vm);
        self.loading
            .lock()
            .expect("module loading set poisoned")
            .remove(name);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_for_script_resolves_from_working_directory() {
        // for_script falls back to the working directory, which is
        // process-global state; serialize with the other cwd test.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cwdmod.nx"), "let z: int = 3\n").unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let loader = FileModuleLoader::for_script(None);
        let resolved = loader.resolve("cwdmod");
        std::env::set_current_dir(&original).unwrap();

        let resolved = resolved.expect("module resolved from the working directory");
        assert!(resolved.ends_with("cwdmod.nx"));
    }

    #[test]
    #[serial]
    fn test_for_script_searches_noxy_libs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("noxy_libs")).unwrap();
        std::fs::write(
            dir.path().join("noxy_libs/vendored.nx"),
            "let v: int = 1\n",
        )
        .unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let loader = FileModuleLoader::for_script(None);
        let resolved = loader.resolve("vendored");
        std::env::set_current_dir(&original).unwrap();

        let resolved = resolved.expect("module resolved from noxy_libs");
        assert!(resolved.ends_with("noxy_libs/vendored.nx"));
    }

    #[test]
    fn test_resolve_prefers_file_over_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("util.nx"), "let x: int = 1\n").unwrap();
        std::fs::create_dir_all(dir.path().join("util")).unwrap();
        std::fs::write(dir.path().join("util/mod.nx"), "let y: int = 2\n").unwrap();

        let loader = FileModuleLoader::new(vec![dir.path().to_path_buf()]);
        let resolved = loader.resolve("util").unwrap();
        assert_eq!(resolved, dir.path().join("util.nx"));
    }

    #[test]
    fn test_resolve_dotted_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/http.nx"), "let x: int = 1\n").unwrap();

        let loader = FileModuleLoader::new(vec![dir.path().to_path_buf()]);
        let resolved = loader.resolve("net.http").unwrap();
        assert_eq!(resolved, dir.path().join("net/http.nx"));
    }

    #[test]
    fn test_missing_module() {
        let loader = FileModuleLoader::new(vec![]);
        let vm = Vm::new();
        let err = loader.load("nope", &vm).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_load_exports_globals() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mathx.nx"),
            "let tau: float = 6.28\nfunc double(n: int) -> int\nreturn n * 2\nend\n",
        )
        .unwrap();

        let loader = FileModuleLoader::new(vec![dir.path().to_path_buf()]);
        let vm = Vm::new();
        let module = loader.load("mathx", &vm).unwrap();
        let Value::Map(entries) = &module else {
            panic!("expected module map");
        };
        let entries = entries.lock().unwrap();
        assert!(entries.contains_key(&MapKey::Str("tau".into())));
        assert!(entries.contains_key(&MapKey::Str("double".into())));
        // Natives are not re-exported.
        assert!(!entries.contains_key(&MapKey::Str("print".into())));
    }

    #[test]
    fn test_module_error_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.nx"), "let x = 1\n").unwrap();

        let loader = FileModuleLoader::new(vec![dir.path().to_path_buf()]);
        let vm = Vm::new();
        let err = loader.load("broken", &vm).unwrap_err();
        assert!(err.contains("broken.nx"));
        assert!(err.contains("missing type annotation"));
    }
}
