//! Out-of-process plugin host.
//!
//! A plugin is an executable the VM spawns and talks to over stdio, one
//! JSON object per line. Request: `{"method": string, "params": [...]}`.
//! Response: `{"result": ...}` on success or `{"error": string}` on
//! failure. Values map as in the JSON natives; bytes travel as
//! hex-encoded strings.
//!
//! Calls are serialized per host: the registry lock is held for the
//! duration of a call, which keeps request/response lines paired without
//! any framing beyond newlines.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use noxy_core::value::Value;
use serde_json::{json, Value as Json};

use crate::json::{json_to_value, value_to_json};

struct PluginProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[derive(Default)]
pub struct PluginHost {
    plugins: Mutex<HashMap<i64, PluginProcess>>,
    next_handle: AtomicI64,
}

impl PluginHost {
    pub fn new() -> Self {
        PluginHost {
            plugins: Mutex::new(HashMap::new()),
            next_handle: AtomicI64::new(1),
        }
    }

    /// Spawn a plugin executable with piped stdio; returns its handle.
    pub fn open(&self, path: &str) -> Result<i64, String> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| format!("plugin_open: {}: {}", path, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "plugin_open: could not open plugin stdin".to_string())?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| "plugin_open: could not open plugin stdout".to_string())?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.plugins
            .lock()
            .expect("plugin registry lock poisoned")
            .insert(
                handle,
                PluginProcess {
                    child,
                    stdin,
                    stdout,
                },
            );
        tracing::debug!(path, handle, "plugin spawned");
        Ok(handle)
    }

    /// Send one request and read one response line.
    pub fn call(&self, handle: i64, method: &str, params: &[Value]) -> Result<Value, String> {
        let mut registry = self
            .plugins
            .lock()
            .expect("plugin registry lock poisoned");
        let plugin = registry
            .get_mut(&handle)
            .ok_or_else(|| format!("plugin_call: unknown plugin handle {}", handle))?;

        let mut encoded = Vec::with_capacity(params.len());
        for param in params {
            encoded.push(value_to_json(param).map_err(|e| format!("plugin_call: {}", e))?);
        }
        let request = json!({ "method": method, "params": encoded });
        writeln!(plugin.stdin, "{}", request)
            .map_err(|e| format!("plugin_call: write failed: {}", e))?;
        plugin
            .stdin
            .flush()
            .map_err(|e| format!("plugin_call: flush failed: {}", e))?;

        let mut line = String::new();
        let read = plugin
            .stdout
            .read_line(&mut line)
            .map_err(|e| format!("plugin_call: read failed: {}", e))?;
        if read == 0 {
            return Err("plugin_call: plugin closed its pipe".to_string());
        }

        let response: Json = serde_json::from_str(line.trim_end())
            .map_err(|e| format!("plugin_call: malformed response: {}", e))?;
        if let Some(error) = response.get("error") {
            let message = error.as_str().unwrap_or("unknown plugin error");
            return Err(format!("plugin_call: {}", message));
        }
        Ok(response
            .get("result")
            .map(json_to_value)
            .unwrap_or(Value::Null))
    }

    /// Kill and forget a plugin.
    pub fn close(&self, handle: i64) -> Result<(), String> {
        let mut registry = self
            .plugins
            .lock()
            .expect("plugin registry lock poisoned");
        let mut plugin = registry
            .remove(&handle)
            .ok_or_else(|| format!("plugin_close: unknown plugin handle {}", handle))?;
        drop(plugin.stdin);
        let _ = plugin.child.kill();
        let _ = plugin.child.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_handle() {
        let host = PluginHost::new();
        assert!(host.call(99, "ping", &[]).is_err());
        assert!(host.close(99).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_call_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        // A plugin that answers every request with a fixed result.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answer_plugin.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\nwhile read line; do\n  echo '{\"result\": 42}'\ndone\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let host = PluginHost::new();
        let handle = host.open(path.to_str().unwrap()).unwrap();
        let result = host.call(handle, "ping", &[Value::Int(1)]).unwrap();
        assert_eq!(result, Value::Int(42));
        host.close(handle).unwrap();
    }
}
