//! Native function registry.
//!
//! Natives are installed once at interpreter startup: the table maps a
//! name to a host function, and the globals table gets a `Value::Native`
//! entry per name so ordinary `GetGlobal` resolution finds them. The
//! table is read-only after startup.
//!
//! Error convention: messages are prefixed with the native's name
//! ("make_chan: capacity must be non-negative"), and the VM wraps them
//! with the current source line.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use noxy_core::channel::Channel;
use noxy_core::value::{MapKey, Value};
use noxy_core::waitgroup::WaitGroup;

use crate::format;
use crate::json;
use crate::vm::{NativeFn, Vm};

/// Build the native table. Keep [`NATIVE_NAMES`] in sync; the compiler
/// session is seeded from it.
pub fn native_table() -> HashMap<&'static str, NativeFn> {
    let mut table: HashMap<&'static str, NativeFn> = HashMap::new();
    table.insert("print", native_print);
    table.insert("len", native_len);
    table.insert("keys", native_keys);
    table.insert("push", native_push);
    table.insert("pop", native_pop);
    table.insert("to_str", native_to_str);
    table.insert("to_int", native_to_int);
    table.insert("to_float", native_to_float);
    table.insert("type_of", native_type_of);
    table.insert("fmt", native_fmt);
    table.insert("read_file", native_read_file);
    table.insert("write_file", native_write_file);
    table.insert("time_ms", native_time_ms);
    table.insert("sleep", native_sleep);
    table.insert("spawn", native_spawn);
    table.insert("make_chan", native_make_chan);
    table.insert("chan_send", native_chan_send);
    table.insert("chan_recv", native_chan_recv);
    table.insert("chan_close", native_chan_close);
    table.insert("chan_is_closed", native_chan_is_closed);
    table.insert("make_wg", native_make_wg);
    table.insert("wg_add", native_wg_add);
    table.insert("wg_done", native_wg_done);
    table.insert("wg_wait", native_wg_wait);
    table.insert("json_parse", native_json_parse);
    table.insert("json_dumps", native_json_dumps);
    table.insert("plugin_open", native_plugin_open);
    table.insert("plugin_call", native_plugin_call);
    table.insert("plugin_close", native_plugin_close);
    table
}

/// Every native name, for seeding compiler sessions.
pub const NATIVE_NAMES: &[&str] = &[
    "print",
    "len",
    "keys",
    "push",
    "pop",
    "to_str",
    "to_int",
    "to_float",
    "type_of",
    "fmt",
    "read_file",
    "write_file",
    "time_ms",
    "sleep",
    "spawn",
    "make_chan",
    "chan_send",
    "chan_recv",
    "chan_close",
    "chan_is_closed",
    "make_wg",
    "wg_add",
    "wg_done",
    "wg_wait",
    "json_parse",
    "json_dumps",
    "plugin_open",
    "plugin_call",
    "plugin_close",
];

fn expect_arity(name: &str, args: &[Value], n: usize) -> Result<(), String> {
    if args.len() != n {
        return Err(format!(
            "{} expects {} argument{}, got {}",
            name,
            n,
            if n == 1 { "" } else { "s" },
            args.len()
        ));
    }
    Ok(())
}

/// Render an argument for user-facing output, seeing through references.
fn render_arg(vm: &Vm, value: &Value) -> Result<String, String> {
    let value = vm.deref_value(value.clone())?;
    Ok(format::render(&value))
}

fn chan_arg(name: &str, value: &Value) -> Result<Arc<Channel>, String> {
    match value {
        Value::Channel(chan) => Ok(Arc::clone(chan)),
        other => Err(format!(
            "{} expects a channel, got {}",
            name,
            other.type_name()
        )),
    }
}

fn wg_arg(name: &str, value: &Value) -> Result<Arc<WaitGroup>, String> {
    match value {
        Value::WaitGroup(wg) => Ok(Arc::clone(wg)),
        other => Err(format!(
            "{} expects a wait group, got {}",
            name,
            other.type_name()
        )),
    }
}

fn int_arg(name: &str, value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(format!("{} expects an int, got {}", name, other.type_name())),
    }
}

// ----------------------------------------------------------------------
// Output and conversions
// ----------------------------------------------------------------------

fn native_print(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let mut rendered = Vec::with_capacity(args.len());
    for arg in &args {
        rendered.push(render_arg(vm, arg)?);
    }
    let mut out = vm.out.lock().expect("output lock poisoned");
    writeln!(out, "{}", rendered.join(" ")).map_err(|e| format!("print: {}", e))?;
    out.flush().map_err(|e| format!("print: {}", e))?;
    Ok(Value::Null)
}

fn native_to_str(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("to_str", &args, 1)?;
    Ok(Value::string(render_arg(vm, &args[0])?))
}

fn native_to_int(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("to_int", &args, 1)?;
    let value = vm.deref_value(args[0].clone())?;
    match value {
        Value::Int(n) => Ok(Value::Int(n)),
        Value::Float(x) => Ok(Value::Int(x as i64)),
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("to_int: cannot convert '{}'", s)),
        other => Err(format!("to_int: cannot convert {}", other.type_name())),
    }
}

fn native_to_float(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("to_float", &args, 1)?;
    let value = vm.deref_value(args[0].clone())?;
    match value {
        Value::Int(n) => Ok(Value::Float(n as f64)),
        Value::Float(x) => Ok(Value::Float(x)),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("to_float: cannot convert '{}'", s)),
        other => Err(format!("to_float: cannot convert {}", other.type_name())),
    }
}

fn native_type_of(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("type_of", &args, 1)?;
    let value = vm.deref_value(args[0].clone())?;
    Ok(Value::string(value.type_name()))
}

fn native_fmt(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    if args.is_empty() {
        return Err("fmt expects a format string".to_string());
    }
    let template = match vm.deref_value(args[0].clone())? {
        Value::Str(s) => s,
        other => {
            return Err(format!(
                "fmt expects a format string, got {}",
                other.type_name()
            ))
        }
    };
    let mut rest = Vec::with_capacity(args.len() - 1);
    for arg in &args[1..] {
        rest.push(vm.deref_value(arg.clone())?);
    }
    format::format(&template, &rest).map(Value::string)
}

// ----------------------------------------------------------------------
// Collections
// ----------------------------------------------------------------------

fn native_len(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("len", &args, 1)?;
    let value = vm.deref_value(args[0].clone())?;
    let len = match &value {
        Value::Array(items) => items.lock().expect("array lock poisoned").len(),
        Value::Map(entries) => entries.lock().expect("map lock poisoned").len(),
        Value::Str(s) => s.chars().count(),
        Value::Bytes(data) => data.lock().expect("bytes lock poisoned").len(),
        other => {
            return Err(format!(
                "len expects a collection, got {}",
                other.type_name()
            ))
        }
    };
    Ok(Value::Int(len as i64))
}

fn native_keys(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("keys", &args, 1)?;
    let value = vm.deref_value(args[0].clone())?;
    let Value::Map(entries) = &value else {
        return Err(format!("keys expects a map, got {}", value.type_name()));
    };
    let entries = entries.lock().expect("map lock poisoned");
    let mut keys: Vec<MapKey> = entries.keys().cloned().collect();
    // Deterministic iteration order: ints first, then strings, each sorted.
    keys.sort_by(|a, b| match (a, b) {
        (MapKey::Int(x), MapKey::Int(y)) => x.cmp(y),
        (MapKey::Str(x), MapKey::Str(y)) => x.cmp(y),
        (MapKey::Int(_), MapKey::Str(_)) => std::cmp::Ordering::Less,
        (MapKey::Str(_), MapKey::Int(_)) => std::cmp::Ordering::Greater,
    });
    Ok(Value::array(keys.iter().map(MapKey::to_value).collect()))
}

fn native_push(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("push", &args, 2)?;
    let target = vm.deref_value(args[0].clone())?;
    let Value::Array(items) = &target else {
        return Err(format!("push expects an array, got {}", target.type_name()));
    };
    items
        .lock()
        .expect("array lock poisoned")
        .push(args[1].clone());
    Ok(target.clone())
}

fn native_pop(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("pop", &args, 1)?;
    let target = vm.deref_value(args[0].clone())?;
    let Value::Array(items) = &target else {
        return Err(format!("pop expects an array, got {}", target.type_name()));
    };
    let popped = items
        .lock()
        .expect("array lock poisoned")
        .pop()
        .ok_or_else(|| "pop: empty array".to_string());
    popped
}

// ----------------------------------------------------------------------
// Files and time
// ----------------------------------------------------------------------

fn native_read_file(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("read_file", &args, 1)?;
    let path = match vm.deref_value(args[0].clone())? {
        Value::Str(s) => s,
        other => {
            return Err(format!(
                "read_file expects a path string, got {}",
                other.type_name()
            ))
        }
    };
    std::fs::read_to_string(&*path)
        .map(Value::string)
        .map_err(|e| format!("read_file: {}: {}", path, e))
}

fn native_write_file(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("write_file", &args, 2)?;
    let path = match vm.deref_value(args[0].clone())? {
        Value::Str(s) => s,
        other => {
            return Err(format!(
                "write_file expects a path string, got {}",
                other.type_name()
            ))
        }
    };
    let data = match vm.deref_value(args[1].clone())? {
        Value::Str(s) => s.as_bytes().to_vec(),
        Value::Bytes(b) => b.lock().expect("bytes lock poisoned").clone(),
        other => {
            return Err(format!(
                "write_file expects a string or bytes, got {}",
                other.type_name()
            ))
        }
    };
    std::fs::write(&*path, data).map_err(|e| format!("write_file: {}: {}", path, e))?;
    Ok(Value::Null)
}

fn native_time_ms(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("time_ms", &args, 0)?;
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| format!("time_ms: {}", e))?
        .as_millis();
    Ok(Value::Int(millis as i64))
}

fn native_sleep(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("sleep", &args, 1)?;
    let ms = int_arg("sleep", &vm.deref_value(args[0].clone())?)?;
    if ms < 0 {
        return Err(format!("sleep: duration must be non-negative, got {}", ms));
    }
    std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    Ok(Value::Null)
}

// ----------------------------------------------------------------------
// Concurrency
// ----------------------------------------------------------------------

fn native_spawn(vm: &mut Vm, mut args: Vec<Value>) -> Result<Value, String> {
    if args.is_empty() {
        return Err("spawn expects a function and its arguments".to_string());
    }
    let callee = args.remove(0);
    if !matches!(callee, Value::Closure(_) | Value::Function(_) | Value::Native(_)) {
        return Err(format!(
            "spawn expects a function, got {}",
            callee.type_name()
        ));
    }
    let mut routine = vm.fork_for_routine();
    vm.routines.spawn(move || {
        if let Err(err) = routine.run_callable(callee, args) {
            eprintln!("routine error: {}", err);
        }
    });
    Ok(Value::Null)
}

fn native_make_chan(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("make_chan", &args, 1)?;
    let capacity = int_arg("make_chan", &args[0])?;
    if capacity < 0 {
        return Err(format!(
            "make_chan: capacity must be non-negative, got {}",
            capacity
        ));
    }
    Ok(Value::Channel(Channel::new(capacity as usize)))
}

fn native_chan_send(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("chan_send", &args, 2)?;
    let chan = chan_arg("chan_send", &vm.deref_value(args[0].clone())?)?;
    chan.send(args[1].clone())
        .map_err(|_| "chan_send: channel is closed".to_string())?;
    Ok(Value::Null)
}

fn native_chan_recv(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("chan_recv", &args, 1)?;
    let chan = chan_arg("chan_recv", &vm.deref_value(args[0].clone())?)?;
    // A closed, drained channel yields null rather than an error.
    Ok(chan.recv().unwrap_or(Value::Null))
}

fn native_chan_close(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("chan_close", &args, 1)?;
    let chan = chan_arg("chan_close", &vm.deref_value(args[0].clone())?)?;
    chan.close();
    Ok(Value::Null)
}

fn native_chan_is_closed(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("chan_is_closed", &args, 1)?;
    let chan = chan_arg("chan_is_closed", &vm.deref_value(args[0].clone())?)?;
    Ok(Value::Bool(chan.is_closed()))
}

fn native_make_wg(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("make_wg", &args, 0)?;
    Ok(Value::WaitGroup(WaitGroup::new()))
}

fn native_wg_add(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("wg_add", &args, 2)?;
    let wg = wg_arg("wg_add", &vm.deref_value(args[0].clone())?)?;
    let n = int_arg("wg_add", &vm.deref_value(args[1].clone())?)?;
    wg.add(n).map_err(|e| format!("wg_add: {}", e))?;
    Ok(Value::Null)
}

fn native_wg_done(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("wg_done", &args, 1)?;
    let wg = wg_arg("wg_done", &vm.deref_value(args[0].clone())?)?;
    wg.done().map_err(|e| format!("wg_done: {}", e))?;
    Ok(Value::Null)
}

fn native_wg_wait(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("wg_wait", &args, 1)?;
    let wg = wg_arg("wg_wait", &vm.deref_value(args[0].clone())?)?;
    wg.wait();
    Ok(Value::Null)
}

// ----------------------------------------------------------------------
// JSON
// ----------------------------------------------------------------------

fn native_json_parse(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("json_parse", &args, 1)?;
    match vm.deref_value(args[0].clone())? {
        Value::Str(s) => json::parse(&s),
        other => Err(format!(
            "json_parse expects a string, got {}",
            other.type_name()
        )),
    }
}

fn native_json_dumps(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("json_dumps", &args, 1)?;
    let value = vm.deref_value(args[0].clone())?;
    json::dumps(&value).map(Value::string)
}

// ----------------------------------------------------------------------
// Plugins
// ----------------------------------------------------------------------

fn native_plugin_open(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("plugin_open", &args, 1)?;
    match vm.deref_value(args[0].clone())? {
        Value::Str(path) => vm.plugins.open(&path).map(Value::Int),
        other => Err(format!(
            "plugin_open expects a path string, got {}",
            other.type_name()
        )),
    }
}

fn native_plugin_call(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    if args.len() < 2 {
        return Err(format!(
            "plugin_call expects a handle and a method name, got {} arguments",
            args.len()
        ));
    }
    let handle = int_arg("plugin_call", &args[0])?;
    let method = match vm.deref_value(args[1].clone())? {
        Value::Str(s) => s,
        other => {
            return Err(format!(
                "plugin_call expects a method name, got {}",
                other.type_name()
            ))
        }
    };
    let mut params = Vec::with_capacity(args.len() - 2);
    for arg in &args[2..] {
        params.push(vm.deref_value(arg.clone())?);
    }
    vm.plugins.call(handle, &method, &params)
}

fn native_plugin_close(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    expect_arity("plugin_close", &args, 1)?;
    let handle = int_arg("plugin_close", &args[0])?;
    vm.plugins.close(handle)?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_names() {
        let table = native_table();
        assert_eq!(table.len(), NATIVE_NAMES.len());
        for name in NATIVE_NAMES {
            assert!(table.contains_key(name), "missing native {}", name);
        }
    }

    #[test]
    fn test_to_int_parses() {
        let mut vm = Vm::new();
        assert_eq!(
            native_to_int(&mut vm, vec![Value::string(" 42 ")]).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            native_to_int(&mut vm, vec![Value::Float(3.9)]).unwrap(),
            Value::Int(3)
        );
        assert!(native_to_int(&mut vm, vec![Value::string("x")]).is_err());
    }

    #[test]
    fn test_round_trip_conversions() {
        let mut vm = Vm::new();
        let s = native_to_str(&mut vm, vec![Value::Int(42)]).unwrap();
        assert_eq!(s, Value::string("42"));
        let f = native_to_float(&mut vm, vec![Value::string("3.14")]).unwrap();
        let rendered = native_to_str(&mut vm, vec![f]).unwrap();
        assert_eq!(rendered, Value::string("3.140000"));
    }

    #[test]
    fn test_keys_sorted() {
        let mut vm = Vm::new();
        let mut entries = std::collections::HashMap::new();
        entries.insert(MapKey::Str("b".into()), Value::Int(2));
        entries.insert(MapKey::Str("a".into()), Value::Int(1));
        entries.insert(MapKey::Int(9), Value::Int(0));
        let keys = native_keys(&mut vm, vec![Value::map(entries)]).unwrap();
        let Value::Array(items) = keys else { panic!("expected array") };
        let items = items.lock().unwrap();
        assert_eq!(
            *items,
            vec![Value::Int(9), Value::string("a"), Value::string("b")]
        );
    }

    #[test]
    fn test_chan_wrong_arity() {
        let mut vm = Vm::new();
        let err = native_make_chan(&mut vm, vec![]).unwrap_err();
        assert!(err.contains("expects 1 argument"));
    }

    #[test]
    fn test_push_pop() {
        let mut vm = Vm::new();
        let arr = Value::array(vec![Value::Int(1)]);
        native_push(&mut vm, vec![arr.clone(), Value::Int(2)]).unwrap();
        assert_eq!(
            native_pop(&mut vm, vec![arr.clone()]).unwrap(),
            Value::Int(2)
        );
        assert_eq!(native_pop(&mut vm, vec![arr.clone()]).unwrap(), Value::Int(1));
        assert!(native_pop(&mut vm, vec![arr]).is_err());
    }
}
