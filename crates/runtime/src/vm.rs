//! The Noxy stack virtual machine.
//!
//! Each VM instance is one routine: it owns a fixed-capacity value stack
//! and call-frame stack, and shares the globals table, module cache,
//! native table, and output sink with every routine forked from the same
//! interpreter session.
//!
//! ## Stack discipline
//!
//! `Call` reserves slot 0 of each frame for the callee itself; parameters
//! occupy slots 1..=arity. `JumpIfFalse`/`JumpIfTrue` peek their operand;
//! the compiler emits the matching `Pop` on both paths. `Return` unwinds
//! the frame, closing any upvalue cells that still point into it.
//!
//! ## References
//!
//! A reference value points at a storage location. References to locals
//! share the closure upvalue cells, so closing a slot (scope exit or
//! frame unwind) retargets every outstanding reference at once; global,
//! field, and element references carry the owning container directly.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;

use noxy_core::channel::{Channel, SelectWaker, TryRecv, TrySend};
use noxy_core::chunk::OpCode;
use noxy_core::value::{
    Closure, Function, Globals, Instance, MapKey, RefTarget, UpvalueCell, UpvalueState, Value,
};
use noxy_core::{FRAMES_MAX, STACK_MAX};

use crate::error::RuntimeError;
use crate::plugin::PluginHost;
use crate::routines::Routines;

/// Host-implemented native function.
pub type NativeFn = fn(&mut Vm, Vec<Value>) -> Result<Value, String>;

/// Shared output sink; tests capture it, the CLI wraps stdout.
pub type Output = Arc<Mutex<Box<dyn Write + Send>>>;

/// External collaborator that resolves `use` imports.
pub trait ModuleLoader: Send + Sync {
    /// Resolve a dotted module name to its exported map value.
    fn load(&self, name: &str, vm: &Vm) -> Result<Value, String>;
}

struct CallFrame {
    closure: Arc<Closure>,
    ip: usize,
    base: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub globals: Globals,
    pub modules: Arc<Mutex<HashMap<String, Value>>>,
    natives: Arc<HashMap<&'static str, NativeFn>>,
    /// Open upvalue cells, sorted by stack slot.
    open_upvalues: Vec<Arc<UpvalueCell>>,
    pub loader: Option<Arc<dyn ModuleLoader>>,
    pub out: Output,
    pub routines: Arc<Routines>,
    pub plugins: Arc<PluginHost>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Arc::new(Mutex::new(
            Box::new(std::io::stdout()) as Box<dyn Write + Send>
        )))
    }

    pub fn with_output(out: Output) -> Self {
        let natives = Arc::new(crate::builtins::native_table());
        let globals: Globals = Arc::new(Mutex::new(HashMap::new()));
        {
            let mut table = globals.lock().expect("globals lock poisoned");
            for name in natives.keys() {
                table.insert(name.to_string(), Value::Native((*name).into()));
            }
        }
        Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            modules: Arc::new(Mutex::new(HashMap::new())),
            natives,
            open_upvalues: Vec::new(),
            loader: None,
            out,
            routines: Routines::new(),
            plugins: Arc::new(PluginHost::new()),
        }
    }

    /// A fresh VM for a spawned routine: own stacks, shared world.
    pub fn fork_for_routine(&self) -> Vm {
        Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Arc::clone(&self.globals),
            modules: Arc::clone(&self.modules),
            natives: Arc::clone(&self.natives),
            open_upvalues: Vec::new(),
            loader: self.loader.clone(),
            out: Arc::clone(&self.out),
            routines: Arc::clone(&self.routines),
            plugins: Arc::clone(&self.plugins),
        }
    }

    /// A fresh VM for loading a module: own globals, shared caches.
    pub fn fork_for_module(&self) -> Vm {
        let globals: Globals = Arc::new(Mutex::new(HashMap::new()));
        {
            let mut table = globals.lock().expect("globals lock poisoned");
            for name in self.natives.keys() {
                table.insert(name.to_string(), Value::Native((*name).into()));
            }
        }
        Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            modules: Arc::clone(&self.modules),
            natives: Arc::clone(&self.natives),
            open_upvalues: Vec::new(),
            loader: self.loader.clone(),
            out: Arc::clone(&self.out),
            routines: Arc::clone(&self.routines),
            plugins: Arc::clone(&self.plugins),
        }
    }

    pub fn native_names(&self) -> Vec<&'static str> {
        self.natives.keys().copied().collect()
    }

    /// Run a compiled script to completion.
    pub fn interpret(&mut self, script: Arc<Function>) -> Result<(), RuntimeError> {
        let closure = Arc::new(Closure::new(script, Vec::new()));
        self.push(Value::Closure(Arc::clone(&closure)))?;
        self.call_closure(closure, 0)?;
        self.run()
    }

    /// Call an arbitrary callable with arguments and run it to completion
    /// (routine entry points).
    pub fn run_callable(&mut self, callee: Value, args: Vec<Value>) -> Result<(), RuntimeError> {
        let argc = args.len();
        self.push(callee)?;
        for arg in args {
            self.push(arg)?;
        }
        self.call_value(argc)?;
        self.run()
    }

    // ------------------------------------------------------------------
    // Errors and stack plumbing
    // ------------------------------------------------------------------

    fn current_line(&self) -> u32 {
        match self.frames.last() {
            Some(frame) => frame
                .closure
                .function
                .chunk
                .line_at(frame.ip.saturating_sub(1)),
            None => 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> RuntimeError {
        let mut err = RuntimeError::new(message, self.current_line());
        for frame in self.frames.iter().rev() {
            let line = frame.closure.function.chunk.line_at(frame.ip.saturating_sub(1));
            err.trace
                .push(format!("in {} [line {}]", frame.closure.function.name, line));
        }
        err
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.error("stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let idx = if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        let frame = self.frames.last().expect("no active frame");
        frame.closure.function.chunk.constants[idx].clone()
    }

    fn read_name(&mut self) -> Arc<str> {
        match self.read_constant(true) {
            Value::Str(name) => name,
            other => panic!("name constant is not a string: {:?}", other),
        }
    }

    // ------------------------------------------------------------------
    // Upvalue cells
    // ------------------------------------------------------------------

    /// Find or create the open cell for a stack slot. References produced
    /// by `RefLocal` and closure captures share the same cell.
    fn capture_cell(&mut self, slot: usize) -> Arc<UpvalueCell> {
        let mut insert_at = self.open_upvalues.len();
        for (i, cell) in self.open_upvalues.iter().enumerate() {
            match cell.open_slot() {
                Some(s) if s == slot => return Arc::clone(cell),
                Some(s) if s > slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let cell = UpvalueCell::open(slot);
        self.open_upvalues.insert(insert_at, Arc::clone(&cell));
        cell
    }

    /// Promote every open cell at `from` or above: its payload moves from
    /// the stack into the heap cell, so outstanding references and
    /// upvalues keep reading the now-heap-resident value.
    fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            match self.open_upvalues[i].open_slot() {
                Some(slot) if slot >= from => {
                    let value = self.stack[slot].clone();
                    self.open_upvalues[i].close(value);
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    fn read_cell(&self, cell: &UpvalueCell) -> Value {
        match &*cell.location.lock().expect("upvalue cell lock poisoned") {
            UpvalueState::Open(slot) => self.stack[*slot].clone(),
            UpvalueState::Closed(value) => value.clone(),
        }
    }

    fn write_cell(&mut self, cell: &UpvalueCell, value: Value) {
        let mut location = cell.location.lock().expect("upvalue cell lock poisoned");
        match &mut *location {
            UpvalueState::Open(slot) => self.stack[*slot] = value,
            UpvalueState::Closed(stored) => *stored = value,
        }
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    /// Dereference a reference value; anything else passes through (the
    /// compiler auto-dereferences typed code, this covers `any`).
    pub fn deref_value(&self, value: Value) -> Result<Value, String> {
        match value {
            Value::Ref(target) => self.read_target(&target),
            other => Ok(other),
        }
    }

    fn read_target(&self, target: &RefTarget) -> Result<Value, String> {
        match target {
            RefTarget::Cell(cell) => Ok(self.read_cell(cell)),
            RefTarget::Global(globals, name) => globals
                .lock()
                .expect("globals lock poisoned")
                .get(&**name)
                .cloned()
                .ok_or_else(|| format!("undefined global '{}'", name)),
            RefTarget::Field(instance, name) => instance
                .get(name)
                .ok_or_else(|| format!("undefined property '{}'", name)),
            RefTarget::Element(container, index) => index_get(container, index),
        }
    }

    fn write_target(&mut self, target: &RefTarget, value: Value) -> Result<(), String> {
        match target {
            RefTarget::Cell(cell) => {
                self.write_cell(cell, value);
                Ok(())
            }
            RefTarget::Global(globals, name) => {
                globals
                    .lock()
                    .expect("globals lock poisoned")
                    .insert(name.to_string(), value);
                Ok(())
            }
            RefTarget::Field(instance, name) => {
                if instance.set(name, value) {
                    Ok(())
                } else {
                    Err(format!("undefined property '{}'", name))
                }
            }
            RefTarget::Element(container, index) => index_set(container, index, value),
        }
    }

    fn store_through(&mut self, reference: Value, value: Value) -> Result<(), RuntimeError> {
        match reference {
            Value::Ref(target) => self
                .write_target(&target, value)
                .map_err(|e| self.error(e)),
            other => Err(self.error(format!(
                "cannot write through a {} (expected a reference)",
                other.type_name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.peek(argc).clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::Function(function) => {
                // Bare functions in the constant pool are wrapped lazily.
                let closure = Arc::new(Closure::new(function, Vec::new()));
                self.call_closure(closure, argc)
            }
            Value::Native(name) => {
                let native = self
                    .natives
                    .get(&*name)
                    .copied()
                    .ok_or_else(|| self.error(format!("undefined native '{}'", name)))?;
                let args = self.stack.split_off(self.stack.len() - argc);
                self.pop(); // the callee
                let result = native(self, args).map_err(|e| self.error(e))?;
                self.push(result)
            }
            Value::StructDef(shape) => {
                if argc != shape.fields.len() {
                    return Err(self.error(format!(
                        "struct {} expects {} fields, got {}",
                        shape.name,
                        shape.fields.len(),
                        argc
                    )));
                }
                let args = self.stack.split_off(self.stack.len() - argc);
                self.pop();
                let mut fields = HashMap::new();
                for (name, value) in shape.fields.iter().zip(args) {
                    fields.insert(name.clone(), value);
                }
                self.push(Value::Instance(Arc::new(Instance::new(shape, fields))))
            }
            other => Err(self.error(format!(
                "can only call functions, natives, and struct definitions, got {}",
                other.type_name()
            ))),
        }
    }

    fn call_closure(&mut self, closure: Arc<Closure>, argc: usize) -> Result<(), RuntimeError> {
        let function = &closure.function;
        if function.arity as usize != argc {
            return Err(self.error(format!(
                "{} expects {} arguments, got {}",
                function.name, function.arity, argc
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.error("call stack overflow"));
        }

        // Value semantics at the call boundary: composite arguments bound
        // to non-ref parameters are deep-copied.
        let base = self.stack.len() - argc - 1;
        for i in 0..argc {
            let is_ref_param = function.param_refs.get(i).copied().unwrap_or(false);
            if !is_ref_param {
                let slot = base + 1 + i;
                if matches!(
                    self.stack[slot],
                    Value::Array(_) | Value::Map(_) | Value::Instance(_) | Value::Bytes(_)
                ) {
                    let copy = self.stack[slot].deep_copy();
                    self.stack[slot] = copy;
                }
            }
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        while !self.frames.is_empty() {
            let byte = self.read_byte();
            let op = OpCode::from_byte(byte)
                .ok_or_else(|| self.error(format!("invalid opcode {}", byte)))?;
            self.execute(op)?;
        }
        Ok(())
    }

    fn execute(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        match op {
            OpCode::Constant => {
                let value = self.read_constant(false);
                self.push(value)?;
            }
            OpCode::ConstantLong => {
                let value = self.read_constant(true);
                self.push(value)?;
            }
            OpCode::Null => self.push(Value::Null)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                let top = self.peek(0).clone();
                self.push(top)?;
            }
            OpCode::Copy => {
                let top = self.pop();
                self.push(top.deep_copy())?;
            }

            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().expect("no active frame").base;
                let value = self.stack[base + slot].clone();
                self.push(value)?;
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().expect("no active frame").base;
                let value = self.pop();
                self.stack[base + slot] = value;
            }
            OpCode::GetGlobal => {
                let name = self.read_name();
                let value = self
                    .globals
                    .lock()
                    .expect("globals lock poisoned")
                    .get(&*name)
                    .cloned();
                match value {
                    Some(value) => self.push(value)?,
                    None => return Err(self.error(format!("undefined global '{}'", name))),
                }
            }
            OpCode::SetGlobal => {
                let name = self.read_name();
                let value = self.pop();
                self.globals
                    .lock()
                    .expect("globals lock poisoned")
                    .insert(name.to_string(), value);
            }
            OpCode::GetUpvalue => {
                let idx = self.read_byte() as usize;
                let cell = Arc::clone(
                    &self.frames.last().expect("no active frame").closure.upvalues[idx],
                );
                let value = self.read_cell(&cell);
                self.push(value)?;
            }
            OpCode::SetUpvalue => {
                let idx = self.read_byte() as usize;
                let cell = Arc::clone(
                    &self.frames.last().expect("no active frame").closure.upvalues[idx],
                );
                let value = self.pop();
                self.write_cell(&cell, value);
            }

            OpCode::RefLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().expect("no active frame").base;
                let cell = self.capture_cell(base + slot);
                self.push(Value::Ref(Arc::new(RefTarget::Cell(cell))))?;
            }
            OpCode::RefUpvalue => {
                let idx = self.read_byte() as usize;
                let cell = Arc::clone(
                    &self.frames.last().expect("no active frame").closure.upvalues[idx],
                );
                self.push(Value::Ref(Arc::new(RefTarget::Cell(cell))))?;
            }
            OpCode::RefGlobal => {
                let name = self.read_name();
                let globals = Arc::clone(&self.globals);
                self.push(Value::Ref(Arc::new(RefTarget::Global(globals, name))))?;
            }
            OpCode::RefProperty => {
                let name = self.read_name();
                let object = self.pop();
                let object = self.deref_value(object).map_err(|e| self.error(e))?;
                match object {
                    Value::Instance(instance) => {
                        if !instance.shape.fields.iter().any(|f| **f == *name) {
                            return Err(self.error(format!("undefined property '{}'", name)));
                        }
                        self.push(Value::Ref(Arc::new(RefTarget::Field(instance, name))))?;
                    }
                    Value::Map(_) => {
                        let key = Value::Str(Arc::clone(&name));
                        self.push(Value::Ref(Arc::new(RefTarget::Element(object, key))))?;
                    }
                    other => {
                        return Err(self.error(format!(
                            "cannot take a reference into {}",
                            other.type_name()
                        )))
                    }
                }
            }
            OpCode::RefIndex => {
                let index = self.pop();
                let index = self.deref_value(index).map_err(|e| self.error(e))?;
                let container = self.pop();
                let container = self.deref_value(container).map_err(|e| self.error(e))?;
                match container {
                    Value::Array(_) | Value::Map(_) | Value::Bytes(_) => {
                        self.push(Value::Ref(Arc::new(RefTarget::Element(container, index))))?;
                    }
                    other => {
                        return Err(self.error(format!(
                            "cannot take a reference into {}",
                            other.type_name()
                        )))
                    }
                }
            }
            OpCode::Deref => {
                let value = self.pop();
                match value {
                    Value::Ref(target) => {
                        let inner = self.read_target(&target).map_err(|e| self.error(e))?;
                        self.push(inner)?;
                    }
                    // `any`-typed code may dereference a plain value.
                    other => self.push(other)?,
                }
            }
            OpCode::StoreViaRef => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().expect("no active frame").base;
                let value = self.pop();
                let reference = self.stack[base + slot].clone();
                self.store_through(reference, value)?;
            }
            OpCode::StoreRef => {
                let value = self.pop();
                let reference = self.pop();
                self.store_through(reference, value)?;
            }
            OpCode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }

            OpCode::Array => {
                let count = self.read_u16() as usize;
                let items = self.stack.split_off(self.stack.len() - count);
                self.push(Value::array(items))?;
            }
            OpCode::Map => {
                let count = self.read_u16() as usize;
                let mut flat = self.stack.split_off(self.stack.len() - 2 * count);
                let mut entries = HashMap::with_capacity(count);
                for _ in 0..count {
                    // Preserve pair order: drain from the front.
                    let key = flat.remove(0);
                    let value = flat.remove(0);
                    let key = MapKey::from_value(&key).ok_or_else(|| {
                        self.error(format!(
                            "map keys must be int or string, got {}",
                            key.type_name()
                        ))
                    })?;
                    entries.insert(key, value);
                }
                self.push(Value::map(entries))?;
            }
            OpCode::Zeros => {
                let count = self.pop();
                let count = self.deref_value(count).map_err(|e| self.error(e))?;
                let Value::Int(n) = count else {
                    return Err(self.error(format!(
                        "zeros length must be an int, got {}",
                        count.type_name()
                    )));
                };
                if n < 0 {
                    return Err(self.error(format!("zeros length must be non-negative, got {}", n)));
                }
                self.push(Value::bytes(vec![0u8; n as usize]))?;
            }
            OpCode::Len => {
                let value = self.pop();
                let value = self.deref_value(value).map_err(|e| self.error(e))?;
                let len = match &value {
                    Value::Array(items) => items.lock().expect("array lock poisoned").len(),
                    Value::Map(entries) => entries.lock().expect("map lock poisoned").len(),
                    Value::Str(s) => s.chars().count(),
                    Value::Bytes(data) => data.lock().expect("bytes lock poisoned").len(),
                    other => {
                        return Err(self.error(format!(
                            "len() requires a collection, got {}",
                            other.type_name()
                        )))
                    }
                };
                self.push(Value::Int(len as i64))?;
            }
            OpCode::GetIndex => {
                let index = self.pop();
                let index = self.deref_value(index).map_err(|e| self.error(e))?;
                let container = self.pop();
                let container = self.deref_value(container).map_err(|e| self.error(e))?;
                let value = index_get(&container, &index).map_err(|e| self.error(e))?;
                self.push(value)?;
            }
            OpCode::SetIndex => {
                let value = self.pop();
                let index = self.pop();
                let index = self.deref_value(index).map_err(|e| self.error(e))?;
                let container = self.pop();
                let container = self.deref_value(container).map_err(|e| self.error(e))?;
                index_set(&container, &index, value).map_err(|e| self.error(e))?;
            }
            OpCode::GetProperty => {
                let name = self.read_name();
                let object = self.pop();
                let object = self.deref_value(object).map_err(|e| self.error(e))?;
                let value = match &object {
                    Value::Instance(instance) => instance
                        .get(&name)
                        .ok_or_else(|| self.error(format!("undefined property '{}'", name)))?,
                    Value::Map(entries) => entries
                        .lock()
                        .expect("map lock poisoned")
                        .get(&MapKey::Str(Arc::clone(&name)))
                        .cloned()
                        .ok_or_else(|| self.error(format!("undefined property '{}'", name)))?,
                    other => {
                        return Err(self.error(format!(
                            "only instances and maps have properties, got {}",
                            other.type_name()
                        )))
                    }
                };
                self.push(value)?;
            }
            OpCode::SetProperty => {
                let name = self.read_name();
                let value = self.pop();
                let object = self.pop();
                let object = self.deref_value(object).map_err(|e| self.error(e))?;
                match &object {
                    Value::Instance(instance) => {
                        if !instance.set(&name, value) {
                            return Err(self.error(format!("undefined property '{}'", name)));
                        }
                    }
                    Value::Map(entries) => {
                        entries
                            .lock()
                            .expect("map lock poisoned")
                            .insert(MapKey::Str(Arc::clone(&name)), value);
                    }
                    other => {
                        return Err(self.error(format!(
                            "only instances and maps have properties, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            OpCode::SetPropertyDeref => {
                let name = self.read_name();
                let value = self.pop();
                let object = self.pop();
                let object = self.deref_value(object).map_err(|e| self.error(e))?;
                let Value::Instance(instance) = &object else {
                    return Err(self.error(format!(
                        "only instances have reference fields, got {}",
                        object.type_name()
                    )));
                };
                let current = instance
                    .get(&name)
                    .ok_or_else(|| self.error(format!("undefined property '{}'", name)))?;
                match current {
                    Value::Ref(target) => {
                        self.write_target(&target, value).map_err(|e| self.error(e))?;
                    }
                    other => {
                        return Err(self.error(format!(
                            "field '{}' does not hold a reference (got {})",
                            name,
                            other.type_name()
                        )))
                    }
                }
            }

            // Generic arithmetic: numeric promotion plus string/bytes
            // concatenation on Add.
            OpCode::Add => self.binary_add()?,
            OpCode::Subtract => self.binary_numeric(op)?,
            OpCode::Multiply => self.binary_numeric(op)?,
            OpCode::Divide => self.binary_numeric(op)?,
            OpCode::Modulo => self.binary_numeric(op)?,
            OpCode::Negate => {
                let value = self.pop();
                let value = self.deref_value(value).map_err(|e| self.error(e))?;
                match value {
                    Value::Int(n) => self.push(Value::Int(n.wrapping_neg()))?,
                    Value::Float(x) => self.push(Value::Float(-x))?,
                    other => {
                        return Err(self.error(format!(
                            "operand of '-' must be a number, got {}",
                            other.type_name()
                        )))
                    }
                }
            }

            OpCode::AddInt => self.binary_int(op)?,
            OpCode::SubtractInt => self.binary_int(op)?,
            OpCode::MultiplyInt => self.binary_int(op)?,
            OpCode::DivideInt => self.binary_int(op)?,
            OpCode::ModuloInt => self.binary_int(op)?,
            OpCode::NegateInt => {
                let value = self.pop();
                let Value::Int(n) = value else {
                    return Err(self.error(format!(
                        "operand of '-' must be an int, got {}",
                        value.type_name()
                    )));
                };
                self.push(Value::Int(n.wrapping_neg()))?;
            }

            OpCode::Not => {
                let value = self.pop();
                let value = self.deref_value(value).map_err(|e| self.error(e))?;
                match value {
                    Value::Bool(b) => self.push(Value::Bool(!b))?,
                    other => {
                        return Err(self.error(format!(
                            "operand of '!' must be a boolean, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            OpCode::Equal => {
                let rhs = self.pop();
                let rhs = self.deref_value(rhs).map_err(|e| self.error(e))?;
                let lhs = self.pop();
                let lhs = self.deref_value(lhs).map_err(|e| self.error(e))?;
                self.push(Value::Bool(lhs == rhs))?;
            }
            OpCode::EqualInt => {
                let (a, b) = self.pop_int_pair("==")?;
                self.push(Value::Bool(a == b))?;
            }
            OpCode::Less => self.binary_compare(false)?,
            OpCode::Greater => self.binary_compare(true)?,
            OpCode::LessInt => {
                let (a, b) = self.pop_int_pair("<")?;
                self.push(Value::Bool(a < b))?;
            }
            OpCode::GreaterInt => {
                let (a, b) = self.pop_int_pair(">")?;
                self.push(Value::Bool(a > b))?;
            }

            OpCode::BitAnd => {
                let (a, b) = self.pop_int_pair("&")?;
                self.push(Value::Int(a & b))?;
            }
            OpCode::BitOr => {
                let (a, b) = self.pop_int_pair("|")?;
                self.push(Value::Int(a | b))?;
            }
            OpCode::BitXor => {
                let (a, b) = self.pop_int_pair("^")?;
                self.push(Value::Int(a ^ b))?;
            }
            OpCode::BitNot => {
                let value = self.pop();
                let Value::Int(n) = value else {
                    return Err(self.error(format!(
                        "operand of '~' must be an int, got {}",
                        value.type_name()
                    )));
                };
                self.push(Value::Int(!n))?;
            }
            OpCode::ShiftLeft => {
                let (a, b) = self.pop_int_pair("<<")?;
                if b < 0 {
                    return Err(self.error(format!("negative shift count: {}", b)));
                }
                let result = if b >= 64 { 0 } else { a.wrapping_shl(b as u32) };
                self.push(Value::Int(result))?;
            }
            OpCode::ShiftRight => {
                let (a, b) = self.pop_int_pair(">>")?;
                if b < 0 {
                    return Err(self.error(format!("negative shift count: {}", b)));
                }
                // Arithmetic shift; counts past the width saturate to the
                // sign bit.
                let result = if b >= 64 {
                    if a < 0 {
                        -1
                    } else {
                        0
                    }
                } else {
                    a >> b
                };
                self.push(Value::Int(result))?;
            }

            OpCode::Jump => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().expect("no active frame").ip += offset;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                let cond = self.condition_peek()?;
                if !cond {
                    self.frames.last_mut().expect("no active frame").ip += offset;
                }
            }
            OpCode::JumpIfTrue => {
                let offset = self.read_u16() as usize;
                let cond = self.condition_peek()?;
                if cond {
                    self.frames.last_mut().expect("no active frame").ip += offset;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().expect("no active frame").ip -= offset;
            }
            OpCode::Call => {
                let argc = self.read_byte() as usize;
                self.call_value(argc)?;
            }
            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("no active frame");
                self.close_upvalues(frame.base);
                self.stack.truncate(frame.base);
                if !self.frames.is_empty() {
                    self.push(result)?;
                }
            }

            OpCode::Closure => {
                let constant = self.read_constant(true);
                let Value::Function(function) = constant else {
                    return Err(self.error("closure operand is not a function"));
                };
                let mut upvalues = Vec::with_capacity(function.upvalue_count);
                let base = self.frames.last().expect("no active frame").base;
                for _ in 0..function.upvalue_count {
                    let is_local = self.read_byte() == 1;
                    let index = self.read_byte() as usize;
                    if is_local {
                        upvalues.push(self.capture_cell(base + index));
                    } else {
                        let frame = self.frames.last().expect("no active frame");
                        upvalues.push(Arc::clone(&frame.closure.upvalues[index]));
                    }
                }
                self.push(Value::Closure(Arc::new(Closure::new(function, upvalues))))?;
            }
            OpCode::Import => {
                let name = self.read_name();
                self.import_module(&name)?;
            }
            OpCode::ImportFromAll => {
                let module = self.pop();
                let Value::Map(entries) = &module else {
                    return Err(self.error("import source is not a module map"));
                };
                let entries = entries.lock().expect("map lock poisoned");
                let mut globals = self.globals.lock().expect("globals lock poisoned");
                for (key, value) in entries.iter() {
                    if let MapKey::Str(name) = key {
                        globals.insert(name.to_string(), value.clone());
                    }
                }
            }
            OpCode::Select => {
                let count = self.read_byte() as usize;
                self.op_select(count)?;
            }
        }
        Ok(())
    }

    fn condition_peek(&self) -> Result<bool, RuntimeError> {
        match self.peek(0) {
            Value::Bool(b) => Ok(*b),
            other => Err(self.error(format!(
                "condition must be a boolean, got {}",
                other.type_name()
            ))),
        }
    }

    fn pop_numeric_pair(&mut self, symbol: &str) -> Result<(Value, Value), RuntimeError> {
        let rhs = self.pop();
        let rhs = self.deref_value(rhs).map_err(|e| self.error(e))?;
        let lhs = self.pop();
        let lhs = self.deref_value(lhs).map_err(|e| self.error(e))?;
        match (&lhs, &rhs) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => Ok((lhs, rhs)),
            _ => Err(self.error(format!(
                "operands of '{}' must be numbers, got {} and {}",
                symbol,
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }

    fn pop_int_pair(&mut self, symbol: &str) -> Result<(i64, i64), RuntimeError> {
        let rhs = self.pop();
        let lhs = self.pop();
        match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => Ok((*a, *b)),
            _ => Err(self.error(format!(
                "operands of '{}' must be ints, got {} and {}",
                symbol,
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }

    fn binary_add(&mut self) -> Result<(), RuntimeError> {
        let rhs = self.pop();
        let rhs = self.deref_value(rhs).map_err(|e| self.error(e))?;
        let lhs = self.pop();
        let lhs = self.deref_value(lhs).map_err(|e| self.error(e))?;
        let result = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
            (Value::Int(a), Value::Float(b)) => Value::Float(*a as f64 + b),
            (Value::Float(a), Value::Int(b)) => Value::Float(a + *b as f64),
            (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
            (Value::Str(a), Value::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Value::string(s)
            }
            (Value::Bytes(a), Value::Bytes(b)) => {
                let mut data = a.lock().expect("bytes lock poisoned").clone();
                data.extend_from_slice(&b.lock().expect("bytes lock poisoned"));
                Value::bytes(data)
            }
            _ => {
                return Err(self.error(format!(
                    "operands of '+' must be numbers, strings, or bytes, got {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                )))
            }
        };
        self.push(result)
    }

    fn binary_numeric(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let symbol = match op {
            OpCode::Subtract => "-",
            OpCode::Multiply => "*",
            OpCode::Divide => "/",
            OpCode::Modulo => "%",
            _ => unreachable!("not a generic numeric op"),
        };
        let (lhs, rhs) = self.pop_numeric_pair(symbol)?;
        // Int/int pairs can reach the generic ops through `any`.
        if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
            let (a, b) = (*a, *b);
            let result = match op {
                OpCode::Subtract => a.wrapping_sub(b),
                OpCode::Multiply => a.wrapping_mul(b),
                OpCode::Divide => {
                    if b == 0 {
                        return Err(self.error("division by zero"));
                    }
                    a.wrapping_div(b)
                }
                OpCode::Modulo => {
                    if b == 0 {
                        return Err(self.error("modulo by zero"));
                    }
                    a.wrapping_rem(b)
                }
                _ => unreachable!(),
            };
            return self.push(Value::Int(result));
        }
        let a = match lhs {
            Value::Int(n) => n as f64,
            Value::Float(x) => x,
            _ => unreachable!("pop_numeric_pair guarantees numbers"),
        };
        let b = match rhs {
            Value::Int(n) => n as f64,
            Value::Float(x) => x,
            _ => unreachable!("pop_numeric_pair guarantees numbers"),
        };
        let result = match op {
            OpCode::Subtract => a - b,
            OpCode::Multiply => a * b,
            OpCode::Divide => a / b,
            OpCode::Modulo => a % b,
            _ => unreachable!(),
        };
        self.push(Value::Float(result))
    }

    fn binary_int(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let symbol = match op {
            OpCode::AddInt => "+",
            OpCode::SubtractInt => "-",
            OpCode::MultiplyInt => "*",
            OpCode::DivideInt => "/",
            OpCode::ModuloInt => "%",
            _ => unreachable!("not an int op"),
        };
        let (a, b) = self.pop_int_pair(symbol)?;
        let result = match op {
            OpCode::AddInt => a.wrapping_add(b),
            OpCode::SubtractInt => a.wrapping_sub(b),
            OpCode::MultiplyInt => a.wrapping_mul(b),
            OpCode::DivideInt => {
                if b == 0 {
                    return Err(self.error("division by zero"));
                }
                a.wrapping_div(b)
            }
            OpCode::ModuloInt => {
                if b == 0 {
                    return Err(self.error("modulo by zero"));
                }
                a.wrapping_rem(b)
            }
            _ => unreachable!(),
        };
        self.push(Value::Int(result))
    }

    fn binary_compare(&mut self, greater: bool) -> Result<(), RuntimeError> {
        let symbol = if greater { ">" } else { "<" };
        let rhs = self.pop();
        let rhs = self.deref_value(rhs).map_err(|e| self.error(e))?;
        let lhs = self.pop();
        let lhs = self.deref_value(lhs).map_err(|e| self.error(e))?;
        let ordering = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => {
                return Err(self.error(format!(
                    "operands of '{}' must be numbers or strings, got {} and {}",
                    symbol,
                    lhs.type_name(),
                    rhs.type_name()
                )))
            }
        };
        let result = match ordering {
            Some(std::cmp::Ordering::Less) => !greater,
            Some(std::cmp::Ordering::Greater) => greater,
            _ => false,
        };
        self.push(Value::Bool(result))
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    fn import_module(&mut self, name: &str) -> Result<(), RuntimeError> {
        let cached = self
            .modules
            .lock()
            .expect("module cache lock poisoned")
            .get(name)
            .cloned();
        if let Some(module) = cached {
            return self.push(module);
        }
        let Some(loader) = self.loader.clone() else {
            return Err(self.error(format!(
                "no module loader installed; cannot import '{}'",
                name
            )));
        };
        tracing::debug!(module = name, "loading module");
        let module = loader
            .load(name, self)
            .map_err(|e| self.error(e))?;
        self.modules
            .lock()
            .expect("module cache lock poisoned")
            .insert(name.to_string(), module.clone());
        self.push(module)
    }

    // ------------------------------------------------------------------
    // Select
    // ------------------------------------------------------------------

    fn op_select(&mut self, count: usize) -> Result<(), RuntimeError> {
        struct SelectCase {
            channel: Option<Arc<Channel>>,
            value: Value,
            mode: i64,
        }

        /// One poll pass in randomized order. `Ok(Some(..))` is the
        /// committed `(index, received_value, ok)`; `Err` is a send on a
        /// closed channel.
        fn poll(
            vm: &Vm,
            cases: &[SelectCase],
            order: &mut [usize],
            rng: &mut rand::rngs::ThreadRng,
        ) -> Result<Option<(usize, Value, bool)>, RuntimeError> {
            order.shuffle(rng);
            for &i in order.iter() {
                let case = &cases[i];
                let channel = case.channel.as_ref().expect("pollable case has a channel");
                match case.mode {
                    0 => match channel.try_recv() {
                        TryRecv::Value(value) => return Ok(Some((i, value, true))),
                        // Receiving from a closed, drained channel is not an
                        // error; ok=false reports it.
                        TryRecv::Closed => return Ok(Some((i, Value::Null, false))),
                        TryRecv::Empty => {}
                    },
                    1 => match channel.try_send(case.value.clone()) {
                        TrySend::Sent => return Ok(Some((i, Value::Null, true))),
                        TrySend::Closed => {
                            return Err(vm.error("send on closed channel in 'when'"))
                        }
                        TrySend::Full => {}
                    },
                    _ => unreachable!("default cases are not polled"),
                }
            }
            Ok(None)
        }

        let base = self.stack.len() - 3 * count;
        let mut cases = Vec::with_capacity(count);
        for i in 0..count {
            let channel_value = self.stack[base + 3 * i].clone();
            let channel_value = self
                .deref_value(channel_value)
                .map_err(|e| self.error(e))?;
            let value = self.stack[base + 3 * i + 1].clone();
            let Value::Int(mode) = self.stack[base + 3 * i + 2] else {
                return Err(self.error("malformed select case"));
            };
            let channel = if mode == 2 {
                None
            } else {
                match channel_value {
                    Value::Channel(chan) => Some(chan),
                    other => {
                        return Err(self.error(format!(
                            "'when' case requires a channel, got {}",
                            other.type_name()
                        )))
                    }
                }
            };
            cases.push(SelectCase {
                channel,
                value,
                mode,
            });
        }
        self.stack.truncate(base);

        let default_index = cases.iter().position(|c| c.mode == 2);
        let mut pollable: Vec<usize> = (0..count).filter(|&i| cases[i].mode != 2).collect();
        let mut rng = rand::thread_rng();

        let outcome = match poll(self, &cases, &mut pollable, &mut rng)? {
            Some(outcome) => outcome,
            None => match default_index {
                Some(d) => (d, Value::Null, true),
                None => {
                    // Block: register on every channel, then race
                    // notifications, re-polling after each wake.
                    let waker = SelectWaker::new();
                    for &i in &pollable {
                        cases[i]
                            .channel
                            .as_ref()
                            .expect("pollable case has a channel")
                            .register_waiter(&waker);
                    }
                    let outcome = loop {
                        if let Some(outcome) = poll(self, &cases, &mut pollable, &mut rng)? {
                            break outcome;
                        }
                        waker.wait();
                    };
                    for &i in &pollable {
                        cases[i]
                            .channel
                            .as_ref()
                            .expect("pollable case has a channel")
                            .unregister_waiter(&waker);
                    }
                    outcome
                }
            },
        };

        let (index, value, ok) = outcome;
        self.push(Value::Int(index as i64))?;
        self.push(value)?;
        self.push(Value::Bool(ok))?;
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

// ----------------------------------------------------------------------
// Indexing shared by GetIndex/SetIndex and element references
// ----------------------------------------------------------------------

pub(crate) fn index_get(container: &Value, index: &Value) -> Result<Value, String> {
    match (container, index) {
        (Value::Array(items), Value::Int(i)) => {
            let items = items.lock().expect("array lock poisoned");
            let idx = usize::try_from(*i)
                .ok()
                .filter(|&idx| idx < items.len())
                .ok_or_else(|| {
                    format!("array index {} out of range (length {})", i, items.len())
                })?;
            Ok(items[idx].clone())
        }
        (Value::Map(entries), key) => {
            let key = MapKey::from_value(key)
                .ok_or_else(|| format!("map keys must be int or string, got {}", key.type_name()))?;
            entries
                .lock()
                .expect("map lock poisoned")
                .get(&key)
                .cloned()
                .ok_or_else(|| format!("map key '{}' not found", key))
        }
        (Value::Bytes(data), Value::Int(i)) => {
            let data = data.lock().expect("bytes lock poisoned");
            let idx = usize::try_from(*i)
                .ok()
                .filter(|&idx| idx < data.len())
                .ok_or_else(|| {
                    format!("bytes index {} out of range (length {})", i, data.len())
                })?;
            Ok(Value::Int(data[idx] as i64))
        }
        (Value::Str(s), Value::Int(i)) => {
            let c = usize::try_from(*i)
                .ok()
                .and_then(|idx| s.chars().nth(idx))
                .ok_or_else(|| {
                    format!(
                        "string index {} out of range (length {})",
                        i,
                        s.chars().count()
                    )
                })?;
            Ok(Value::string(c.to_string()))
        }
        (container, index) => Err(format!(
            "cannot index {} with {}",
            container.type_name(),
            index.type_name()
        )),
    }
}

pub(crate) fn index_set(container: &Value, index: &Value, value: Value) -> Result<(), String> {
    match (container, index) {
        (Value::Array(items), Value::Int(i)) => {
            let mut items = items.lock().expect("array lock poisoned");
            let len = items.len();
            let idx = usize::try_from(*i)
                .ok()
                .filter(|&idx| idx < len)
                .ok_or_else(|| format!("array index {} out of range (length {})", i, len))?;
            items[idx] = value;
            Ok(())
        }
        (Value::Map(entries), key) => {
            let key = MapKey::from_value(key)
                .ok_or_else(|| format!("map keys must be int or string, got {}", key.type_name()))?;
            entries
                .lock()
                .expect("map lock poisoned")
                .insert(key, value);
            Ok(())
        }
        (Value::Bytes(data), Value::Int(i)) => {
            let Value::Int(byte) = value else {
                return Err(format!(
                    "bytes elements must be ints, got {}",
                    value.type_name()
                ));
            };
            if !(0..=255).contains(&byte) {
                return Err(format!("byte value {} out of range 0..=255", byte));
            }
            let mut data = data.lock().expect("bytes lock poisoned");
            let len = data.len();
            let idx = usize::try_from(*i)
                .ok()
                .filter(|&idx| idx < len)
                .ok_or_else(|| format!("bytes index {} out of range (length {})", i, len))?;
            data[idx] = byte as u8;
            Ok(())
        }
        (container, index) => Err(format!(
            "cannot index {} with {}",
            container.type_name(),
            index.type_name()
        )),
    }
}
