//! Runtime value model for Noxy.
//!
//! A [`Value`] is a tagged union covering every runtime shape: primitives,
//! heap objects (strings, bytes, arrays, maps, struct definitions and
//! instances), callables (compiled functions, closures, natives), CSP
//! conduits, and first-class references.
//!
//! Heap objects are wrapped in `Arc<Mutex<..>>` so a value can be sent over
//! a channel and shared between routines; cloning a value is always O(1)
//! (the deep copy used for value-semantics call boundaries is explicit, see
//! [`Value::deep_copy`]).

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::chunk::Chunk;
use crate::waitgroup::WaitGroup;

/// A shared globals table. The VM owns one per interpreter session; module
/// loading and `ref` globals hold additional handles to it.
pub type Globals = Arc<Mutex<HashMap<String, Value>>>;

/// The shape of a user-declared struct: its name and ordered field list.
///
/// Field types are a compile-time concern; at runtime only the names and
/// their declaration order matter (construction populates fields in order).
#[derive(Debug, Clone, PartialEq)]
pub struct StructShape {
    pub name: String,
    pub fields: Vec<String>,
}

/// A struct instance: a pointer to its shape plus a mutable field map.
#[derive(Debug)]
pub struct Instance {
    pub shape: Arc<StructShape>,
    pub fields: Mutex<HashMap<String, Value>>,
}

impl Instance {
    pub fn new(shape: Arc<StructShape>, fields: HashMap<String, Value>) -> Self {
        Instance {
            shape,
            fields: Mutex::new(fields),
        }
    }

    /// Read a field by name, or None if the shape has no such field.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields
            .lock()
            .expect("instance field lock poisoned")
            .get(name)
            .cloned()
    }

    /// Write a field by name. Returns false if the shape has no such field.
    pub fn set(&self, name: &str, value: Value) -> bool {
        if !self.shape.fields.iter().any(|f| f == name) {
            return false;
        }
        self.fields
            .lock()
            .expect("instance field lock poisoned")
            .insert(name.to_string(), value);
        true
    }
}

/// A compiled function: the bytecode chunk plus the metadata the VM needs
/// to call it.
#[derive(Debug)]
pub struct Function {
    /// Function name for diagnostics; the top-level script uses "<script>".
    pub name: String,
    pub arity: u8,
    pub upvalue_count: usize,
    /// Which parameters were declared `ref`. Non-ref parameters of composite
    /// type are deep-copied at the call boundary to preserve value semantics.
    pub param_refs: Vec<bool>,
    pub chunk: Chunk,
}

/// A closure: a function plus the upvalue cells it captured.
#[derive(Debug)]
pub struct Closure {
    pub function: Arc<Function>,
    pub upvalues: Vec<Arc<UpvalueCell>>,
}

impl Closure {
    pub fn new(function: Arc<Function>, upvalues: Vec<Arc<UpvalueCell>>) -> Self {
        Closure { function, upvalues }
    }
}

/// Where a captured variable currently lives.
#[derive(Debug)]
pub enum UpvalueState {
    /// Still on the owning routine's value stack, at this absolute slot.
    Open(usize),
    /// Promoted to the heap when the slot left scope; the cell owns the value.
    Closed(Value),
}

/// A heap cell backing a captured local.
///
/// The same cells serve closure upvalues and `ref` values produced from
/// locals: taking `ref x` and capturing `x` in a closure hand out the same
/// cell, so closing the slot retargets every outstanding reader at once.
#[derive(Debug)]
pub struct UpvalueCell {
    pub location: Mutex<UpvalueState>,
}

impl UpvalueCell {
    pub fn open(slot: usize) -> Arc<Self> {
        Arc::new(UpvalueCell {
            location: Mutex::new(UpvalueState::Open(slot)),
        })
    }

    pub fn closed(value: Value) -> Arc<Self> {
        Arc::new(UpvalueCell {
            location: Mutex::new(UpvalueState::Closed(value)),
        })
    }

    /// The stack slot this cell points at, or None once closed.
    pub fn open_slot(&self) -> Option<usize> {
        match *self.location.lock().expect("upvalue cell lock poisoned") {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Detach the cell from the stack, making it own `value`.
    pub fn close(&self, value: Value) {
        *self.location.lock().expect("upvalue cell lock poisoned") = UpvalueState::Closed(value);
    }
}

/// The storage location a reference value points at.
#[derive(Debug)]
pub enum RefTarget {
    /// A local slot (or, once closed, a heap cell). Shares the upvalue
    /// mechanism so scope exit retargets outstanding references.
    Cell(Arc<UpvalueCell>),
    /// A named global in a globals table.
    Global(Globals, Arc<str>),
    /// A field of a struct instance.
    Field(Arc<Instance>, Arc<str>),
    /// An array/map/bytes element; the container value plus the index value.
    Element(Value, Value),
}

/// Hashable subset of [`Value`] usable as a map key.
///
/// Noxy maps are keyed by integer or string only; floats are excluded for
/// the usual NaN-equality reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    Int(i64),
    Str(Arc<str>),
}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            MapKey::Int(n) => n.hash(state),
            MapKey::Str(s) => s.hash(state),
        }
    }
}

impl MapKey {
    /// Try to convert a value to a map key. Returns None for unkeyable types.
    pub fn from_value(value: &Value) -> Option<MapKey> {
        match value {
            Value::Int(n) => Some(MapKey::Int(*n)),
            Value::Str(s) => Some(MapKey::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Int(n) => Value::Int(*n),
            MapKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Int(n) => write!(f, "{}", n),
            MapKey::Str(s) => write!(f, "{}", s),
        }
    }
}

/// A Noxy runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<Mutex<Vec<u8>>>),
    Array(Arc<Mutex<Vec<Value>>>),
    Map(Arc<Mutex<HashMap<MapKey, Value>>>),
    StructDef(Arc<StructShape>),
    Instance(Arc<Instance>),
    Function(Arc<Function>),
    Closure(Arc<Closure>),
    /// Host-implemented callable, named into the VM's native table.
    Native(Arc<str>),
    Channel(Arc<Channel>),
    WaitGroup(Arc<WaitGroup>),
    Ref(Arc<RefTarget>),
}

impl Value {
    pub fn string(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn bytes(data: Vec<u8>) -> Value {
        Value::Bytes(Arc::new(Mutex::new(data)))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn map(entries: HashMap<MapKey, Value>) -> Value {
        Value::Map(Arc::new(Mutex::new(entries)))
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::StructDef(_) => "struct",
            Value::Instance(_) => "instance",
            Value::Function(_) | Value::Closure(_) => "func",
            Value::Native(_) => "native",
            Value::Channel(_) => "chan",
            Value::WaitGroup(_) => "waitgroup",
            Value::Ref(_) => "ref",
        }
    }

    /// Recursive copy for value semantics at call/return boundaries.
    ///
    /// Composites (bytes, arrays, maps, instances) are rebuilt; everything
    /// else is shared, including channels and closures, which are identity
    /// values by design.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Bytes(b) => {
                Value::bytes(b.lock().expect("bytes lock poisoned").clone())
            }
            Value::Array(items) => {
                let items = items.lock().expect("array lock poisoned");
                Value::array(items.iter().map(Value::deep_copy).collect())
            }
            Value::Map(entries) => {
                let entries = entries.lock().expect("map lock poisoned");
                Value::map(
                    entries
                        .iter()
                        .map(|(k, v)| (k.clone(), v.deep_copy()))
                        .collect(),
                )
            }
            Value::Instance(inst) => {
                let fields = inst.fields.lock().expect("instance field lock poisoned");
                let copied = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Value::Instance(Arc::new(Instance::new(inst.shape.clone(), copied)))
            }
            other => other.clone(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            // Mixed numeric comparison promotes to float.
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => {
                Arc::ptr_eq(a, b)
                    || *a.lock().expect("bytes lock poisoned")
                        == *b.lock().expect("bytes lock poisoned")
            }
            // Composites compare by identity, like channels.
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::StructDef(a), Value::StructDef(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::Channel(a), Value::Channel(b)) => Arc::ptr_eq(a, b),
            (Value::WaitGroup(a), Value::WaitGroup(b)) => Arc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Render bytes the way the lexer reads them back: printable ASCII stays,
/// common escapes are named, the rest is `\xNN`.
fn write_bytes(f: &mut fmt::Formatter<'_>, data: &[u8]) -> fmt::Result {
    write!(f, "b\"")?;
    for &b in data {
        match b {
            b'\n' => write!(f, "\\n")?,
            b'\r' => write!(f, "\\r")?,
            b'\t' => write!(f, "\\t")?,
            b'\\' => write!(f, "\\\\")?,
            b'"' => write!(f, "\\\"")?,
            0x20..=0x7e => write!(f, "{}", b as char)?,
            _ => write!(f, "\\x{:02x}", b)?,
        }
    }
    write!(f, "\"")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            // Six fractional digits by default, matching to_str.
            Value::Float(x) => write!(f, "{:.6}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bytes(b) => write_bytes(f, &b.lock().expect("bytes lock poisoned")),
            Value::Array(items) => {
                let items = items.lock().expect("array lock poisoned");
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                let entries = entries.lock().expect("map lock poisoned");
                // Sort keys so rendering is deterministic.
                let mut keys: Vec<&MapKey> = entries.keys().collect();
                keys.sort_by(|a, b| match (a, b) {
                    (MapKey::Int(x), MapKey::Int(y)) => x.cmp(y),
                    (MapKey::Str(x), MapKey::Str(y)) => x.cmp(y),
                    (MapKey::Int(_), MapKey::Str(_)) => std::cmp::Ordering::Less,
                    (MapKey::Str(_), MapKey::Int(_)) => std::cmp::Ordering::Greater,
                });
                write!(f, "{{")?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, entries[*key])?;
                }
                write!(f, "}}")
            }
            Value::StructDef(shape) => write!(f, "<struct {}>", shape.name),
            Value::Instance(inst) => write!(f, "<{} instance>", inst.shape.name),
            Value::Function(func) => write!(f, "<fn {}>", func.name),
            Value::Closure(closure) => write!(f, "<fn {}>", closure.function.name),
            Value::Native(name) => write!(f, "<native fn {}>", name),
            Value::Channel(_) => write!(f, "<chan>"),
            Value::WaitGroup(_) => write!(f, "<waitgroup>"),
            Value::Ref(_) => write!(f, "<ref>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_promotes() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_ne!(Value::Int(3), Value::Float(3.5));
    }

    #[test]
    fn test_string_equality_by_content() {
        assert_eq!(Value::string("abc"), Value::string("abc"));
        assert_ne!(Value::string("abc"), Value::string("abd"));
    }

    #[test]
    fn test_array_equality_by_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_deep_copy_detaches_arrays() {
        let original = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let copy = original.deep_copy();
        if let (Value::Array(a), Value::Array(b)) = (&original, &copy) {
            assert!(!Arc::ptr_eq(a, b));
            a.lock().unwrap().push(Value::Int(3));
            assert_eq!(b.lock().unwrap().len(), 2);
        } else {
            panic!("expected arrays");
        }
    }

    #[test]
    fn test_display_float_six_digits() {
        assert_eq!(Value::Float(3.14).to_string(), "3.140000");
        assert_eq!(Value::Float(1.0).to_string(), "1.000000");
    }

    #[test]
    fn test_display_map_sorted() {
        let mut entries = HashMap::new();
        entries.insert(MapKey::Str("y".into()), Value::Int(2));
        entries.insert(MapKey::Str("x".into()), Value::Int(1));
        assert_eq!(Value::map(entries).to_string(), "{x: 1, y: 2}");
    }

    #[test]
    fn test_display_bytes_escapes() {
        let v = Value::bytes(vec![b'h', b'i', b'\n', 0x01]);
        assert_eq!(v.to_string(), "b\"hi\\n\\x01\"");
    }

    #[test]
    fn test_map_key_round_trip() {
        let key = MapKey::from_value(&Value::Int(7)).unwrap();
        assert_eq!(key.to_value(), Value::Int(7));
        assert!(MapKey::from_value(&Value::Float(1.5)).is_none());
    }

    #[test]
    fn test_upvalue_cell_close() {
        let cell = UpvalueCell::open(4);
        assert_eq!(cell.open_slot(), Some(4));
        cell.close(Value::Int(9));
        assert_eq!(cell.open_slot(), None);
        match &*cell.location.lock().unwrap() {
            UpvalueState::Closed(v) => assert_eq!(*v, Value::Int(9)),
            UpvalueState::Open(_) => panic!("cell should be closed"),
        };
    }
}
