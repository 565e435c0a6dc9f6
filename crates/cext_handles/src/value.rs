//! The slice of the managed object model the handle subsystem needs.
//!
//! A [`ManagedObject`] owns its cached [`ValueWrapper`]; the wrapper only
//! refers back weakly, so an object and its handle die together.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::handle::wrapper::{ValueWrapper, WrapperRef};

pub type ObjectRef = Arc<ManagedObject>;
pub type ForeignRef = Arc<dyn ForeignObject>;

/// A value crossing the native boundary.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    /// Optional argument that was not supplied by the caller.
    NotProvided,
    Integer(i64),
    Float(f64),
    Object(ObjectRef),
    Wrapper(WrapperRef),
    /// A value from outside the managed object model.
    Foreign(ForeignRef),
}

impl Value {
    pub fn object(kind: ObjectKind) -> Self {
        Value::Object(ManagedObject::new(kind))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::NotProvided => "not provided",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Object(object) => object.kind().name(),
            Value::Wrapper(_) => "wrapper",
            Value::Foreign(_) => "foreign object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::NotProvided, Value::NotProvided) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Wrapper(a), Value::Wrapper(b)) => Arc::ptr_eq(a, b),
            (Value::Foreign(a), Value::Foreign(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::NotProvided => write!(f, "<not provided>"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Object(object) => write!(f, "{object:?}"),
            Value::Wrapper(wrapper) => write!(f, "{wrapper:?}"),
            Value::Foreign(_) => write!(f, "<foreign>"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<ObjectRef> for Value {
    fn from(value: ObjectRef) -> Self {
        Value::Object(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Object { class_name: String },
    Symbol { name: String },
    String { bytes: Vec<u8> },
}

impl ObjectKind {
    pub fn plain(class_name: impl Into<String>) -> Self {
        ObjectKind::Object {
            class_name: class_name.into(),
        }
    }

    pub fn string(bytes: impl Into<Vec<u8>>) -> Self {
        ObjectKind::String {
            bytes: bytes.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Object { .. } => "object",
            ObjectKind::Symbol { .. } => "symbol",
            ObjectKind::String { .. } => "string",
        }
    }
}

/// Identity-bearing heap object of the managed runtime.
pub struct ManagedObject {
    id: u64,
    kind: ObjectKind,
    shareable: bool,
    wrapper: OnceCell<WrapperRef>,
    wrapper_lock: Mutex<()>,
    hidden: Mutex<AHashMap<String, Value>>,
    marked_objects: Mutex<Vec<Value>>,
}

impl ManagedObject {
    pub fn new(kind: ObjectKind) -> ObjectRef {
        Self::build(kind, false)
    }

    /// An immutable object visible from every runtime, whose handle lives in
    /// the shared tier.
    pub fn new_shareable(kind: ObjectKind) -> ObjectRef {
        Self::build(kind, true)
    }

    fn build(kind: ObjectKind, shareable: bool) -> ObjectRef {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            shareable,
            wrapper: OnceCell::new(),
            wrapper_lock: Mutex::new(()),
            hidden: Mutex::new(AHashMap::new()),
            marked_objects: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    pub fn is_shareable(&self) -> bool {
        self.shareable
    }

    pub fn symbol_name(&self) -> Option<&str> {
        match &self.kind {
            ObjectKind::Symbol { name } => Some(name),
            _ => None,
        }
    }

    /// The cached wrapper, if this object has crossed into native code.
    pub fn cached_wrapper(&self) -> Option<&WrapperRef> {
        self.wrapper.get()
    }

    /// Return the cached wrapper or create it.
    ///
    /// Unlocked read first, then re-check under the object's lock so exactly
    /// one wrapper is ever created per object.
    pub(crate) fn wrapper_or_create(self: &Arc<Self>) -> WrapperRef {
        if let Some(wrapper) = self.wrapper.get() {
            return wrapper.clone();
        }

        let _guard = self.wrapper_lock.lock();
        if let Some(wrapper) = self.wrapper.get() {
            return wrapper.clone();
        }
        let wrapper = ValueWrapper::for_object(self);
        // Cannot fail: the slot is only written while holding `wrapper_lock`.
        let _ = self.wrapper.set(wrapper.clone());
        wrapper
    }

    pub fn hidden_variable_get(&self, name: &str) -> Option<Value> {
        self.hidden.lock().get(name).cloned()
    }

    pub fn hidden_variable_set(&self, name: impl Into<String>, value: Value) {
        self.hidden.lock().insert(name.into(), value);
    }

    /// Replace the objects kept reachable on behalf of this object's native
    /// struct with the result of the latest mark pass.
    pub fn set_marked_objects(&self, marked: Vec<Value>) {
        *self.marked_objects.lock() = marked;
    }

    pub fn marked_objects(&self) -> Vec<Value> {
        self.marked_objects.lock().clone()
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ObjectKind::Symbol { name } => write!(f, ":{name}"),
            kind => write!(f, "#<{} {}>", kind.name(), self.id),
        }
    }
}

/// Interop view of a value that does not belong to the managed model.
pub trait ForeignObject: Send + Sync {
    fn is_pointer(&self) -> bool;

    /// Raw pointer bits. Failure carries the interop layer's message.
    fn as_pointer(&self) -> Result<u64, String>;
}

/// A foreign value that is just a raw native word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativePointer(pub u64);

impl ForeignObject for NativePointer {
    fn is_pointer(&self) -> bool {
        true
    }

    fn as_pointer(&self) -> Result<u64, String> {
        Ok(self.0)
    }
}

impl Value {
    pub fn native_pointer(raw: u64) -> Self {
        Value::Foreign(Arc::new(NativePointer(raw)))
    }
}
