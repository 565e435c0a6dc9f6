use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::block::HandleBlock;
use super::tagged::{FALSE_HANDLE, NIL_HANDLE, TRUE_HANDLE, UNDEF_HANDLE, UNSET_HANDLE};
use crate::error::Result;
use crate::value::{ManagedObject, ObjectRef, Value};

pub type WrapperRef = Arc<ValueWrapper>;

static TRUE_WRAPPER: Lazy<WrapperRef> =
    Lazy::new(|| ValueWrapper::with_handle(WrappedValue::Bool(true), TRUE_HANDLE));
static FALSE_WRAPPER: Lazy<WrapperRef> =
    Lazy::new(|| ValueWrapper::with_handle(WrappedValue::Bool(false), FALSE_HANDLE));
static NIL_WRAPPER: Lazy<WrapperRef> =
    Lazy::new(|| ValueWrapper::with_handle(WrappedValue::Nil, NIL_HANDLE));
static UNDEF_WRAPPER: Lazy<WrapperRef> =
    Lazy::new(|| ValueWrapper::with_handle(WrappedValue::NotProvided, UNDEF_HANDLE));

/// What a wrapper stands for on the managed side.
#[derive(Debug, Clone)]
pub enum WrappedValue {
    Nil,
    Bool(bool),
    NotProvided,
    Integer(i64),
    Float(f64),
    /// The object owns its wrapper, so the back edge is weak.
    Object(Weak<ManagedObject>),
}

/// Managed-side box pairing a value with its (possibly unset) native handle.
pub struct ValueWrapper {
    value: WrappedValue,
    handle: AtomicU64,
    /// Keeps the issuing block alive while this handle is live. Also serves as
    /// the lock serializing handle minting for this wrapper.
    block: Mutex<Option<Arc<HandleBlock>>>,
}

impl ValueWrapper {
    pub(crate) fn with_handle(value: WrappedValue, handle: u64) -> WrapperRef {
        Arc::new(Self {
            value,
            handle: AtomicU64::new(handle),
            block: Mutex::new(None),
        })
    }

    pub(crate) fn unset(value: WrappedValue) -> WrapperRef {
        Self::with_handle(value, UNSET_HANDLE)
    }

    pub(crate) fn for_object(object: &ObjectRef) -> WrapperRef {
        Self::unset(WrappedValue::Object(Arc::downgrade(object)))
    }

    pub fn true_wrapper() -> WrapperRef {
        TRUE_WRAPPER.clone()
    }

    pub fn false_wrapper() -> WrapperRef {
        FALSE_WRAPPER.clone()
    }

    pub fn boolean(value: bool) -> WrapperRef {
        if value {
            Self::true_wrapper()
        } else {
            Self::false_wrapper()
        }
    }

    pub fn nil_wrapper() -> WrapperRef {
        NIL_WRAPPER.clone()
    }

    pub fn undef_wrapper() -> WrapperRef {
        UNDEF_WRAPPER.clone()
    }

    pub fn wrapped(&self) -> &WrappedValue {
        &self.value
    }

    /// The managed value, or `None` once a wrapped object has been dropped.
    pub fn value(&self) -> Option<Value> {
        Some(match &self.value {
            WrappedValue::Nil => Value::Nil,
            WrappedValue::Bool(b) => Value::Bool(*b),
            WrappedValue::NotProvided => Value::NotProvided,
            WrappedValue::Integer(i) => Value::Integer(*i),
            WrappedValue::Float(x) => Value::Float(*x),
            WrappedValue::Object(object) => Value::Object(object.upgrade()?),
        })
    }

    /// The handle, if one has been assigned.
    pub fn handle(&self) -> Option<u64> {
        match self.handle.load(Ordering::Acquire) {
            UNSET_HANDLE => None,
            handle => Some(handle),
        }
    }

    pub fn has_handle(&self) -> bool {
        self.handle().is_some()
    }

    /// Objects that must resolve from every runtime get shared-tier handles.
    pub fn needs_shared_handle(&self) -> bool {
        match &self.value {
            WrappedValue::Object(object) => object.upgrade().is_some_and(|o| o.is_shareable()),
            _ => false,
        }
    }

    /// Base address of the block that issued this wrapper's handle.
    pub fn block_base(&self) -> Option<u64> {
        self.block.lock().as_ref().map(|block| block.base())
    }

    /// A strong value keeping both this wrapper and its handle alive.
    ///
    /// For objects that is the object itself (it owns the wrapper); for
    /// everything else the wrapper. `None` if the object is already gone.
    pub fn retain(self: &Arc<Self>) -> Option<Value> {
        match &self.value {
            WrappedValue::Object(object) => object.upgrade().map(Value::Object),
            _ => Some(Value::Wrapper(self.clone())),
        }
    }

    /// Return the assigned handle or assign one with `mint`.
    ///
    /// `mint` runs at most once per wrapper, under the wrapper's lock, and
    /// returns the new handle together with the block that issued it.
    pub(crate) fn handle_or_mint<F>(self: &Arc<Self>, mint: F) -> Result<u64>
    where
        F: FnOnce(&WrapperRef) -> Result<(u64, Arc<HandleBlock>)>,
    {
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }

        let mut block = self.block.lock();
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }
        let (handle, issued_by) = mint(self)?;
        *block = Some(issued_by);
        self.handle.store(handle, Ordering::Release);
        Ok(handle)
    }
}

impl fmt::Debug for ValueWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ValueWrapper");
        out.field("value", &self.value);
        match self.handle() {
            Some(handle) => out.field("handle", &format_args!("0x{handle:x}")),
            None => out.field("handle", &"unset"),
        };
        out.finish()
    }
}
