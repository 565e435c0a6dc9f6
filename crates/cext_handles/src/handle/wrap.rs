//! Conversions between managed values, wrappers and native handles.

use super::registry::HandleManager;
use super::tagged::{
    FALSE_HANDLE, NIL_HANDLE, TRUE_HANDLE, UNDEF_HANDLE, UNSET_HANDLE, decode_integer,
    is_tagged_integer, is_tagged_object,
};
use super::wrapper::{ValueWrapper, WrappedValue, WrapperRef};
use crate::error::{CextError, Result};
use crate::value::{ForeignRef, Value};

impl HandleManager {
    /// Produce the wrapper for a managed value.
    ///
    /// Objects always get their own cached wrapper back; immediates map to
    /// the process-wide singletons; tagged-range integers come from the
    /// integer cache. Floats and out-of-range integers get a fresh wrapper
    /// whose handle is minted on first crossing.
    pub fn wrap(&self, value: &Value) -> Result<WrapperRef> {
        match value {
            Value::Bool(b) => Ok(ValueWrapper::boolean(*b)),
            Value::Nil => Ok(ValueWrapper::nil_wrapper()),
            Value::NotProvided => Ok(ValueWrapper::undef_wrapper()),
            Value::Integer(i) => Ok(self.integer_wrapper(*i)),
            Value::Float(x) => Ok(ValueWrapper::unset(WrappedValue::Float(*x))),
            Value::Object(object) => Ok(object.wrapper_or_create()),
            Value::Wrapper(_) => Err(CextError::invalid_argument("Wrapping wrapped object.")),
            Value::Foreign(_) => Err(CextError::invalid_argument(
                "Attempt to wrap something that isn't a managed object",
            )),
        }
    }

    /// Recover the managed value from a wrapper or a raw native pointer.
    pub fn unwrap(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Wrapper(wrapper) => wrapper
                .value()
                .ok_or_else(|| CextError::HandleNotFound(wrapper.handle().unwrap_or(UNSET_HANDLE))),
            Value::Foreign(foreign) => match pointer_bits(foreign)? {
                Some(handle) => self.unwrap_handle(handle),
                None => Err(CextError::invalid_argument("Not a handle or a pointer")),
            },
            _ => Err(CextError::invalid_argument("Not a handle or a pointer")),
        }
    }

    /// Decode a raw native handle.
    pub fn unwrap_handle(&self, handle: u64) -> Result<Value> {
        match handle {
            FALSE_HANDLE => Ok(Value::Bool(false)),
            TRUE_HANDLE => Ok(Value::Bool(true)),
            NIL_HANDLE => Ok(Value::Nil),
            UNDEF_HANDLE => Ok(Value::NotProvided),
            h if is_tagged_integer(h) => Ok(Value::Integer(decode_integer(h))),
            h if is_tagged_object(h) => self
                .wrapper_from_handle(h)?
                .value()
                .ok_or(CextError::HandleNotFound(h)),
            h => Err(CextError::HandleNotFound(h)),
        }
    }

    /// The wrapper behind `value` when it is a wrapper or a resolvable
    /// native pointer; `None` for anything else.
    pub fn to_wrapper(&self, value: &Value) -> Result<Option<WrapperRef>> {
        match value {
            Value::Wrapper(wrapper) => Ok(Some(wrapper.clone())),
            Value::Foreign(foreign) => {
                Ok(pointer_bits(foreign)?.and_then(|handle| self.native_to_wrapper(handle)))
            }
            _ => Ok(None),
        }
    }

    /// The wrapper for a raw handle, if it still resolves.
    pub fn native_to_wrapper(&self, handle: u64) -> Option<WrapperRef> {
        match handle {
            FALSE_HANDLE => Some(ValueWrapper::false_wrapper()),
            TRUE_HANDLE => Some(ValueWrapper::true_wrapper()),
            NIL_HANDLE => Some(ValueWrapper::nil_wrapper()),
            UNDEF_HANDLE => Some(ValueWrapper::undef_wrapper()),
            h if is_tagged_integer(h) => Some(self.integer_wrapper(decode_integer(h))),
            h if is_tagged_object(h) => self.wrapper_from_handle(h).ok(),
            _ => None,
        }
    }
}

fn pointer_bits(foreign: &ForeignRef) -> Result<Option<u64>> {
    if !foreign.is_pointer() {
        return Ok(None);
    }
    foreign.as_pointer().map(Some).map_err(CextError::InvalidArgument)
}
