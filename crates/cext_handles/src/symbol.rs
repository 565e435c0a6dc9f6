//! Interned symbols and their native identifiers.
//!
//! Single-byte symbol names use the byte itself as identifier; every other
//! symbol is identified by its shared-tier handle.

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::context::ExecutionContext;
use crate::error::{CextError, Result};
use crate::value::{ManagedObject, ObjectKind, ObjectRef, Value};

/// Largest identifier reserved for single-byte symbol names.
pub const MAX_SINGLE_BYTE_ID: u64 = 0x7f;

/// Process-wide symbol interning table. Symbols are never collected.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: RwLock<AHashMap<String, ObjectRef>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unique symbol named `name`.
    pub fn intern(&self, name: &str) -> ObjectRef {
        if let Some(symbol) = self.symbols.read().get(name) {
            return symbol.clone();
        }
        self.symbols
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                ManagedObject::new_shareable(ObjectKind::Symbol {
                    name: name.to_string(),
                })
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<ObjectRef> {
        self.symbols.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }
}

fn single_byte_id(name: &str) -> Option<u64> {
    match name.as_bytes() {
        [byte] if (1..=MAX_SINGLE_BYTE_ID).contains(&u64::from(*byte)) => Some(u64::from(*byte)),
        _ => None,
    }
}

impl ExecutionContext {
    /// The symbol for a native identifier.
    pub fn id_to_symbol(&mut self, id: u64) -> Result<Value> {
        if (1..=MAX_SINGLE_BYTE_ID).contains(&id) {
            let name = char::from(id as u8).to_string();
            return Ok(Value::Object(self.manager.space().symbols().intern(&name)));
        }
        match self.unwrap_native(id)? {
            Value::Object(object) if object.symbol_name().is_some() => Ok(Value::Object(object)),
            other => Err(CextError::WrongArgumentType {
                expected: "symbol",
                found: other.type_name().to_string(),
            }),
        }
    }

    /// The native identifier for a symbol.
    pub fn symbol_to_id(&mut self, symbol: &Value) -> Result<u64> {
        let name = symbol
            .as_object()
            .and_then(|object| object.symbol_name())
            .ok_or_else(|| CextError::WrongArgumentType {
                expected: "symbol",
                found: symbol.type_name().to_string(),
            })?;
        match single_byte_id(name) {
            Some(id) => Ok(id),
            None => {
                let wrapper = self.manager.wrap(symbol)?;
                self.to_native(&wrapper)
            }
        }
    }
}
