//! Handle subsystem bridging a managed object heap and native extension code.
//!
//! Managed values cross into native code as 64-bit handles. Immediates and
//! small integers are encoded directly in the handle bits; everything else
//! gets a slot in a handle block, published either in the owning runtime's
//! local tier or in the process-wide shared tier.

pub mod config;
pub mod context;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod marking;
pub mod native_call;
pub mod symbol;
pub mod value;

pub use config::HandleConfig;
pub use context::{ExecutionContext, Interrupter, Safepoint};
pub use error::{CextError, Result};
pub use handle::{
    BlockAllocator, HandleBlock, HandleManager, HandleSpace, HandleStats, Tier, ValueWrapper,
    WrappedValue, WrapperRef, tagged,
};
pub use marking::{MarkerAction, MarkingScope, MarkingService};
pub use native_call::{CallOptions, NativeCallLock, NativeFunction};
pub use symbol::SymbolTable;
pub use value::{ForeignObject, ManagedObject, NativePointer, ObjectKind, ObjectRef, Value};
