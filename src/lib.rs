//! Native extension bridge.
//!
//! Re-exports the handle subsystem and wires up process-level setup:
//! logging and configuration.
//!
//! ```no_run
//! use cext_bridge::{CallOptions, ExecutionContext, Result, Value};
//!
//! let runtime = cext_bridge::init();
//! let mut ctx = runtime.attach();
//! let identity = |_: &mut ExecutionContext, args: &[u64]| -> Result<u64> { Ok(args[0]) };
//! let out = ctx
//!     .call_native(&identity, &[Value::Integer(7)], CallOptions::default())
//!     .unwrap();
//! assert_eq!(out, Value::Integer(7));
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

pub use cext_handles::{
    BlockAllocator, CallOptions, CextError, ExecutionContext, ForeignObject, HandleBlock,
    HandleConfig, HandleManager, HandleSpace, HandleStats, Interrupter, ManagedObject,
    MarkerAction, MarkingScope, MarkingService, NativeCallLock, NativeFunction, NativePointer,
    ObjectKind, ObjectRef, Result, Safepoint, SymbolTable, Tier, Value, ValueWrapper,
    WrappedValue, WrapperRef, ffi, tagged,
};
pub use cext_utils::init_logging;

/// Initialise logging and return the process-global runtime used by the C
/// entry points.
pub fn init() -> Arc<HandleManager> {
    init_logging();
    let manager = ffi::global_manager();
    info!(config = ?manager.config(), "native extension bridge ready");
    manager
}

/// Build configuration from an optional TOML file overlaid with `CEXT_*`
/// environment variables.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<HandleConfig> {
    let config = match path {
        Some(path) => HandleConfig::from_file(path)
            .with_context(|| format!("failed to load handle config from {}", path.display()))?,
        None => HandleConfig::default(),
    };
    Ok(config.merge_with_env())
}

/// A runtime with its own local tier sharing the process-wide handle space.
pub fn new_runtime(config: HandleConfig) -> Arc<HandleManager> {
    HandleManager::new(HandleSpace::global(), config)
}
