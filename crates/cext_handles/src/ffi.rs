//! C ABI entry points for native extensions.
//!
//! Every export runs against the process-global [`HandleManager`] and the
//! calling thread's [`ExecutionContext`], created on first use. Failures are
//! reported through a sentinel return value plus a thread-local error message
//! retrievable with [`cext_take_error`].
//!
//! The marking exports go to whichever context is running native code on the
//! calling thread, falling back to the thread's own context.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_char;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::HandleConfig;
use crate::context::ExecutionContext;
use crate::error::{CextError, Result};
use crate::handle::registry::{HandleManager, HandleSpace};
use crate::handle::tagged::{UNDEF_HANDLE, is_native_object};
use crate::marking::MarkingTarget;
use crate::value::Value;

static GLOBAL_MANAGER: Lazy<Arc<HandleManager>> =
    Lazy::new(|| HandleManager::new(HandleSpace::global(), HandleConfig::from_env()));

thread_local! {
    static CONTEXT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// The manager behind the C ABI.
pub fn global_manager() -> Arc<HandleManager> {
    GLOBAL_MANAGER.clone()
}

/// Run `f` on the calling thread's execution context.
///
/// Fails instead of re-entering when the context is already borrowed, e.g.
/// by a Rust caller further up the stack.
pub fn with_thread_context<T>(f: impl FnOnce(&mut ExecutionContext) -> Result<T>) -> Result<T> {
    CONTEXT.with(|slot| {
        let mut slot = slot
            .try_borrow_mut()
            .map_err(|_| CextError::NativeCall("execution context already in use".into()))?;
        let ctx = slot.get_or_insert_with(|| GLOBAL_MANAGER.attach());
        f(ctx)
    })
}

fn store_error(err: &CextError) {
    let message = CString::new(err.to_string())
        .unwrap_or_else(|_| CString::from(c"invalid error message"));
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn or_sentinel<T>(result: Result<T>, sentinel: T) -> T {
    result.unwrap_or_else(|err| {
        store_error(&err);
        sentinel
    })
}

/// Whether `value` points at a natively allocated structure rather than being
/// a handle.
///
/// # Safety
/// This function is safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_is_native_object(value: u64) -> bool {
    is_native_object(value)
}

/// Start a fresh local handle block for the calling thread. Returns its base.
///
/// # Safety
/// Must not be called from inside a mark function of the same thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_new_handle_block() -> u64 {
    or_sentinel(with_thread_context(|ctx| Ok(ctx.new_handle_block())), 0)
}

/// Handles minted so far; 0 unless handle statistics are enabled.
///
/// # Safety
/// This function is safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_handle_allocation_count() -> u64 {
    GLOBAL_MANAGER.total_handle_allocation_count()
}

/// Declare `handle` live for the mark list currently being built.
/// Unresolvable handles are ignored.
///
/// # Safety
/// Only meaningful from inside a mark function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_gc_mark(handle: u64) {
    match MarkingTarget::active() {
        Some(target) => target.mark_handle(handle),
        None => or_sentinel(
            with_thread_context(|ctx| {
                ctx.mark_handle(handle);
                Ok(())
            }),
            (),
        ),
    }
}

/// Keep the object behind `handle` alive for the rest of the current call.
///
/// # Safety
/// This function is safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_gc_guard(handle: u64) {
    match MarkingTarget::active() {
        Some(target) => target.guard_handle(handle),
        None => or_sentinel(
            with_thread_context(|ctx| {
                ctx.gc_guard(&Value::native_pointer(handle));
                Ok(())
            }),
            (),
        ),
    }
}

/// The symbol handle for a native identifier; the undefined handle on error.
///
/// # Safety
/// This function is safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_id2sym(id: u64) -> u64 {
    or_sentinel(
        with_thread_context(|ctx| {
            let symbol = ctx.id_to_symbol(id)?;
            ctx.wrap_to_native(&symbol)
        }),
        UNDEF_HANDLE,
    )
}

/// The native identifier for a symbol handle; 0 on error.
///
/// # Safety
/// This function is safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_sym2id(symbol: u64) -> u64 {
    or_sentinel(
        with_thread_context(|ctx| {
            let symbol = ctx.unwrap_native(symbol)?;
            ctx.symbol_to_id(&symbol)
        }),
        0,
    )
}

/// Take the native call lock. Returns whether this call acquired it.
///
/// # Safety
/// A `true` result must be paired with [`cext_release_lock`] on the same
/// thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_acquire_lock() -> bool {
    GLOBAL_MANAGER.native_lock().acquire()
}

/// Release the native call lock. Returns whether it was held by this thread.
///
/// # Safety
/// This function is safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_release_lock() -> bool {
    GLOBAL_MANAGER.native_lock().release()
}

/// Reclaim dead handle blocks now. Returns how many were reclaimed.
///
/// # Safety
/// This function is safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_process_reclaimed() -> u64 {
    GLOBAL_MANAGER.process_reclaimed() as u64
}

/// Take the calling thread's last error message, or null if there is none.
///
/// # Safety
/// The returned string must be freed with [`cext_free_error`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_take_error() -> *mut c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow_mut()
            .take()
            .map_or(std::ptr::null_mut(), CString::into_raw)
    })
}

/// Free a string returned by [`cext_take_error`].
///
/// # Safety
/// `message` must be null or a pointer obtained from [`cext_take_error`] that
/// has not been freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cext_free_error(message: *mut c_char) {
    if !message.is_null() {
        drop(unsafe { CString::from_raw(message) });
    }
}
