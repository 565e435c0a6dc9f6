//! Invoking native functions with handle arguments.

use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::context::{ExecutionContext, Safepoint};
use crate::error::Result;
use crate::handle::wrapper::WrapperRef;
use crate::value::Value;

/// How long a blocked [`NativeCallLock::acquire_interruptibly`] waits between
/// safepoint polls.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A function implemented in native code.
///
/// Receives the raw handles of its arguments and returns the raw handle of
/// its result.
pub trait NativeFunction {
    fn call(&self, ctx: &mut ExecutionContext, args: &[u64]) -> Result<u64>;
}

impl<F> NativeFunction for F
where
    F: Fn(&mut ExecutionContext, &[u64]) -> Result<u64>,
{
    fn call(&self, ctx: &mut ExecutionContext, args: &[u64]) -> Result<u64> {
        self(ctx, args)
    }
}

/// Frame information recorded on the marking scope of a call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub keywords_given: bool,
    pub frame_self: Option<Value>,
    pub block: Option<Value>,
}

/// Global lock serializing native calls. Reentrant per thread.
#[derive(Debug, Default)]
pub struct NativeCallLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl NativeCallLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, blocking while another thread holds it.
    ///
    /// Returns `false` if the calling thread already owned it, in which case
    /// the matching [`Self::release`] must be skipped.
    pub fn acquire(&self) -> bool {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner == Some(me) {
            return false;
        }
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(me);
        true
    }

    /// Like [`Self::acquire`], but polls `safepoint` while waiting.
    pub fn acquire_interruptibly(&self, safepoint: &Safepoint) -> Result<bool> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner == Some(me) {
            return Ok(false);
        }
        while owner.is_some() {
            safepoint.check()?;
            self.released.wait_for(&mut owner, LOCK_POLL_INTERVAL);
        }
        *owner = Some(me);
        Ok(true)
    }

    /// Give the lock up if the calling thread holds it.
    pub fn release(&self) -> bool {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner != Some(me) {
            return false;
        }
        *owner = None;
        drop(owner);
        self.released.notify_one();
        true
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }
}

impl ExecutionContext {
    /// Call `function` with `args` converted to handles.
    ///
    /// The arguments stay alive, and their handles valid, until the call
    /// returns. The result handle is decoded before the call's marking scope
    /// is popped.
    pub fn call_native(
        &mut self,
        function: &dyn NativeFunction,
        args: &[Value],
        options: CallOptions,
    ) -> Result<Value> {
        self.poll()?;
        let value = if self.manager.config().native_call_lock {
            self.call_with_lock(|ctx| ctx.invoke(function, args, options))?
        } else {
            self.invoke(function, args, options)?
        };
        self.poll()?;
        Ok(value)
    }

    /// Run `body` holding the native call lock.
    pub fn call_with_lock<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let manager = self.manager.clone();
        let acquired = manager.native_lock().acquire_interruptibly(self.safepoint())?;
        let outcome = body(self);
        if acquired {
            manager.native_lock().release();
        }
        outcome
    }

    /// Run `body` with the native call lock temporarily released, for native
    /// code that blocks. The lock is re-taken afterwards if it was held.
    pub fn call_without_lock<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let manager = self.manager.clone();
        let released = manager.native_lock().release();
        let outcome = body(self);
        if released {
            manager.native_lock().acquire();
        }
        outcome
    }

    fn invoke(
        &mut self,
        function: &dyn NativeFunction,
        args: &[Value],
        options: CallOptions,
    ) -> Result<Value> {
        let wrappers = args
            .iter()
            .map(|arg| self.manager.wrap(arg))
            .collect::<Result<Vec<WrapperRef>>>()?;

        self.push_marking_scope(options.keywords_given, options.frame_self, options.block);
        let outcome = self.invoke_in_scope(function, &wrappers);
        self.run_pending_markers();
        self.pop_marking_scope();
        outcome
    }

    fn invoke_in_scope(&mut self, function: &dyn NativeFunction, wrappers: &[WrapperRef]) -> Result<Value> {
        let mut handles = Vec::with_capacity(wrappers.len());
        for wrapper in wrappers {
            self.keep_object(wrapper);
            handles.push(self.to_native(wrapper)?);
        }
        trace!(args = handles.len(), "invoking native function");
        let result = {
            let _active = self.marking_target().enter();
            function.call(self, &handles)?
        };
        self.unwrap_native(result)
    }
}
