//! Per-thread execution state.
//!
//! An [`ExecutionContext`] is where handles get minted: it owns the thread's
//! current local block, its stack of marking scopes and its safepoint.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CextError, Result};
use crate::handle::block::HandleBlock;
use crate::handle::registry::HandleManager;
use crate::handle::wrapper::WrapperRef;
use crate::marking::MarkerStack;
use crate::value::Value;

/// Requests that a thread stop at its next safepoint.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    flag: Arc<AtomicBool>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Polled at native call boundaries and while blocked on the native call lock.
#[derive(Debug, Default)]
pub struct Safepoint {
    flag: Arc<AtomicBool>,
}

impl Safepoint {
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            flag: self.flag.clone(),
        }
    }

    /// Consume a pending interrupt request.
    pub fn check(&self) -> Result<()> {
        if self.flag.swap(false, Ordering::AcqRel) {
            Err(CextError::Interrupted)
        } else {
            Ok(())
        }
    }
}

pub struct ExecutionContext {
    pub(crate) manager: Arc<HandleManager>,
    local_block: Option<Arc<HandleBlock>>,
    pub(crate) markers: Arc<Mutex<MarkerStack>>,
    safepoint: Safepoint,
}

impl ExecutionContext {
    pub(crate) fn new(manager: Arc<HandleManager>) -> Self {
        Self {
            manager,
            local_block: None,
            markers: Arc::new(Mutex::new(MarkerStack::new())),
            safepoint: Safepoint::default(),
        }
    }

    pub fn manager(&self) -> &Arc<HandleManager> {
        &self.manager
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub fn interrupter(&self) -> Interrupter {
        self.safepoint.interrupter()
    }

    /// The block new local handles are currently appended to.
    pub fn current_block(&self) -> Option<&Arc<HandleBlock>> {
        self.local_block.as_ref()
    }

    /// The native handle for `wrapper`, minting one on first use.
    ///
    /// Objects flagged shareable get a shared-tier handle; everything else
    /// goes into this thread's local block.
    pub fn to_native(&mut self, wrapper: &WrapperRef) -> Result<u64> {
        self.manager.mint(&mut self.local_block, wrapper)
    }

    /// Wrap `value` and mint its handle.
    ///
    /// The wrapper is kept alive by the current marking scope, so the handle
    /// stays valid at least until that scope is popped.
    pub fn wrap_to_native(&mut self, value: &Value) -> Result<u64> {
        let wrapper = self.manager.wrap(value)?;
        self.keep_object(&wrapper);
        self.to_native(&wrapper)
    }

    pub fn unwrap_native(&self, handle: u64) -> Result<Value> {
        self.manager.unwrap_handle(handle)
    }

    /// Abandon the current local block and start a fresh one.
    ///
    /// Returns the new block's base address. The old block stays alive for
    /// as long as any wrapper that it issued.
    pub fn new_handle_block(&mut self) -> u64 {
        // Release our reference first so a block with no live handles is
        // reclaimed, and its address reused, by the allocation below.
        self.local_block = None;
        let block = self.manager.allocate_local_block();
        let base = block.base();
        debug!(base = format_args!("0x{base:x}"), "rolled over local handle block");
        self.local_block = Some(block);
        base
    }

    /// Safepoint poll: honour interrupts and reclaim dead blocks.
    pub fn poll(&mut self) -> Result<()> {
        self.safepoint.check()?;
        self.manager.process_reclaimed();
        Ok(())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("local_block", &self.local_block)
            .field(
                "marking_depth",
                &self.markers.try_lock().map(|markers| markers.depth()),
            )
            .finish()
    }
}
