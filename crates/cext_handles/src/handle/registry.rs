//! Block registries and the objects that own them.
//!
//! [`HandleSpace`] is process-wide: it owns the block address allocator, the
//! shared tier (handles that must resolve from every runtime) and the symbol
//! table. [`HandleManager`] belongs to one runtime and owns that runtime's
//! local tier. A block index is published in exactly one of the two tiers,
//! since both draw their bases from the same allocator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};

use super::allocator::BlockAllocator;
use super::block::{HandleBlock, ReclaimedBlock, Tier};
use super::tagged::{block_index, encode_integer, is_tagged_object, slot_index};
use super::wrapper::{ValueWrapper, WrappedValue, WrapperRef};
use crate::config::HandleConfig;
use crate::context::ExecutionContext;
use crate::error::{CextError, Result};
use crate::marking::MarkingService;
use crate::native_call::NativeCallLock;
use crate::symbol::SymbolTable;
use crate::value::Value;

static GLOBAL_SPACE: Lazy<Arc<HandleSpace>> = Lazy::new(HandleSpace::new);

/// Block-index addressed table of weakly held blocks.
///
/// Entries are only ever filled in or cleared after their block died, so a
/// reader racing with a writer sees either the old or the new entry, both of
/// which are valid answers.
#[derive(Default)]
pub(crate) struct BlockTable {
    blocks: RwLock<Vec<Weak<HandleBlock>>>,
}

impl BlockTable {
    pub(crate) fn get(&self, index: usize) -> Option<Arc<HandleBlock>> {
        self.blocks.read().get(index)?.upgrade()
    }

    pub(crate) fn insert(&self, block: &Arc<HandleBlock>) {
        let index = block.index();
        let mut blocks = self.blocks.write();
        if blocks.len() <= index {
            blocks.resize_with(index + 1, Weak::new);
        }
        blocks[index] = Arc::downgrade(block);
    }

    /// Clear `index` unless a live block occupies it.
    pub(crate) fn clear_if_dead(&self, index: usize) {
        let mut blocks = self.blocks.write();
        if let Some(entry) = blocks.get_mut(index)
            && entry.strong_count() == 0
        {
            *entry = Weak::new();
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.blocks
            .read()
            .iter()
            .filter(|block| block.strong_count() > 0)
            .count()
    }
}

/// Process-wide handle state shared by every runtime.
pub struct HandleSpace {
    allocator: BlockAllocator,
    shared_blocks: BlockTable,
    /// Current shared block. The mutex is the shared-tier installation lock.
    shared_current: Mutex<Option<Arc<HandleBlock>>>,
    reclaim_tx: Sender<ReclaimedBlock>,
    reclaim_rx: Receiver<ReclaimedBlock>,
    blocks_reclaimed: AtomicU64,
    symbols: SymbolTable,
}

impl HandleSpace {
    pub fn new() -> Arc<Self> {
        let (reclaim_tx, reclaim_rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            allocator: BlockAllocator::new(),
            shared_blocks: BlockTable::default(),
            shared_current: Mutex::new(None),
            reclaim_tx,
            reclaim_rx,
            blocks_reclaimed: AtomicU64::new(0),
            symbols: SymbolTable::new(),
        })
    }

    /// The space used by the C ABI entry points.
    pub fn global() -> Arc<Self> {
        GLOBAL_SPACE.clone()
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn shared_block(&self, index: usize) -> Option<Arc<HandleBlock>> {
        self.shared_blocks.get(index)
    }

    pub(crate) fn allocate_block(&self, tier: Tier, reclaim: Sender<ReclaimedBlock>) -> Arc<HandleBlock> {
        self.process_reclaimed();
        let base = self.allocator.allocate();
        debug!(base = format_args!("0x{base:x}"), ?tier, "allocated handle block");
        HandleBlock::new(base, tier, reclaim)
    }

    /// Append `wrapper` to the current shared block, installing a new one
    /// when it is absent or full. Exactly one racing thread installs the next
    /// block; the others retry their append against it.
    pub(crate) fn append_shared(&self, wrapper: &WrapperRef) -> (u64, Arc<HandleBlock>) {
        loop {
            let current = self.shared_current.lock().clone();
            if let Some(block) = current
                && let Some(handle) = block.try_append(wrapper)
            {
                return (handle, block);
            }

            let mut current = self.shared_current.lock();
            if current.as_ref().is_some_and(|block| !block.is_full()) {
                continue;
            }
            let block = self.allocate_block(Tier::Shared, self.reclaim_tx.clone());
            self.shared_blocks.insert(&block);
            *current = Some(block);
        }
    }

    /// Return the addresses of dead shared blocks to the allocator.
    pub fn process_reclaimed(&self) -> usize {
        let mut reclaimed = 0;
        for block in self.reclaim_rx.try_iter() {
            self.release_block(&self.shared_blocks, block);
            reclaimed += 1;
        }
        reclaimed
    }

    fn release_block(&self, table: &BlockTable, block: ReclaimedBlock) {
        table.clear_if_dead(block_index(block.base));
        self.allocator.release(block.base);
        self.blocks_reclaimed.fetch_add(1, Ordering::Relaxed);
        debug!(base = format_args!("0x{:x}", block.base), tier = ?block.tier, "reclaimed handle block");
    }
}

/// Diagnostic snapshot of handle allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandleStats {
    /// Handles minted by this manager (0 unless `handle_statistics` is on)
    pub handles_minted: u64,
    /// Blocks handed out by the shared allocator
    pub blocks_allocated: u64,
    /// Allocations served from the freelist
    pub blocks_recycled: u64,
    /// Blocks whose address went back to the freelist
    pub blocks_reclaimed: u64,
    /// Addresses currently waiting on the freelist
    pub free_blocks: usize,
    /// Next never-used block address
    pub address_cursor: u64,
    pub live_local_blocks: usize,
    pub live_shared_blocks: usize,
}

/// Handle registry of one managed runtime.
pub struct HandleManager {
    space: Arc<HandleSpace>,
    config: HandleConfig,
    local_blocks: BlockTable,
    reclaim_tx: Sender<ReclaimedBlock>,
    reclaim_rx: Receiver<ReclaimedBlock>,
    integer_cache: Mutex<AHashMap<i64, WrapperRef>>,
    handles_minted: AtomicU64,
    kept_alive: Mutex<Vec<Value>>,
    marking: MarkingService,
    native_lock: NativeCallLock,
}

impl HandleManager {
    pub fn new(space: Arc<HandleSpace>, config: HandleConfig) -> Arc<Self> {
        let (reclaim_tx, reclaim_rx) = crossbeam_channel::unbounded();
        let marking = MarkingService::new(config.marking_cache_size);
        Arc::new(Self {
            space,
            config,
            local_blocks: BlockTable::default(),
            reclaim_tx,
            reclaim_rx,
            integer_cache: Mutex::new(AHashMap::new()),
            handles_minted: AtomicU64::new(0),
            kept_alive: Mutex::new(Vec::new()),
            marking,
            native_lock: NativeCallLock::new(),
        })
    }

    /// A manager with its own private handle space and default settings.
    pub fn standalone() -> Arc<Self> {
        Self::new(HandleSpace::new(), HandleConfig::default())
    }

    /// Create the per-thread state used to mint handles and run native calls.
    pub fn attach(self: &Arc<Self>) -> ExecutionContext {
        ExecutionContext::new(self.clone())
    }

    pub fn space(&self) -> &Arc<HandleSpace> {
        &self.space
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    pub fn marking(&self) -> &MarkingService {
        &self.marking
    }

    pub fn native_lock(&self) -> &NativeCallLock {
        &self.native_lock
    }

    /// The block that issued `handle`, searching the local tier first.
    pub fn lookup_block(&self, handle: u64) -> Option<Arc<HandleBlock>> {
        if !is_tagged_object(handle) {
            return None;
        }
        let index = block_index(handle);
        self.local_blocks
            .get(index)
            .or_else(|| self.space.shared_block(index))
    }

    /// Resolve an object handle to its live wrapper.
    pub fn wrapper_from_handle(&self, handle: u64) -> Result<WrapperRef> {
        self.lookup_block(handle)
            .and_then(|block| block.get(slot_index(handle)))
            .ok_or(CextError::HandleNotFound(handle))
    }

    /// Wrapper for an integer. Tagged-range values are interned, up to the
    /// configured limit, so repeated crossings see the same wrapper.
    pub(crate) fn integer_wrapper(&self, value: i64) -> WrapperRef {
        let Some(handle) = encode_integer(value) else {
            return ValueWrapper::unset(WrappedValue::Integer(value));
        };
        let limit = self.config.integer_cache_limit;
        if limit == 0 {
            return ValueWrapper::with_handle(WrappedValue::Integer(value), handle);
        }

        let mut cache = self.integer_cache.lock();
        if let Some(wrapper) = cache.get(&value) {
            return wrapper.clone();
        }
        let wrapper = ValueWrapper::with_handle(WrappedValue::Integer(value), handle);
        if cache.len() < limit {
            cache.insert(value, wrapper.clone());
        }
        wrapper
    }

    /// Give `wrapper` a handle if it does not have one yet.
    ///
    /// `current` is the calling thread's local block; it is replaced when
    /// absent or full.
    pub(crate) fn mint(
        &self,
        current: &mut Option<Arc<HandleBlock>>,
        wrapper: &WrapperRef,
    ) -> Result<u64> {
        wrapper.handle_or_mint(|wrapper| {
            let (handle, block) = if wrapper.needs_shared_handle() {
                self.space.append_shared(wrapper)
            } else {
                self.append_local(current, wrapper)
            };

            if self.config.handle_statistics {
                self.handles_minted.fetch_add(1, Ordering::Relaxed);
            }
            if self.config.keep_handles_alive
                && let Some(retained) = wrapper.retain()
            {
                self.kept_alive.lock().push(retained);
            }
            trace!(handle = format_args!("0x{handle:x}"), tier = ?block.tier(), "minted handle");
            Ok((handle, block))
        })
    }

    fn append_local(
        &self,
        current: &mut Option<Arc<HandleBlock>>,
        wrapper: &WrapperRef,
    ) -> (u64, Arc<HandleBlock>) {
        loop {
            if let Some(block) = current.as_ref()
                && let Some(handle) = block.try_append(wrapper)
            {
                return (handle, block.clone());
            }
            *current = Some(self.allocate_local_block());
        }
    }

    /// Allocate and publish a fresh local-tier block.
    pub(crate) fn allocate_local_block(&self) -> Arc<HandleBlock> {
        self.process_reclaimed();
        let block = self.space.allocate_block(Tier::Local, self.reclaim_tx.clone());
        self.local_blocks.insert(&block);
        block
    }

    /// Return the addresses of dead blocks, local and shared, to the
    /// allocator. Returns how many blocks were reclaimed.
    pub fn process_reclaimed(&self) -> usize {
        let mut reclaimed = 0;
        for block in self.reclaim_rx.try_iter() {
            self.space.release_block(&self.local_blocks, block);
            reclaimed += 1;
        }
        reclaimed + self.space.process_reclaimed()
    }

    /// Handles minted so far; always 0 unless `handle_statistics` is on.
    pub fn total_handle_allocation_count(&self) -> u64 {
        self.handles_minted.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HandleStats {
        let allocator = self.space.allocator();
        HandleStats {
            handles_minted: self.total_handle_allocation_count(),
            blocks_allocated: allocator.allocated(),
            blocks_recycled: allocator.recycled(),
            blocks_reclaimed: self.space.blocks_reclaimed.load(Ordering::Relaxed),
            free_blocks: allocator.free_len(),
            address_cursor: allocator.cursor(),
            live_local_blocks: self.local_blocks.live(),
            live_shared_blocks: self.space.shared_blocks.live(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::tagged::{ALLOCATION_BASE, BLOCK_BYTE_SIZE, MAX_TAGGED_INTEGER};

    #[test]
    fn integer_wrappers_are_interned_up_to_limit() {
        let config = HandleConfig {
            integer_cache_limit: 2,
            ..HandleConfig::default()
        };
        let manager = HandleManager::new(HandleSpace::new(), config);
        assert!(Arc::ptr_eq(&manager.integer_wrapper(1), &manager.integer_wrapper(1)));
        assert!(Arc::ptr_eq(&manager.integer_wrapper(2), &manager.integer_wrapper(2)));
        // Cache is full: still correct, just not interned.
        let a = manager.integer_wrapper(3);
        let b = manager.integer_wrapper(3);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.handle(), b.handle());
    }

    #[test]
    fn large_integers_have_no_handle_yet() {
        let manager = HandleManager::standalone();
        assert!(!manager.integer_wrapper(MAX_TAGGED_INTEGER + 1).has_handle());
        assert!(manager.integer_wrapper(MAX_TAGGED_INTEGER).has_handle());
    }

    #[test]
    fn unregistered_block_is_not_found() {
        let manager = HandleManager::standalone();
        let handle = ALLOCATION_BASE + 40 * BLOCK_BYTE_SIZE + 8;
        assert_eq!(
            manager.wrapper_from_handle(handle).unwrap_err(),
            CextError::HandleNotFound(handle)
        );
        assert!(manager.lookup_block(7).is_none());
    }

    #[test]
    fn table_clears_only_dead_entries() {
        let table = BlockTable::default();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let block = HandleBlock::new(ALLOCATION_BASE + 2 * BLOCK_BYTE_SIZE, Tier::Local, tx);
        table.insert(&block);
        table.clear_if_dead(2);
        assert!(table.get(2).is_some());
        assert_eq!(table.live(), 1);
        drop(block);
        table.clear_if_dead(2);
        assert!(table.get(2).is_none());
        assert!(table.get(99).is_none());
    }
}
