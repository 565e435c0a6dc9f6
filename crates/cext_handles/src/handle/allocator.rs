use parking_lot::Mutex;

use super::tagged::{ALLOCATION_BASE, BLOCK_BYTE_SIZE};

/// Hands out block base addresses: recycled ones first (most recently freed
/// first), then fresh ones from a bump cursor.
pub struct BlockAllocator {
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    next: u64,
    free: Vec<u64>,
    allocated: u64,
    recycled: u64,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self::starting_at(ALLOCATION_BASE)
    }

    fn starting_at(base: u64) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next: base,
                free: Vec::new(),
                allocated: 0,
                recycled: 0,
            }),
        }
    }

    pub fn allocate(&self) -> u64 {
        let mut state = self.state.lock();
        state.allocated += 1;
        if let Some(base) = state.free.pop() {
            state.recycled += 1;
            return base;
        }
        let base = state.next;
        // 2^49 blocks fit above ALLOCATION_BASE; exhausting them is not a
        // practical concern.
        state.next += BLOCK_BYTE_SIZE;
        base
    }

    pub fn release(&self, base: u64) {
        debug_assert_eq!(base % BLOCK_BYTE_SIZE, 0, "unaligned block base 0x{base:x}");
        self.state.lock().free.push(base);
    }

    /// Next never-used base address.
    pub fn cursor(&self) -> u64 {
        self.state.lock().next
    }

    pub fn free_len(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Total calls to [`Self::allocate`].
    pub fn allocated(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Allocations satisfied from the freelist.
    pub fn recycled(&self) -> u64 {
        self.state.lock().recycled
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}
