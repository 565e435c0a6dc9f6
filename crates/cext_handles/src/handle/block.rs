//! Fixed-capacity slabs of handle slots.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use once_cell::sync::OnceCell;

use super::tagged::{BLOCK_SIZE, TAG_BITS, block_index_for_base};
use super::wrapper::{ValueWrapper, WrapperRef};

/// Which registry a block is published in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Visible to the owning runtime only.
    Local,
    /// Visible to every runtime sharing the handle space.
    Shared,
}

/// Posted when the last strong reference to a block goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimedBlock {
    pub base: u64,
    pub tier: Tier,
}

/// A slab of [`BLOCK_SIZE`] handle slots sharing one base address.
///
/// Slots are filled append-only and each is written exactly once; a block is
/// never refilled. Wrappers keep the block alive through their back
/// reference, registries only hold it weakly.
pub struct HandleBlock {
    base: u64,
    tier: Tier,
    count: AtomicUsize,
    slots: Box<[OnceCell<Weak<ValueWrapper>>]>,
    reclaim: Sender<ReclaimedBlock>,
}

impl HandleBlock {
    pub(crate) fn new(base: u64, tier: Tier, reclaim: Sender<ReclaimedBlock>) -> Arc<Self> {
        let slots = (0..BLOCK_SIZE).map(|_| OnceCell::new()).collect();
        Arc::new(Self {
            base,
            tier,
            count: AtomicUsize::new(0),
            slots,
            reclaim,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn index(&self) -> usize {
        block_index_for_base(self.base)
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Slots handed out so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire).min(BLOCK_SIZE)
    }

    pub fn is_full(&self) -> bool {
        self.count() == BLOCK_SIZE
    }

    /// Claim the next slot for `wrapper` and return its handle, or `None` if
    /// the block is full.
    ///
    /// Claiming is a compare-and-swap on the fill count, so shared blocks can
    /// be appended to from several threads without a manager-wide lock.
    pub(crate) fn try_append(&self, wrapper: &WrapperRef) -> Option<u64> {
        let slot = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < BLOCK_SIZE).then_some(n + 1)
            })
            .ok()?;
        // The slot index was claimed exclusively above.
        let _ = self.slots[slot].set(Arc::downgrade(wrapper));
        Some(self.base + ((slot as u64) << TAG_BITS))
    }

    /// The wrapper in `slot`, if it was filled and is still alive.
    pub fn get(&self, slot: usize) -> Option<WrapperRef> {
        self.slots.get(slot)?.get()?.upgrade()
    }

    /// Number of filled slots whose wrapper is still alive.
    pub fn live_count(&self) -> usize {
        self.slots[..self.count()]
            .iter()
            .filter(|slot| slot.get().is_some_and(|weak| weak.strong_count() > 0))
            .count()
    }
}

impl Drop for HandleBlock {
    fn drop(&mut self) {
        // The receiver is gone only when the owning manager was dropped, in
        // which case nobody can resolve this block's handles anyway.
        let _ = self.reclaim.send(ReclaimedBlock {
            base: self.base,
            tier: self.tier,
        });
    }
}

impl fmt::Debug for HandleBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleBlock")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("tier", &self.tier)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::tagged::{ALLOCATION_BASE, BLOCK_BYTE_SIZE, block_index, slot_index};
    use crate::handle::wrapper::WrappedValue;

    fn float_wrapper(x: f64) -> WrapperRef {
        ValueWrapper::unset(WrappedValue::Float(x))
    }

    #[test]
    fn append_is_sequential() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let base = ALLOCATION_BASE + 2 * BLOCK_BYTE_SIZE;
        let block = HandleBlock::new(base, Tier::Local, tx);
        let a = float_wrapper(1.0);
        let b = float_wrapper(2.0);

        let ha = block.try_append(&a).unwrap();
        let hb = block.try_append(&b).unwrap();
        assert_eq!(ha, base);
        assert_eq!(hb, base + 8);
        assert_eq!(block_index(hb), 2);
        assert_eq!(slot_index(hb), 1);
        assert!(Arc::ptr_eq(&block.get(1).unwrap(), &b));
        assert_eq!(block.count(), 2);
    }

    #[test]
    fn slots_are_weak() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let block = HandleBlock::new(ALLOCATION_BASE, Tier::Local, tx);
        let wrapper = float_wrapper(3.0);
        block.try_append(&wrapper).unwrap();
        assert_eq!(block.live_count(), 1);
        drop(wrapper);
        assert!(block.get(0).is_none());
        assert_eq!(block.live_count(), 0);
        assert!(block.get(BLOCK_SIZE).is_none());
    }

    #[test]
    fn full_block_refuses_appends() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let block = HandleBlock::new(ALLOCATION_BASE, Tier::Shared, tx);
        let wrapper = float_wrapper(0.5);
        for _ in 0..BLOCK_SIZE {
            assert!(block.try_append(&wrapper).is_some());
        }
        assert!(block.is_full());
        assert_eq!(block.try_append(&wrapper), None);
    }

    #[test]
    fn drop_posts_reclamation() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let block = HandleBlock::new(ALLOCATION_BASE + BLOCK_BYTE_SIZE, Tier::Shared, tx);
        drop(block);
        assert_eq!(
            rx.try_recv().unwrap(),
            ReclaimedBlock {
                base: ALLOCATION_BASE + BLOCK_BYTE_SIZE,
                tier: Tier::Shared
            }
        );
    }
}
