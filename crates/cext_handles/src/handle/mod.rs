//! Native handles: tagged encoding, block allocation and the registries that
//! resolve handles back to wrappers.

pub mod allocator;
pub mod block;
pub mod registry;
pub mod tagged;
pub mod wrap;
pub mod wrapper;

pub use allocator::BlockAllocator;
pub use block::{HandleBlock, ReclaimedBlock, Tier};
pub use registry::{HandleManager, HandleSpace, HandleStats};
pub use wrapper::{ValueWrapper, WrappedValue, WrapperRef};
