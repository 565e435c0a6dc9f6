//! Bit-level layout of native handles.
//!
//! ```text
//! ...0000   false
//! ...0010   nil
//! ...0110   true
//! ...1010   argument not supplied
//! ......1   small integer, payload = value << 1
//! ....000   object handle, when >= ALLOCATION_BASE
//! ```
//!
//! Object handles decompose into a block index and a slot:
//! `index = (handle - ALLOCATION_BASE) >> BLOCK_BITS`,
//! `slot = (handle & OFFSET_MASK) >> TAG_BITS`.

pub const FALSE_HANDLE: u64 = 0b0000;
pub const NIL_HANDLE: u64 = 0b0010;
pub const TRUE_HANDLE: u64 = 0b0110;
pub const UNDEF_HANDLE: u64 = 0b1010;

/// Never issued; marks a wrapper whose handle has not been minted yet.
pub const UNSET_HANDLE: u64 = u64::MAX - 1;

pub const INTEGER_TAG: u64 = 0b1;
pub const OBJECT_TAG: u64 = 0b000;
pub const TAG_BITS: u32 = 3;
pub const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

pub const MIN_TAGGED_INTEGER: i64 = -(1 << 62);
pub const MAX_TAGGED_INTEGER: i64 = (1 << 62) - 1;

/// First address handed out to a block. Far above any address a user-space
/// allocation can have on current 64-bit platforms.
pub const ALLOCATION_BASE: u64 = 0x0bad << 48;

pub const BLOCK_BITS: u32 = 15;
pub const BLOCK_BYTE_SIZE: u64 = 1 << BLOCK_BITS;
/// Slots per block.
pub const BLOCK_SIZE: usize = 1 << (BLOCK_BITS - TAG_BITS);
pub const BLOCK_MASK: u64 = !(BLOCK_BYTE_SIZE - 1);
pub const OFFSET_MASK: u64 = !BLOCK_MASK;

#[inline]
pub fn is_tagged_integer(handle: u64) -> bool {
    handle & INTEGER_TAG == INTEGER_TAG
}

#[inline]
pub fn is_tagged_object(handle: u64) -> bool {
    handle >= ALLOCATION_BASE && handle & TAG_MASK == OBJECT_TAG
}

#[inline]
pub fn is_immediate_constant(handle: u64) -> bool {
    matches!(handle, FALSE_HANDLE | NIL_HANDLE | TRUE_HANDLE | UNDEF_HANDLE)
}

#[inline]
pub fn fits_tagged_integer(value: i64) -> bool {
    (MIN_TAGGED_INTEGER..=MAX_TAGGED_INTEGER).contains(&value)
}

/// Encode `value` as a tagged integer, or `None` when it needs a real handle.
#[inline]
pub fn encode_integer(value: i64) -> Option<u64> {
    if fits_tagged_integer(value) {
        Some(((value << 1) as u64) | INTEGER_TAG)
    } else {
        None
    }
}

/// Arithmetic shift, so negative payloads keep their sign.
#[inline]
pub fn decode_integer(handle: u64) -> i64 {
    (handle as i64) >> 1
}

#[inline]
pub fn block_index(handle: u64) -> usize {
    ((handle - ALLOCATION_BASE) >> BLOCK_BITS) as usize
}

#[inline]
pub fn slot_index(handle: u64) -> usize {
    ((handle & OFFSET_MASK) >> TAG_BITS) as usize
}

#[inline]
pub fn block_index_for_base(base: u64) -> usize {
    block_index(base)
}

/// Aligned, non-`false` values below the handle address space are pointers to
/// natively allocated structures, not handles.
#[inline]
pub fn is_native_object(value: u64) -> bool {
    value != FALSE_HANDLE && value & TAG_MASK == OBJECT_TAG && value < ALLOCATION_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_are_disjoint() {
        for constant in [FALSE_HANDLE, NIL_HANDLE, TRUE_HANDLE, UNDEF_HANDLE] {
            assert!(is_immediate_constant(constant));
            assert!(!is_tagged_integer(constant));
            assert!(!is_tagged_object(constant));
            assert!(!is_native_object(constant));
        }
        assert!(!is_tagged_integer(ALLOCATION_BASE));
        assert!(is_tagged_object(ALLOCATION_BASE));
        assert!(!is_immediate_constant(UNSET_HANDLE));
        assert!(!is_tagged_object(UNSET_HANDLE));
    }

    #[test]
    fn small_integer_example() {
        assert_eq!(encode_integer(5), Some((5 << 1) | 1));
        assert_eq!(decode_integer((5 << 1) | 1), 5);
        assert_eq!(decode_integer(encode_integer(-7).unwrap()), -7);
    }

    #[test]
    fn integer_range_boundaries() {
        for value in [MIN_TAGGED_INTEGER, MAX_TAGGED_INTEGER, 0, -1, 1] {
            let handle = encode_integer(value).unwrap();
            assert!(is_tagged_integer(handle));
            assert_eq!(decode_integer(handle), value);
        }
        assert_eq!(encode_integer(MAX_TAGGED_INTEGER + 1), None);
        assert_eq!(encode_integer(MIN_TAGGED_INTEGER - 1), None);
        assert_eq!(encode_integer(i64::MAX), None);
        assert_eq!(encode_integer(i64::MIN), None);
    }

    #[test]
    fn block_geometry() {
        assert_eq!(BLOCK_SIZE, 4096);
        assert_eq!(BLOCK_BYTE_SIZE, 32 * 1024);
        assert_eq!(ALLOCATION_BASE & OFFSET_MASK, 0);

        let base = ALLOCATION_BASE + 3 * BLOCK_BYTE_SIZE;
        let handle = base + (17 << TAG_BITS);
        assert_eq!(block_index(handle), 3);
        assert_eq!(slot_index(handle), 17);
        assert_eq!(block_index_for_base(base), 3);
    }

    #[test]
    fn native_pointers_are_recognised() {
        assert!(is_native_object(0x7f00_dead_bee0));
        assert!(!is_native_object(0x7f00_dead_bee1));
        assert!(!is_native_object(ALLOCATION_BASE + 8));
    }
}
