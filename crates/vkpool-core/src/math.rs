//! Alignment helpers.
//!
//! All alignments are powers of two. Callers validate that before use.

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` up to the next multiple of `alignment`, or `None` on overflow.
#[inline]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Round `value` down to the previous multiple of `alignment`.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Check whether `value` is a multiple of `alignment`.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}
