use std::ops::Range;

/// ones in bit positions `r.start..r.end` (exclusive end).
#[inline]
pub const fn bit_range(r: Range<u32>) -> u64 {
    if r.start >= r.end {
        return 0;
    }
    let large: u64 = if r.end < 64 { 1 << r.end } else { 0 };
    large.wrapping_sub(1 << r.start)
}

#[inline]
pub const fn mask(addr: u64, r: Range<u32>) -> u64 {
    addr & bit_range(r)
}

#[inline]
pub const fn extract(addr: u64, r: Range<u32>) -> u64 {
    let left = r.start;
    mask(addr, r) >> left
}

#[inline]
pub const fn is_power_of_two(v: u64) -> bool {
    v != 0 && v & (v - 1) == 0
}

/// log2 of a power of two.
#[inline]
pub const fn log2(v: u64) -> u32 {
    63 - v.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_range() {
        assert_eq!(bit_range(0..6), 0x3f);
        assert_eq!(bit_range(6..8), 0xc0);
        assert_eq!(bit_range(6..64), !0x3f);
        assert_eq!(bit_range(3..3), 0);
    }

    #[test]
    fn test_extract() {
        assert_eq!(extract(0x1234, 4..8), 0x3);
        assert_eq!(extract(0xdead_beef, 16..32), 0xdead);
    }

    #[test]
    fn test_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(64));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(48));
        assert_eq!(log2(1), 0);
        assert_eq!(log2(64), 6);
        assert_eq!(log2(1 << 40), 40);
    }
}
