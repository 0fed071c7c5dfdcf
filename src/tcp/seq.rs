//! Sequence number and timestamp comparisons modulo 2^32.
//!
//! `a < b` holds when `b` lies in the half of the number circle that follows
//! `a`. Timestamps use the same arithmetic (RFC 7323, section 5.2).

#[inline]
pub fn seq_lt(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) < 0
}

#[inline]
pub fn seq_leq(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) <= 0
}

#[inline]
pub fn seq_gt(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) > 0
}

#[inline]
pub fn seq_geq(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) >= 0
}

#[inline]
pub fn seq_max(lhs: u32, rhs: u32) -> u32 {
    if seq_gt(lhs, rhs) {
        lhs
    } else {
        rhs
    }
}

/// Signed distance from `rhs` to `lhs`.
#[inline]
pub fn seq_diff(lhs: u32, rhs: u32) -> i32 {
    lhs.wrapping_sub(rhs) as i32
}

pub use self::seq_geq as ts_geq;
pub use self::seq_lt as ts_lt;
