// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

cfg_if::cfg_if! {
    if #[cfg(feature = "tick64")] {
        /// Raw width of the tick counter.
        pub type RawTick = u64;
        /// Signed counterpart of [`RawTick`], produced by [`Ticks::since`].
        pub type SignedTick = i64;
        pub(crate) type TickAtomic = core::sync::atomic::AtomicU64;
    } else {
        /// Raw width of the tick counter.
        pub type RawTick = u32;
        /// Signed counterpart of [`RawTick`], produced by [`Ticks::since`].
        pub type SignedTick = i32;
        pub(crate) type TickAtomic = core::sync::atomic::AtomicU32;
    }
}

static_assertions::assert_eq_size!(RawTick, SignedTick);

/// A point on the loop's tick counter.
///
/// The counter wraps, so `Ticks` deliberately does not implement `Ord`;
/// two instants are compared through the signed modular difference returned
/// by [`Ticks::since`]. That ordering is correct as long as no pending timer
/// spans more than half the counter range (2^31 ticks at the default width).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ticks(pub RawTick);

// === impl Ticks ===

impl Ticks {
    pub const ZERO: Self = Self(0);

    /// The instant `ticks` after `self`, wrapping at the counter width.
    #[inline]
    #[must_use]
    pub const fn wrapping_add(self, ticks: RawTick) -> Self {
        Self(self.0.wrapping_add(ticks))
    }

    /// Signed modular distance from `earlier` to `self`.
    ///
    /// Non-negative iff `self` is not earlier than `earlier`, treating
    /// wraparound as distance.
    #[inline]
    #[must_use]
    pub const fn since(self, earlier: Self) -> SignedTick {
        self.0.wrapping_sub(earlier.0).cast_signed()
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}t", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_modular() {
        let before = Ticks(RawTick::MAX - 15);
        let after = before.wrapping_add(32);

        assert_eq!(after, Ticks(16));
        assert!(after.since(before) == 32);
        assert!(before.since(after) == -32);
    }

    #[test]
    fn equal_instants_have_zero_distance() {
        let t = Ticks(1234);
        assert_eq!(t.since(t), 0);
    }

    #[test]
    fn distance_is_signed_across_the_origin() {
        assert_eq!(Ticks(3).since(Ticks(RawTick::MAX)), 4);
        assert_eq!(Ticks(RawTick::MAX).since(Ticks(3)), -4);
    }
}
