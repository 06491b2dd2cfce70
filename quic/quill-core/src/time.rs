// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Monotone time, supplied by the embedder on every call into the engine.
//!
//! The engine never reads a clock; `Timestamp` is an opaque offset from an
//! epoch the embedder chooses, and only differences between timestamps are
//! meaningful.

use core::{fmt, ops::Add, ops::Sub, time::Duration};

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Self = Self(Duration::ZERO);

    /// Creates a timestamp `duration` past the embedder's epoch
    #[inline]
    pub const fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    #[inline]
    pub const fn as_duration(self) -> Duration {
        self.0
    }

    /// Returns the duration elapsed since `earlier`, or zero if `earlier`
    /// is in the future
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    #[inline]
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        self.0.checked_sub(duration).map(Self)
    }

    /// Returns true once `self` is at or before `now`
    #[inline]
    pub fn has_elapsed(self, now: Self) -> bool {
        self <= now
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn add(self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    /// # Panics
    /// Panics when `rhs` is later than `self`
    #[inline]
    fn sub(self, rhs: Timestamp) -> Duration {
        self.0 - rhs.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_arithmetic() {
        let a = Timestamp::from_duration(Duration::from_millis(10));
        let b = a + Duration::from_millis(15);
        assert!(a < b);
        assert_eq!(b - a, Duration::from_millis(15));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
        assert!(a.has_elapsed(b));
        assert!(!b.has_elapsed(a));
    }
}
