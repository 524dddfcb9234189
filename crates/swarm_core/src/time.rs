//! Time types for SWARM.GRID.
//!
//! Wall-clock milliseconds since the Unix epoch. Every scheduler operation
//! that depends on time also accepts an explicit timestamp so sweeps and
//! uptime thresholds can be driven deterministically.

use serde::{Deserialize, Serialize};

/// Milliseconds in a second
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Milliseconds in an hour
pub const MILLIS_PER_HOUR: u64 = 3_600 * MILLIS_PER_SEC;

/// Wall clock timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch
    pub const ZERO: Self = Self(0);

    /// Get current timestamp
    #[must_use]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Create from raw milliseconds
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Get raw milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since an earlier timestamp (zero if `earlier` is later)
    #[must_use]
    pub const fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Timestamp shifted forward
    #[must_use]
    pub const fn plus_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:03}", self.0 / MILLIS_PER_SEC, self.0 % MILLIS_PER_SEC)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
