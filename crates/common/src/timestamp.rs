//! Physical timestamps (microseconds since Unix epoch)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp with microsecond resolution
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp, used as the "unset" value
    pub const MIN: Timestamp = Timestamp(0);

    /// Current wall-clock time
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000)
    }

    /// Add a number of microseconds, saturating on overflow
    pub const fn add_micros(&self, micros: u64) -> Self {
        Self(self.0.saturating_add(micros))
    }

    /// Add a number of seconds, saturating on overflow
    pub const fn add_secs(&self, secs: u64) -> Self {
        self.add_micros(secs.saturating_mul(1_000_000))
    }

    /// Microseconds elapsed between `earlier` and this timestamp (0 if negative)
    pub const fn micros_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}
