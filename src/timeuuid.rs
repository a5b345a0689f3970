//! Time-ordered message ids.
//!
//! Delivery attempts and shard pivots are identified by v1 (time-based)
//! UUIDs. Routing and range reads compare ids by their embedded unix
//! timestamp first, raw bytes second, so ordering is approximate within a
//! single millisecond — which is all the queue promises.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;
use uuid::{Context, Timestamp, Uuid};

/// Clock-sequence context shared by every id minted in this process.
fn clock_context() -> &'static Context {
    static CTX: OnceLock<Context> = OnceLock::new();
    CTX.get_or_init(|| Context::new(rand::random()))
}

/// Stable per-process node id (the spatial half of a v1 UUID).
fn node_id() -> &'static [u8; 6] {
    static NODE: OnceLock<[u8; 6]> = OnceLock::new();
    NODE.get_or_init(rand::random)
}

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A v1 UUID ordered by (embedded unix millisecond, raw bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeUuid(Uuid);

impl TimeUuid {
    /// Mint an id whose embedded timestamp is `ms` unix milliseconds.
    pub fn at_unix_ms(ms: u64) -> Self {
        let seconds = ms / 1000;
        let subsec_nanos = ((ms % 1000) * 1_000_000) as u32;
        let ts = Timestamp::from_unix(clock_context(), seconds, subsec_nanos);
        TimeUuid(Uuid::new_v1(ts, node_id()))
    }

    /// Mint an id stamped with the current wall clock.
    pub fn now() -> Self {
        Self::at_unix_ms(now_ms())
    }

    /// The nil id; sorts before every minted id. Shard 0 uses it as pivot so
    /// that every message routes somewhere.
    pub fn zero() -> Self {
        TimeUuid(Uuid::nil())
    }

    /// Embedded unix milliseconds (0 for the nil id).
    pub fn unix_ms(&self) -> u64 {
        match self.0.get_timestamp() {
            Some(ts) => {
                let (secs, nanos) = ts.to_unix();
                secs * 1000 + (nanos / 1_000_000) as u64
            }
            None => 0,
        }
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    fn sort_key(&self) -> (u64, u128) {
        (self.unix_ms(), self.0.as_u128())
    }
}

impl From<Uuid> for TimeUuid {
    fn from(u: Uuid) -> Self {
        TimeUuid(u)
    }
}

impl Ord for TimeUuid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for TimeUuid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TimeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeds_the_requested_millisecond() {
        let ms = 1_700_000_123_456u64;
        let id = TimeUuid::at_unix_ms(ms);
        assert_eq!(id.unix_ms(), ms);
    }

    #[test]
    fn orders_by_timestamp_across_milliseconds() {
        let older = TimeUuid::at_unix_ms(1_700_000_000_000);
        let newer = TimeUuid::at_unix_ms(1_700_000_000_001);
        assert!(older < newer);
        assert!(newer > older);
    }

    #[test]
    fn zero_sorts_first_and_has_no_timestamp() {
        let zero = TimeUuid::zero();
        assert_eq!(zero.unix_ms(), 0);
        assert!(zero < TimeUuid::now());
    }

    #[test]
    fn minted_ids_are_unique() {
        let a = TimeUuid::at_unix_ms(42);
        let b = TimeUuid::at_unix_ms(42);
        assert_ne!(a, b);
    }
}
