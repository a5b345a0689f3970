use crate::timeuuid::TimeUuid;
use serde::{Deserialize, Serialize};

/// Which side of the message lifecycle a shard partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardKind {
    /// Rows available for delivery.
    Default,
    /// Rows delivered and awaiting ack.
    Inflight,
}

impl ShardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardKind::Default => "default",
            ShardKind::Inflight => "inflight",
        }
    }

    pub const BOTH: [ShardKind; 2] = [ShardKind::Default, ShardKind::Inflight];
}

/// A time-bounded partition of a queue's message stream.
///
/// A message with id `m` belongs to the highest-`shard_id` shard whose
/// `pivot <= m`. Shard ids are dense from 0; pivots strictly increase with
/// the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub queue: String,
    pub region: String,
    pub kind: ShardKind,
    pub shard_id: u32,
    pub pivot: TimeUuid,
}

impl Shard {
    /// Shard 0, created together with its queue. The zero pivot routes every
    /// message until the allocator rolls over.
    pub fn zero(queue: impl Into<String>, region: impl Into<String>, kind: ShardKind) -> Self {
        Self {
            queue: queue.into(),
            region: region.into(),
            kind,
            shard_id: 0,
            pivot: TimeUuid::zero(),
        }
    }
}

/// Pick the shard a message id routes to: the last shard (ascending ids)
/// whose pivot does not exceed the id.
pub fn shard_for(shards: &[Shard], id: TimeUuid) -> Option<&Shard> {
    shards.iter().rev().find(|s| s.pivot <= id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: u32, pivot_ms: u64) -> Shard {
        Shard {
            queue: "q".into(),
            region: "dc1".into(),
            kind: ShardKind::Default,
            shard_id: id,
            pivot: if pivot_ms == 0 {
                TimeUuid::zero()
            } else {
                TimeUuid::at_unix_ms(pivot_ms)
            },
        }
    }

    #[test]
    fn routes_to_highest_shard_at_or_below_id() {
        let shards = vec![shard(0, 0), shard(1, 1_000), shard(2, 2_000)];

        let early = TimeUuid::at_unix_ms(500);
        assert_eq!(shard_for(&shards, early).unwrap().shard_id, 0);

        let mid = TimeUuid::at_unix_ms(1_500);
        assert_eq!(shard_for(&shards, mid).unwrap().shard_id, 1);

        let late = TimeUuid::at_unix_ms(10_000);
        assert_eq!(shard_for(&shards, late).unwrap().shard_id, 2);
    }

    #[test]
    fn zero_pivot_catches_everything() {
        let shards = vec![shard(0, 0)];
        assert_eq!(
            shard_for(&shards, TimeUuid::now()).unwrap().shard_id,
            0
        );
    }

    #[test]
    fn empty_shard_list_routes_nowhere() {
        assert!(shard_for(&[], TimeUuid::now()).is_none());
    }
}
