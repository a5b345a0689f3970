use serde::{Deserialize, Serialize};

/// Durable queue record. Created once; immutable except for deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    /// Region the queue was created in.
    pub origin_region: String,
    /// Regions this queue is served from.
    pub regions: Vec<String>,
    /// Delay applied to sends that do not carry their own.
    pub default_delay_ms: u64,
    /// How long a delivered message stays inflight before redelivery.
    pub lease_seconds: u32,
    /// Redeliveries allowed before a message is dead-lettered.
    pub max_redeliveries: u32,
}

impl Queue {
    pub fn new(name: impl Into<String>, origin_region: impl Into<String>) -> Self {
        let origin_region = origin_region.into();
        Self {
            name: name.into(),
            regions: vec![origin_region.clone()],
            origin_region,
            default_delay_ms: 0,
            lease_seconds: 30,
            max_redeliveries: 10,
        }
    }

    pub fn lease_ms(&self) -> u64 {
        u64::from(self.lease_seconds) * 1000
    }

    pub fn served_in(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r == region)
    }
}
