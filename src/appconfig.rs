use crate::error::{AppError, AppResult};
use crate::model::Queue;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub shards: ShardsConfig,
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub regions: RegionsConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    /// Region tag of this process; the queue actors it hosts serve this
    /// region only.
    pub local_region: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "scylla" (the latter requires the `scylladb` feature).
    pub backend: String,
    #[serde(default)]
    pub scylla: ScyllaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScyllaConfig {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

impl Default for ScyllaConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            keyspace: default_keyspace(),
            replication_factor: default_replication_factor(),
        }
    }
}

fn default_keyspace() -> String {
    "qakka".to_string()
}

fn default_replication_factor() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardsConfig {
    /// Counter threshold driving allocation is 0.9 × this.
    pub max_shard_size: i64,
    /// Future offset applied to a freshly cut shard's pivot.
    pub allocation_advance_ms: u64,
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Defaults for queues created without explicit settings.
    pub lease_seconds: u32,
    pub max_redeliveries: u32,
    #[serde(default)]
    pub default_delay_ms: u64,

    /// Max rows moved available → inflight per refresh.
    pub refresh_batch: usize,
    /// In-memory buffer high-water mark.
    pub buffer_target: usize,
    pub refresh_interval_ms: u64,
    pub sweep_interval_ms: u64,
    /// Soft deadline for a get_next round-trip to the actor.
    pub get_next_deadline_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegionsConfig {
    /// Transport endpoints of peer regions, keyed by region tag.
    #[serde(default)]
    pub peers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub port: u16,
    pub metrics_path: String,
}

impl AppConfig {
    pub fn load() -> AppResult<Self> {
        let path =
            std::env::var("QAKKA_CONFIG").unwrap_or_else(|_| "config/qakka.toml".to_string());
        let raw = fs::read_to_string(&path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> AppResult<Self> {
        let cfg: Self = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// A queue record carrying this node's delivery defaults.
    pub fn queue_with_defaults(&self, name: impl Into<String>) -> Queue {
        let mut q = Queue::new(name, self.node.local_region.clone());
        q.default_delay_ms = self.delivery.default_delay_ms;
        q.lease_seconds = self.delivery.lease_seconds;
        q.max_redeliveries = self.delivery.max_redeliveries;
        q
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.node.id.trim().is_empty() {
            return Err(AppError::MissingConfig("node.id"));
        }
        if self.node.local_region.trim().is_empty() {
            return Err(AppError::MissingConfig("node.local_region"));
        }

        match self.store.backend.as_str() {
            "memory" => {}
            "scylla" => {
                if self.store.scylla.nodes.is_empty() {
                    return Err(AppError::InvalidConfig(
                        "store.scylla.nodes must list at least one contact point".into(),
                    ));
                }
                if self.store.scylla.replication_factor == 0 {
                    return Err(AppError::InvalidConfig(
                        "store.scylla.replication_factor must be >= 1".into(),
                    ));
                }
            }
            other => {
                return Err(AppError::InvalidConfig(format!(
                    "store.backend must be 'memory' or 'scylla' (got '{other}')"
                )));
            }
        }

        if self.shards.max_shard_size <= 0 {
            return Err(AppError::InvalidConfig(
                "shards.max_shard_size must be > 0".into(),
            ));
        }
        if self.shards.allocation_advance_ms == 0 {
            return Err(AppError::InvalidConfig(
                "shards.allocation_advance_ms must be > 0".into(),
            ));
        }
        if self.shards.check_interval_ms == 0 {
            return Err(AppError::InvalidConfig(
                "shards.check_interval_ms must be > 0".into(),
            ));
        }

        if self.delivery.lease_seconds == 0 {
            return Err(AppError::InvalidConfig(
                "delivery.lease_seconds must be > 0".into(),
            ));
        }
        if self.delivery.refresh_batch == 0 {
            return Err(AppError::InvalidConfig(
                "delivery.refresh_batch must be > 0".into(),
            ));
        }
        if self.delivery.buffer_target == 0 {
            return Err(AppError::InvalidConfig(
                "delivery.buffer_target must be > 0".into(),
            ));
        }
        if self.delivery.refresh_interval_ms == 0 {
            return Err(AppError::InvalidConfig(
                "delivery.refresh_interval_ms must be > 0".into(),
            ));
        }
        if self.delivery.sweep_interval_ms == 0 {
            return Err(AppError::InvalidConfig(
                "delivery.sweep_interval_ms must be > 0".into(),
            ));
        }
        if self.delivery.get_next_deadline_ms == 0 {
            return Err(AppError::InvalidConfig(
                "delivery.get_next_deadline_ms must be > 0".into(),
            ));
        }

        for (region, endpoint) in &self.regions.peers {
            if region.trim().is_empty() || endpoint.trim().is_empty() {
                return Err(AppError::InvalidConfig(
                    "regions.peers entries must have non-empty region and endpoint".into(),
                ));
            }
            if *region == self.node.local_region {
                return Err(AppError::InvalidConfig(format!(
                    "regions.peers must not include the local region '{region}'"
                )));
            }
        }

        if self.metrics.enabled {
            if self.metrics.bind_addr.trim().is_empty() {
                return Err(AppError::MissingConfig("metrics.bind_addr"));
            }
            if !self.metrics.metrics_path.starts_with('/') {
                return Err(AppError::InvalidConfig(
                    "metrics.metrics_path must start with '/'".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> String {
        r#"
            [node]
            id = "qakka-1"
            local_region = "us-east"

            [store]
            backend = "memory"

            [shards]
            max_shard_size = 400000
            allocation_advance_ms = 60000
            check_interval_ms = 5000

            [delivery]
            lease_seconds = 30
            max_redeliveries = 10
            refresh_batch = 100
            buffer_target = 1000
            refresh_interval_ms = 1000
            sweep_interval_ms = 5000
            get_next_deadline_ms = 1000

            [regions.peers]
            eu-west = "http://qakka.eu-west.internal:8443"

            [logging]
            level = "info"

            [metrics]
            enabled = true
            bind_addr = "127.0.0.1"
            port = 9095
            metrics_path = "/metrics"
        "#
        .to_string()
    }

    #[test]
    fn sample_config_parses_and_validates() {
        let cfg = AppConfig::from_toml(&sample_toml()).unwrap();
        assert_eq!(cfg.node.local_region, "us-east");
        assert_eq!(cfg.shards.max_shard_size, 400_000);
        assert_eq!(cfg.regions.peers["eu-west"], "http://qakka.eu-west.internal:8443");
        assert_eq!(cfg.delivery.default_delay_ms, 0);
    }

    #[test]
    fn zero_lease_is_rejected() {
        let raw = sample_toml().replace("lease_seconds = 30", "lease_seconds = 0");
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let raw = sample_toml().replace("backend = \"memory\"", "backend = \"etcd\"");
        assert!(AppConfig::from_toml(&raw).is_err());
    }

    #[test]
    fn local_region_cannot_be_its_own_peer() {
        let raw = sample_toml().replace("eu-west =", "us-east =");
        assert!(AppConfig::from_toml(&raw).is_err());
    }

    #[test]
    fn queue_defaults_come_from_delivery_section() {
        let cfg = AppConfig::from_toml(&sample_toml()).unwrap();
        let q = cfg.queue_with_defaults("orders");
        assert_eq!(q.origin_region, "us-east");
        assert_eq!(q.lease_seconds, 30);
        assert_eq!(q.max_redeliveries, 10);
    }
}
