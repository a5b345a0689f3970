mod regions;
mod scenarios;

use crate::appconfig::{
    AppConfig, DeliveryConfig, LoggingConfig, MetricsConfig, NodeConfig, RegionsConfig,
    ScyllaConfig, ShardsConfig, StoreConfig,
};

/// Config tuned for tests: 1 s leases and fast background ticks so
/// redelivery scenarios complete in a few seconds.
pub(crate) fn test_config(region: &str) -> AppConfig {
    AppConfig {
        node: NodeConfig {
            id: "test-node".into(),
            local_region: region.into(),
        },
        store: StoreConfig {
            backend: "memory".into(),
            scylla: ScyllaConfig::default(),
        },
        shards: ShardsConfig {
            max_shard_size: 100,
            allocation_advance_ms: 60_000,
            // Allocation in tests is driven by hand, not by the timer.
            check_interval_ms: 60_000,
        },
        delivery: DeliveryConfig {
            lease_seconds: 1,
            max_redeliveries: 10,
            default_delay_ms: 0,
            refresh_batch: 100,
            buffer_target: 100,
            refresh_interval_ms: 50,
            sweep_interval_ms: 50,
            get_next_deadline_ms: 1_000,
        },
        regions: RegionsConfig::default(),
        logging: LoggingConfig {
            level: "info".into(),
        },
        metrics: MetricsConfig {
            enabled: false,
            bind_addr: "127.0.0.1".into(),
            port: 0,
            metrics_path: "/metrics".into(),
        },
    }
}
