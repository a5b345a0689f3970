use crate::error::AppResult;

#[cfg(feature = "metrics")]
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Counters, gauges and histograms for the queue hot path.
///
/// Everything compiles away to no-ops when the `metrics` feature is off.
#[derive(Clone, Debug)]
pub struct QueueMetrics {
    #[cfg(feature = "metrics")]
    registry: Registry,

    // --------------------------------------------
    // Throughput
    // --------------------------------------------
    #[cfg(feature = "metrics")]
    pub sent_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub forwarded_total: IntCounterVec,

    #[cfg(feature = "metrics")]
    pub dequeued_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub acked_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub nacked_total: IntCounter,

    // --------------------------------------------
    // Redelivery / terminal outcomes
    // --------------------------------------------
    #[cfg(feature = "metrics")]
    pub redelivered_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub dead_letter_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub expired_total: IntCounter,

    // --------------------------------------------
    // Shard lifecycle
    // --------------------------------------------
    #[cfg(feature = "metrics")]
    pub shard_allocations_total: IntCounterVec,

    // --------------------------------------------
    // Actor internals
    // --------------------------------------------
    #[cfg(feature = "metrics")]
    pub buffer_size: IntGaugeVec,

    #[cfg(feature = "metrics")]
    pub refresh_latency_seconds: Histogram,

    #[cfg(feature = "metrics")]
    pub sweep_latency_seconds: Histogram,

    #[cfg(not(feature = "metrics"))]
    _noop: (),
}

impl QueueMetrics {
    pub fn new() -> AppResult<Self> {
        #[cfg(feature = "metrics")]
        {
            let registry = Registry::new();

            let sent_total = IntCounter::with_opts(Opts::new(
                "qakka_messages_sent_total",
                "Messages accepted for local delivery",
            ))?;

            let forwarded_total = IntCounterVec::new(
                Opts::new(
                    "qakka_messages_forwarded_total",
                    "Messages forwarded to a peer region, labeled by destination",
                ),
                &["region"],
            )?;

            let dequeued_total = IntCounter::with_opts(Opts::new(
                "qakka_messages_dequeued_total",
                "Descriptors handed to consumers by get_next",
            ))?;

            let acked_total = IntCounter::with_opts(Opts::new(
                "qakka_messages_acked_total",
                "Messages acknowledged",
            ))?;

            let nacked_total = IntCounter::with_opts(Opts::new(
                "qakka_messages_nacked_total",
                "Messages negatively acknowledged",
            ))?;

            let redelivered_total = IntCounter::with_opts(Opts::new(
                "qakka_messages_redelivered_total",
                "Messages returned to the available table after a lease expiry or nack",
            ))?;

            let dead_letter_total = IntCounter::with_opts(Opts::new(
                "qakka_messages_dead_letter_total",
                "Messages dropped after exceeding the redelivery cap",
            ))?;

            let expired_total = IntCounter::with_opts(Opts::new(
                "qakka_messages_expired_total",
                "Messages discarded because their expiration lapsed before delivery",
            ))?;

            let shard_allocations_total = IntCounterVec::new(
                Opts::new(
                    "qakka_shard_allocations_total",
                    "New shards allocated, labeled by shard kind",
                ),
                &["kind"],
            )?;

            let buffer_size = IntGaugeVec::new(
                Opts::new(
                    "qakka_buffer_size",
                    "Descriptors currently buffered in memory, labeled by queue",
                ),
                &["queue"],
            )?;

            // Refresh is a storage round-trip plus per-row moves: ms to low seconds.
            let refresh_latency_seconds = Histogram::with_opts(
                HistogramOpts::new(
                    "qakka_refresh_latency_seconds",
                    "Latency of one buffer refresh (seconds)",
                )
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            )?;

            let sweep_latency_seconds = Histogram::with_opts(
                HistogramOpts::new(
                    "qakka_sweep_latency_seconds",
                    "Latency of one expired-lease sweep (seconds)",
                )
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            )?;

            registry.register(Box::new(sent_total.clone()))?;
            registry.register(Box::new(forwarded_total.clone()))?;
            registry.register(Box::new(dequeued_total.clone()))?;
            registry.register(Box::new(acked_total.clone()))?;
            registry.register(Box::new(nacked_total.clone()))?;
            registry.register(Box::new(redelivered_total.clone()))?;
            registry.register(Box::new(dead_letter_total.clone()))?;
            registry.register(Box::new(expired_total.clone()))?;
            registry.register(Box::new(shard_allocations_total.clone()))?;
            registry.register(Box::new(buffer_size.clone()))?;
            registry.register(Box::new(refresh_latency_seconds.clone()))?;
            registry.register(Box::new(sweep_latency_seconds.clone()))?;

            Ok(Self {
                registry,
                sent_total,
                forwarded_total,
                dequeued_total,
                acked_total,
                nacked_total,
                redelivered_total,
                dead_letter_total,
                expired_total,
                shard_allocations_total,
                buffer_size,
                refresh_latency_seconds,
                sweep_latency_seconds,
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(Self { _noop: () })
        }
    }

    #[cfg(feature = "metrics")]
    pub fn encode_text(&self) -> AppResult<String> {
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    #[cfg(not(feature = "metrics"))]
    pub fn encode_text(&self) -> AppResult<String> {
        Ok(String::new())
    }

    // ------------------------------------------------------------
    // No-op helpers (compile away when metrics feature is off)
    // ------------------------------------------------------------

    #[inline]
    pub fn inc_sent(&self) {
        #[cfg(feature = "metrics")]
        self.sent_total.inc();
    }

    #[inline]
    pub fn inc_forwarded(&self, _region: &str) {
        #[cfg(feature = "metrics")]
        self.forwarded_total.with_label_values(&[_region]).inc();
    }

    #[inline]
    pub fn add_dequeued(&self, _n: u64) {
        #[cfg(feature = "metrics")]
        self.dequeued_total.inc_by(_n);
    }

    #[inline]
    pub fn inc_acked(&self) {
        #[cfg(feature = "metrics")]
        self.acked_total.inc();
    }

    #[inline]
    pub fn inc_nacked(&self) {
        #[cfg(feature = "metrics")]
        self.nacked_total.inc();
    }

    #[inline]
    pub fn inc_redelivered(&self) {
        #[cfg(feature = "metrics")]
        self.redelivered_total.inc();
    }

    #[inline]
    pub fn inc_dead_letter(&self) {
        #[cfg(feature = "metrics")]
        self.dead_letter_total.inc();
    }

    #[inline]
    pub fn inc_expired(&self) {
        #[cfg(feature = "metrics")]
        self.expired_total.inc();
    }

    #[inline]
    pub fn inc_shard_allocation(&self, _kind: &str) {
        #[cfg(feature = "metrics")]
        self.shard_allocations_total.with_label_values(&[_kind]).inc();
    }

    #[inline]
    pub fn set_buffer_size(&self, _queue: &str, _size: i64) {
        #[cfg(feature = "metrics")]
        self.buffer_size.with_label_values(&[_queue]).set(_size);
    }

    #[inline]
    pub fn observe_refresh_latency(&self, _secs: f64) {
        #[cfg(feature = "metrics")]
        self.refresh_latency_seconds.observe(_secs);
    }

    #[inline]
    pub fn observe_sweep_latency(&self, _secs: f64) {
        #[cfg(feature = "metrics")]
        self.sweep_latency_seconds.observe(_secs);
    }

    #[cfg(all(test, feature = "metrics"))]
    pub fn dead_letter_count(&self) -> u64 {
        self.dead_letter_total.get()
    }
}
