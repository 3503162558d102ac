//! Prometheus metrics for credential validation.
//!
//! Each `AuthMetrics` owns its registry so several services (and tests) can
//! coexist in one process. `render()` produces the text exposition format
//! for a `/metrics` endpoint.

use prometheus::{
    opts, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Registry, TextEncoder,
};

/// Where a validation found (or failed to find) its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupTier {
    Current,
    Legacy,
    FullScan,
    Miss,
}

impl LookupTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupTier::Current => "current",
            LookupTier::Legacy => "legacy",
            LookupTier::FullScan => "full_scan",
            LookupTier::Miss => "miss",
        }
    }
}

pub struct AuthMetrics {
    registry: Registry,
    validations_total: IntCounterVec,
    lookups_total: IntCounterVec,
    full_scan_records: Histogram,
    migrations_total: IntCounterVec,
    circuit_open: IntGauge,
}

impl AuthMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let validations_total = IntCounterVec::new(
            opts!("keygate_validations_total", "API key validations by outcome"),
            &["outcome"],
        )?;
        let lookups_total = IntCounterVec::new(
            opts!("keygate_lookups_total", "Key lookups by resolving tier"),
            &["tier"],
        )?;
        let full_scan_records = Histogram::with_opts(
            HistogramOpts::new(
                "keygate_full_scan_records",
                "Records examined per full-scan fallback",
            )
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )?;
        let migrations_total = IntCounterVec::new(
            opts!("keygate_migrations_total", "Hash migrations by outcome"),
            &["outcome"],
        )?;
        let circuit_open = IntGauge::new(
            "keygate_circuit_open",
            "1 while the full-scan circuit breaker is open",
        )?;

        registry.register(Box::new(validations_total.clone()))?;
        registry.register(Box::new(lookups_total.clone()))?;
        registry.register(Box::new(full_scan_records.clone()))?;
        registry.register(Box::new(migrations_total.clone()))?;
        registry.register(Box::new(circuit_open.clone()))?;

        Ok(Self {
            registry,
            validations_total,
            lookups_total,
            full_scan_records,
            migrations_total,
            circuit_open,
        })
    }

    pub fn record_validation(&self, outcome: &str) {
        self.validations_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_lookup(&self, tier: LookupTier) {
        self.lookups_total.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn observe_full_scan(&self, records: usize) {
        self.full_scan_records.observe(records as f64);
    }

    pub fn record_migration(&self, outcome: &str) {
        self.migrations_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_circuit_open(&self, open: bool) {
        self.circuit_open.set(i64::from(open));
    }

    pub fn validations(&self, outcome: &str) -> u64 {
        self.validations_total.with_label_values(&[outcome]).get()
    }

    pub fn lookups(&self, tier: LookupTier) -> u64 {
        self.lookups_total.with_label_values(&[tier.as_str()]).get()
    }

    pub fn migrations(&self, outcome: &str) -> u64 {
        self.migrations_total.with_label_values(&[outcome]).get()
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for AuthMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMetrics").finish_non_exhaustive()
    }
}
