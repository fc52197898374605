//! Prometheus metrics for event ingestion

use prometheus::{register_int_counter_with_registry, IntCounter, Opts, Registry};

#[derive(Clone)]
pub struct IngestionMetrics {
    pub applied: IntCounter,
    pub duplicates: IntCounter,
    pub dead_lettered: IntCounter,
    pub apply_failures: IntCounter,
}

impl IngestionMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            applied: register_int_counter_with_registry!(
                Opts::new("ingestion_applied_total", "Events applied to the graph"),
                registry
            )?,
            duplicates: register_int_counter_with_registry!(
                Opts::new("ingestion_duplicates_total", "Redelivered events skipped"),
                registry
            )?,
            dead_lettered: register_int_counter_with_registry!(
                Opts::new("ingestion_dead_lettered_total", "Poison events parked"),
                registry
            )?,
            apply_failures: register_int_counter_with_registry!(
                Opts::new(
                    "ingestion_apply_failures_total",
                    "Transient apply failures (batch stopped)"
                ),
                registry
            )?,
        })
    }
}
