//! Prometheus metrics for index synchronization

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Opts, Registry,
};

#[derive(Clone)]
pub struct SearchSyncMetrics {
    pub written: IntCounter,
    pub discarded: IntCounter,
    pub retries: IntCounter,
    pub desyncs: IntCounter,
    pub desync_pending: IntGauge,
}

impl SearchSyncMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            written: register_int_counter_with_registry!(
                Opts::new("search_sync_written_total", "Index documents written"),
                registry
            )?,
            discarded: register_int_counter_with_registry!(
                Opts::new(
                    "search_sync_discarded_total",
                    "Notifications older than the indexed version"
                ),
                registry
            )?,
            retries: register_int_counter_with_registry!(
                Opts::new("search_sync_retries_total", "Requeued index writes"),
                registry
            )?,
            desyncs: register_int_counter_with_registry!(
                Opts::new(
                    "search_sync_desync_total",
                    "Entities given up on after max retries"
                ),
                registry
            )?,
            desync_pending: register_int_gauge_with_registry!(
                Opts::new(
                    "search_sync_desync_pending",
                    "Entities waiting for the reconciliation sweep"
                ),
                registry
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        assert!(SearchSyncMetrics::new(&registry).is_ok());
        assert!(SearchSyncMetrics::new(&registry).is_err());
    }
}
