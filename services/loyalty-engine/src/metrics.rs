use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Registry served on `/metrics`
    pub static ref REGISTRY: Registry = Registry::new();

    // Ledger metrics
    pub static ref PURCHASES_TOTAL: IntCounter = IntCounter::new(
        "loyalty_purchases_total",
        "Total committed purchases"
    ).expect("metric can be created");

    pub static ref REDEMPTIONS_TOTAL: IntCounter = IntCounter::new(
        "loyalty_redemptions_total",
        "Total committed redemptions"
    ).expect("metric can be created");

    pub static ref LEDGER_REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("loyalty_ledger_rejections_total", "Ledger operations that did not commit"),
        &["operation", "reason"]
    ).expect("metric can be created");

    pub static ref POINTS_EARNED: IntCounter = IntCounter::new(
        "loyalty_points_earned_total",
        "Total points credited by purchases"
    ).expect("metric can be created");

    pub static ref POINTS_SPENT: IntCounter = IntCounter::new(
        "loyalty_points_spent_total",
        "Total points debited by redemptions"
    ).expect("metric can be created");

    pub static ref LEDGER_OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("loyalty_ledger_operation_duration_seconds", "Ledger operation duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["operation"]
    ).expect("metric can be created");

    // Cache metrics
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "loyalty_cache_hits_total",
        "Total cache hits"
    ).expect("metric can be created");

    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "loyalty_cache_misses_total",
        "Total cache misses"
    ).expect("metric can be created");

    pub static ref CACHE_EVICTIONS: IntCounter = IntCounter::new(
        "loyalty_cache_evictions_total",
        "Cache entries evicted by ledger writes"
    ).expect("metric can be created");
}

/// Register all metrics with the given registry
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(PURCHASES_TOTAL.clone()))?;
    registry.register(Box::new(REDEMPTIONS_TOTAL.clone()))?;
    registry.register(Box::new(LEDGER_REJECTIONS.clone()))?;
    registry.register(Box::new(POINTS_EARNED.clone()))?;
    registry.register(Box::new(POINTS_SPENT.clone()))?;
    registry.register(Box::new(LEDGER_OPERATION_DURATION.clone()))?;

    registry.register(Box::new(CACHE_HITS.clone()))?;
    registry.register(Box::new(CACHE_MISSES.clone()))?;
    registry.register(Box::new(CACHE_EVICTIONS.clone()))?;

    Ok(())
}

/// Prometheus text exposition of [`struct@REGISTRY`]
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let registry = Registry::new();
        assert!(register_metrics(&registry).is_ok());

        // Double registration is rejected
        assert!(register_metrics(&registry).is_err());
    }

    #[test]
    fn test_registered_metrics_are_exported() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();

        PURCHASES_TOTAL.inc();
        LEDGER_REJECTIONS
            .with_label_values(&["redeem", "insufficient_points"])
            .inc();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"loyalty_purchases_total".to_string()));
        assert!(names.contains(&"loyalty_ledger_rejections_total".to_string()));
    }
}
