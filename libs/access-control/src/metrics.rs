use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::warn;

use crate::cache::PermissionCache;
use crate::instrument::OperationClass;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
  pub class: OperationClass,
}

fn latency_histogram() -> Histogram {
  // 0.5ms .. ~4s
  Histogram::new(exponential_buckets(0.0005, 2.0, 14))
}

#[derive(Clone)]
pub struct AccessControlMetrics {
  operation_seconds: Family<OperationLabels, Histogram, fn() -> Histogram>,
  slow_operations: Family<OperationLabels, Counter>,
  cache_hits: Counter,
  cache_misses: Counter,
  cache_entries: Gauge,
  cache_bypassed: Gauge,
  grant_mutations: Counter,
  dual_run_mismatches: Counter,
}

impl Default for AccessControlMetrics {
  fn default() -> Self {
    Self::init()
  }
}

impl AccessControlMetrics {
  fn init() -> Self {
    Self {
      operation_seconds: Family::new_with_constructor(latency_histogram as fn() -> Histogram),
      slow_operations: Family::default(),
      cache_hits: Counter::default(),
      cache_misses: Counter::default(),
      cache_entries: Gauge::default(),
      cache_bypassed: Gauge::default(),
      grant_mutations: Counter::default(),
      dual_run_mismatches: Counter::default(),
    }
  }

  pub fn register(registry: &mut Registry) -> Self {
    let metrics = Self::init();
    let ac_registry = registry.sub_registry_with_prefix("ac");
    ac_registry.register(
      "operation_seconds",
      "permission engine call duration in seconds by operation class",
      metrics.operation_seconds.clone(),
    );
    ac_registry.register(
      "slow_operations",
      "permission engine calls slower than the threshold of their class",
      metrics.slow_operations.clone(),
    );
    ac_registry.register(
      "cache_hits",
      "permission lookups served from the cache",
      metrics.cache_hits.clone(),
    );
    ac_registry.register(
      "cache_misses",
      "permission lookups resolved against the grant store",
      metrics.cache_misses.clone(),
    );
    ac_registry.register(
      "cache_entries",
      "entries in the permission cache",
      metrics.cache_entries.clone(),
    );
    ac_registry.register(
      "cache_bypassed",
      "1 while the permission cache is bypassed after a failed invalidation",
      metrics.cache_bypassed.clone(),
    );
    ac_registry.register(
      "grant_mutations",
      "grant and group membership changes applied",
      metrics.grant_mutations.clone(),
    );
    ac_registry.register(
      "dual_run_mismatches",
      "results that differ between the batch and the reference resolver",
      metrics.dual_run_mismatches.clone(),
    );
    metrics
  }

  pub fn record_operation(&self, class: OperationClass, elapsed: Duration, slow: bool) {
    let labels = OperationLabels { class };
    self
      .operation_seconds
      .get_or_create(&labels)
      .observe(elapsed.as_secs_f64());
    if slow {
      self.slow_operations.get_or_create(&labels).inc();
    }
  }

  pub fn slow_operation_count(&self, class: OperationClass) -> u64 {
    self
      .slow_operations
      .get_or_create(&OperationLabels { class })
      .get()
  }

  pub fn record_cache_lookup(&self, hits: u64, misses: u64) {
    self.cache_hits.inc_by(hits);
    self.cache_misses.inc_by(misses);
  }

  pub fn record_cache_bypassed(&self, bypassed: bool) {
    self.cache_bypassed.set(i64::from(bypassed));
  }

  pub fn record_grant_mutation(&self) {
    self.grant_mutations.inc();
  }

  pub fn record_dual_run_mismatch(&self, count: u64) {
    self.dual_run_mismatches.inc_by(count);
  }

  pub fn dual_run_mismatch_count(&self) -> u64 {
    self.dual_run_mismatches.get()
  }
}

/// Periodically copies the cache size into the `cache_entries` gauge.
pub fn tick_metric(
  cache: Arc<dyn PermissionCache>,
  metrics: Arc<AccessControlMetrics>,
  period: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = interval(period);
    loop {
      interval.tick().await;
      match cache.stats().await {
        Ok(stats) => {
          metrics.cache_entries.set(stats.entries as i64);
        },
        Err(err) => warn!("[permission cache]: failed to read stats: {}", err),
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use prometheus_client::encoding::text::encode;

  use super::*;

  #[test]
  fn metrics_are_encoded_with_prefix_test() {
    let mut registry = Registry::default();
    let metrics = AccessControlMetrics::register(&mut registry);
    metrics.record_operation(OperationClass::Bulk, Duration::from_millis(150), true);
    metrics.record_cache_lookup(3, 1);

    let mut body = String::new();
    encode(&mut body, &registry).unwrap();
    assert!(body.contains("ac_operation_seconds_bucket"));
    assert!(body.contains("ac_slow_operations_total{class=\"Bulk\"} 1"));
    assert!(body.contains("ac_cache_hits_total 3"));
    assert_eq!(metrics.slow_operation_count(OperationClass::Bulk), 1);
    assert_eq!(metrics.slow_operation_count(OperationClass::Tree), 0);
  }
}
