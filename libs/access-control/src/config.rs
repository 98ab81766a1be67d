use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::instrument::OperationClass;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 100_000;
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_TREE_DEPTH: usize = 5;
pub const DEFAULT_MAX_BULK_BATCH: usize = 500;
pub const DEFAULT_WARM_CACHE_LIMIT: usize = 100;

/// Tunables of the permission engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessControlSetting {
  pub cache_ttl: Duration,
  pub cache_max_entries: usize,
  pub cache_sweep_interval: Duration,
  pub max_tree_depth: usize,
  pub max_bulk_batch: usize,
  pub warm_cache_limit: usize,
  pub slow_thresholds: SlowOperationThresholds,
  pub dual_run: DualRunSetting,
}

impl Default for AccessControlSetting {
  fn default() -> Self {
    Self {
      cache_ttl: DEFAULT_CACHE_TTL,
      cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
      cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
      max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
      max_bulk_batch: DEFAULT_MAX_BULK_BATCH,
      warm_cache_limit: DEFAULT_WARM_CACHE_LIMIT,
      slow_thresholds: SlowOperationThresholds::default(),
      dual_run: DualRunSetting::default(),
    }
  }
}

/// A call slower than the threshold of its class is logged and counted, never failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowOperationThresholds {
  pub single: Duration,
  pub bulk: Duration,
  pub tree: Duration,
  pub accessible: Duration,
}

impl SlowOperationThresholds {
  pub fn threshold(&self, class: OperationClass) -> Duration {
    match class {
      OperationClass::Single => self.single,
      OperationClass::Bulk => self.bulk,
      OperationClass::Tree => self.tree,
      OperationClass::Accessible => self.accessible,
    }
  }
}

impl Default for SlowOperationThresholds {
  fn default() -> Self {
    Self {
      single: Duration::from_millis(20),
      bulk: Duration::from_millis(100),
      tree: Duration::from_millis(100),
      accessible: Duration::from_millis(250),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualRunSetting {
  pub enabled: bool,
  /// Fraction of bulk resolutions replayed through the reference resolver, in `[0, 1]`.
  pub sample_rate: f64,
  pub max_inflight: usize,
}

impl Default for DualRunSetting {
  fn default() -> Self {
    Self {
      enabled: false,
      sample_rate: 0.01,
      max_inflight: 4,
    }
  }
}
