use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus_client::encoding::EncodeLabelValue;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, trace, warn};

use crate::config::{DualRunSetting, SlowOperationThresholds};
use crate::entity::{Principal, Resource, ResourceRef};
use crate::metrics::AccessControlMetrics;
use crate::resolver::EffectivePermission;
use crate::store::GrantStore;
use crate::strategy::PermissionResolver;

/// Call shape of a public engine operation. Each class has its own slow threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EncodeLabelValue)]
pub enum OperationClass {
  Single,
  Bulk,
  Tree,
  Accessible,
}

impl OperationClass {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationClass::Single => "single",
      OperationClass::Bulk => "bulk",
      OperationClass::Tree => "tree",
      OperationClass::Accessible => "accessible",
    }
  }
}

/// Times engine calls. A call over its threshold is logged, never failed.
#[derive(Clone)]
pub struct Instrumentation {
  thresholds: SlowOperationThresholds,
  metrics: Arc<AccessControlMetrics>,
}

impl Instrumentation {
  pub fn new(thresholds: SlowOperationThresholds, metrics: Arc<AccessControlMetrics>) -> Self {
    Self {
      thresholds,
      metrics,
    }
  }

  pub async fn measure<F, T>(&self, class: OperationClass, op: &'static str, count: usize, f: F) -> T
  where
    F: Future<Output = T>,
  {
    let start = Instant::now();
    let output = f.await;
    self.record(class, op, count, start.elapsed());
    output
  }

  pub fn record(&self, class: OperationClass, op: &'static str, count: usize, elapsed: Duration) {
    let threshold = self.thresholds.threshold(class);
    let slow = elapsed > threshold;
    if slow {
      warn!(
        "[permission]: slow {} operation {}: {} resources in {}ms, threshold {}ms",
        class.as_str(),
        op,
        count,
        elapsed.as_millis(),
        threshold.as_millis()
      );
    } else {
      trace!(
        "[permission]: {} {} resources in {}us",
        op,
        count,
        elapsed.as_micros()
      );
    }
    self.metrics.record_operation(class, elapsed, slow);
  }
}

/// Replays a sample of resolutions through a reference resolver off the request path and
/// reports results that differ.
pub struct DualRunVerifier {
  sample_rate: f64,
  reference: Arc<dyn PermissionResolver>,
  permits: Arc<Semaphore>,
  metrics: Arc<AccessControlMetrics>,
  checked: Arc<AtomicU64>,
  mismatches: Arc<AtomicU64>,
}

impl DualRunVerifier {
  pub fn new(
    setting: &DualRunSetting,
    reference: Arc<dyn PermissionResolver>,
    metrics: Arc<AccessControlMetrics>,
  ) -> Self {
    Self {
      sample_rate: setting.sample_rate.clamp(0.0, 1.0),
      reference,
      permits: Arc::new(Semaphore::new(setting.max_inflight.max(1))),
      metrics,
      checked: Arc::new(AtomicU64::new(0)),
      mismatches: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Number of completed replays.
  pub fn checked(&self) -> u64 {
    self.checked.load(Ordering::SeqCst)
  }

  /// Number of resources whose results differed.
  pub fn mismatches(&self) -> u64 {
    self.mismatches.load(Ordering::SeqCst)
  }

  fn sampled(&self) -> bool {
    self.sample_rate >= 1.0 || (self.sample_rate > 0.0 && rand::random::<f64>() < self.sample_rate)
  }

  /// Never waits: when sampled and a permit is free, the replay runs on a detached task,
  /// otherwise it is dropped.
  pub fn maybe_verify(
    &self,
    store: Arc<dyn GrantStore>,
    principal: Principal,
    resources: Vec<Resource>,
    expected: HashMap<ResourceRef, EffectivePermission>,
  ) {
    if resources.is_empty() || !self.sampled() {
      return;
    }
    let Ok(permit) = self.permits.clone().try_acquire_owned() else {
      debug!("[permission dual run]: all permits busy, dropping sample");
      return;
    };
    let reference = self.reference.clone();
    let metrics = self.metrics.clone();
    let checked = self.checked.clone();
    let mismatches = self.mismatches.clone();
    tokio::spawn(async move {
      let _permit = permit;
      match reference
        .resolve_many(store.as_ref(), &principal, &resources)
        .await
      {
        Ok(actual) => {
          let diverged = compare_results(principal.uid, &expected, &actual);
          if diverged > 0 {
            mismatches.fetch_add(diverged, Ordering::SeqCst);
            metrics.record_dual_run_mismatch(diverged);
          }
        },
        Err(err) => {
          debug!(
            "[permission dual run]: {} resolver failed: {}",
            reference.name(),
            err
          );
        },
      }
      checked.fetch_add(1, Ordering::SeqCst);
    });
  }
}

fn compare_results(
  uid: i64,
  expected: &HashMap<ResourceRef, EffectivePermission>,
  actual: &HashMap<ResourceRef, EffectivePermission>,
) -> u64 {
  let mut diverged = 0;
  for (resource, permission) in expected {
    let reference = actual.get(resource);
    if reference != Some(permission) {
      diverged += 1;
      error!(
        "[permission dual run]: mismatch for uid {} on {}: batch={:?}, reference={:?}",
        uid, resource, permission, reference
      );
    }
  }
  diverged
}
