mod memory;
mod redis_cache;

pub use memory::MemoryPermissionCache;
pub use redis_cache::RedisPermissionCache;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use app_error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::ResourceRef;
use crate::resolver::EffectivePermission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  pub uid: i64,
  pub resource: ResourceRef,
}

impl CacheKey {
  pub fn new(uid: i64, resource: ResourceRef) -> Self {
    Self { uid, resource }
  }
}

/// A resolver output to memoize, with what it was computed from.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub permission: EffectivePermission,
  /// Groups of the principal at computation time.
  pub groups: Vec<i64>,
  /// Folder the entry was inherited from. A grant change on it must drop this entry too.
  pub depends_on: Option<ResourceRef>,
  pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  pub entries: u64,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub invalidations: u64,
}

/// Time bounded store of resolver outputs keyed by (principal, resource, resource-kind).
///
/// Entries past their expiry behave as a miss. A cache never creates a decision: losing any or
/// all of its entries only costs latency.
#[async_trait]
pub trait PermissionCache: Send + Sync + 'static {
  async fn get(&self, key: &CacheKey) -> Result<Option<EffectivePermission>, AppError>;

  async fn get_many(
    &self,
    keys: &[CacheKey],
  ) -> Result<HashMap<CacheKey, EffectivePermission>, AppError>;

  async fn put(&self, entry: CacheEntry) -> Result<(), AppError>;

  async fn put_many(&self, entries: Vec<CacheEntry>) -> Result<(), AppError> {
    for entry in entries {
      self.put(entry).await?;
    }
    Ok(())
  }

  async fn remove(&self, key: &CacheKey) -> Result<(), AppError>;

  /// Drops every entry of `resource` for every principal, plus the entries that inherited
  /// from it. Returns the number of entries removed.
  async fn invalidate(&self, resource: &ResourceRef) -> Result<u64, AppError>;

  async fn invalidate_for_principal(&self, uid: i64) -> Result<u64, AppError>;

  /// Drops every entry of every principal that was a member of `group_id` when the entry was
  /// computed.
  async fn invalidate_for_group(&self, group_id: i64) -> Result<u64, AppError>;

  async fn clear(&self) -> Result<(), AppError>;

  /// Removes expired entries. Returns the number removed.
  async fn sweep_expired(&self) -> Result<u64, AppError>;

  async fn stats(&self) -> Result<CacheStats, AppError>;
}

#[derive(Default)]
pub(crate) struct CacheCounters {
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  invalidations: AtomicU64,
}

impl CacheCounters {
  pub(crate) fn hit(&self, n: u64) {
    self.hits.fetch_add(n, Ordering::Relaxed);
  }

  pub(crate) fn miss(&self, n: u64) {
    self.misses.fetch_add(n, Ordering::Relaxed);
  }

  pub(crate) fn evicted(&self, n: u64) {
    self.evictions.fetch_add(n, Ordering::Relaxed);
  }

  pub(crate) fn invalidated(&self, n: u64) {
    self.invalidations.fetch_add(n, Ordering::Relaxed);
  }

  pub(crate) fn snapshot(&self, entries: u64) -> CacheStats {
    CacheStats {
      entries,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
    }
  }
}
