#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use access_control::act::{Capability, CapabilitySet};
use access_control::cache::{CacheEntry, CacheKey, CacheStats, MemoryPermissionCache, PermissionCache};
use access_control::config::AccessControlSetting;
use access_control::engine::PermissionEngine;
use access_control::entity::{
  normalize_path, Grant, Principal, Resource, ResourceKind, ResourceRef, Subject, ROOT_PATH,
};
use access_control::memory::MemoryGrantStore;
use access_control::metrics::AccessControlMetrics;
use access_control::resolver::EffectivePermission;
use access_control::store::GrantStore;
use app_error::AppError;
use async_trait::async_trait;
use tokio::sync::Notify;

pub const ADMIN_UID: i64 = 1;

pub struct TestEngine {
  pub store: Arc<MemoryGrantStore>,
  pub cache: Arc<MemoryPermissionCache>,
  pub metrics: Arc<AccessControlMetrics>,
  pub engine: Arc<PermissionEngine>,
}

pub async fn setup_engine() -> TestEngine {
  setup_engine_with(AccessControlSetting::default()).await
}

pub async fn setup_engine_with(setting: AccessControlSetting) -> TestEngine {
  let store = Arc::new(MemoryGrantStore::new());
  store.add_user(ADMIN_UID, true).await;
  let cache = Arc::new(MemoryPermissionCache::new(setting.cache_max_entries));
  let metrics = Arc::new(AccessControlMetrics::default());
  let engine = Arc::new(PermissionEngine::new(
    store.clone(),
    cache.clone(),
    setting,
    metrics.clone(),
  ));
  TestEngine {
    store,
    cache,
    metrics,
    engine,
  }
}

/// Creates the folder at `path` and every missing folder above it.
pub async fn mkdir(store: &dyn GrantStore, path: &str) -> Resource {
  let path = normalize_path(path);
  let mut current = store.root_folder().await.unwrap();
  if path == ROOT_PATH {
    return current;
  }
  let mut prefix = String::new();
  for segment in path.trim_start_matches('/').split('/') {
    prefix.push('/');
    prefix.push_str(segment);
    let existing = store
      .resources_by_paths(&[prefix.clone()])
      .await
      .unwrap()
      .into_iter()
      .find(|r| r.is_folder());
    current = match existing {
      Some(folder) => folder,
      None => store
        .create_resource(ResourceKind::Folder, &prefix, current.id, None)
        .await
        .unwrap(),
    };
  }
  current
}

/// Creates the file at `path`, and its folders.
pub async fn touch(store: &dyn GrantStore, path: &str) -> Resource {
  let path = normalize_path(path);
  let parent_path = match path.rfind('/') {
    Some(0) | None => ROOT_PATH.to_string(),
    Some(index) => path[..index].to_string(),
  };
  let parent = mkdir(store, &parent_path).await;
  store
    .create_resource(ResourceKind::File, &path, parent.id, Some(ADMIN_UID))
    .await
    .unwrap()
}

pub async fn grant(
  engine: &PermissionEngine,
  subject: Subject,
  resource: &Resource,
  capabilities: &[Capability],
) {
  engine
    .grant(
      subject,
      resource.resource_ref(),
      capabilities.iter().copied().collect::<CapabilitySet>(),
    )
    .await
    .unwrap();
}

/// Delegates to a [MemoryGrantStore]. Once armed, the next `grants_for` call reads the grants
/// then parks until released, so a mutation can land between the read and the cache write.
pub struct GatedStore {
  pub inner: Arc<MemoryGrantStore>,
  armed: AtomicBool,
  pub reached: Notify,
  pub release: Notify,
}

impl GatedStore {
  pub fn new(inner: Arc<MemoryGrantStore>) -> Self {
    Self {
      inner,
      armed: AtomicBool::new(false),
      reached: Notify::new(),
      release: Notify::new(),
    }
  }

  pub fn arm(&self) {
    self.armed.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl GrantStore for GatedStore {
  async fn principal(&self, uid: i64) -> Result<Option<Principal>, AppError> {
    self.inner.principal(uid).await
  }

  async fn root_folder(&self) -> Result<Resource, AppError> {
    self.inner.root_folder().await
  }

  async fn resources_by_paths(&self, paths: &[String]) -> Result<Vec<Resource>, AppError> {
    self.inner.resources_by_paths(paths).await
  }

  async fn resources(&self, refs: &[ResourceRef]) -> Result<Vec<Resource>, AppError> {
    self.inner.resources(refs).await
  }

  async fn children(&self, folder_ids: &[i64]) -> Result<Vec<Resource>, AppError> {
    self.inner.children(folder_ids).await
  }

  async fn all_folders(&self) -> Result<Vec<Resource>, AppError> {
    self.inner.all_folders().await
  }

  async fn grants_for(
    &self,
    subjects: &[Subject],
    refs: &[ResourceRef],
  ) -> Result<Vec<Grant>, AppError> {
    let grants = self.inner.grants_for(subjects, refs).await?;
    if self.armed.swap(false, Ordering::SeqCst) {
      self.reached.notify_one();
      self.release.notified().await;
    }
    Ok(grants)
  }

  async fn group_members(&self, group_id: i64) -> Result<Vec<i64>, AppError> {
    self.inner.group_members(group_id).await
  }

  async fn grant_targets(
    &self,
    subjects: &[Subject],
    limit: usize,
  ) -> Result<Vec<ResourceRef>, AppError> {
    self.inner.grant_targets(subjects, limit).await
  }

  async fn upsert_grant(&self, grant: &Grant) -> Result<(), AppError> {
    self.inner.upsert_grant(grant).await
  }

  async fn delete_grant(&self, subject: Subject, resource: ResourceRef) -> Result<bool, AppError> {
    self.inner.delete_grant(subject, resource).await
  }

  async fn add_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError> {
    self.inner.add_group_member(group_id, uid).await
  }

  async fn remove_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError> {
    self.inner.remove_group_member(group_id, uid).await
  }

  async fn create_resource(
    &self,
    kind: ResourceKind,
    path: &str,
    parent_id: i64,
    owner_uid: Option<i64>,
  ) -> Result<Resource, AppError> {
    self
      .inner
      .create_resource(kind, path, parent_id, owner_uid)
      .await
  }

  async fn set_admin(&self, uid: i64, is_admin: bool) -> Result<bool, AppError> {
    self.inner.set_admin(uid, is_admin).await
  }
}

/// A [MemoryPermissionCache] whose invalidation and clear can be made to fail.
pub struct FlakyCache {
  pub inner: MemoryPermissionCache,
  pub fail_invalidate: AtomicBool,
  pub fail_clear: AtomicBool,
}

impl FlakyCache {
  pub fn new() -> Self {
    Self {
      inner: MemoryPermissionCache::new(1000),
      fail_invalidate: AtomicBool::new(false),
      fail_clear: AtomicBool::new(false),
    }
  }

  fn check(&self, flag: &AtomicBool, op: &str) -> Result<(), AppError> {
    if flag.load(Ordering::SeqCst) {
      return Err(AppError::CacheUnavailable(format!("{} failed", op)));
    }
    Ok(())
  }
}

#[async_trait]
impl PermissionCache for FlakyCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<EffectivePermission>, AppError> {
    self.inner.get(key).await
  }

  async fn get_many(
    &self,
    keys: &[CacheKey],
  ) -> Result<HashMap<CacheKey, EffectivePermission>, AppError> {
    self.inner.get_many(keys).await
  }

  async fn put(&self, entry: CacheEntry) -> Result<(), AppError> {
    self.inner.put(entry).await
  }

  async fn remove(&self, key: &CacheKey) -> Result<(), AppError> {
    self.check(&self.fail_invalidate, "remove")?;
    self.inner.remove(key).await
  }

  async fn invalidate(&self, resource: &ResourceRef) -> Result<u64, AppError> {
    self.check(&self.fail_invalidate, "invalidate")?;
    self.inner.invalidate(resource).await
  }

  async fn invalidate_for_principal(&self, uid: i64) -> Result<u64, AppError> {
    self.check(&self.fail_invalidate, "invalidate_for_principal")?;
    self.inner.invalidate_for_principal(uid).await
  }

  async fn invalidate_for_group(&self, group_id: i64) -> Result<u64, AppError> {
    self.check(&self.fail_invalidate, "invalidate_for_group")?;
    self.inner.invalidate_for_group(group_id).await
  }

  async fn clear(&self) -> Result<(), AppError> {
    self.check(&self.fail_clear, "clear")?;
    self.inner.clear().await
  }

  async fn sweep_expired(&self) -> Result<u64, AppError> {
    self.inner.sweep_expired().await
  }

  async fn stats(&self) -> Result<CacheStats, AppError> {
    self.inner.stats().await
  }
}

/// A [MemoryPermissionCache] whose next `put_many` parks until released.
pub struct GatedCache {
  pub inner: MemoryPermissionCache,
  armed: AtomicBool,
  pub reached: Notify,
  pub release: Notify,
}

impl GatedCache {
  pub fn new() -> Self {
    Self {
      inner: MemoryPermissionCache::new(1000),
      armed: AtomicBool::new(false),
      reached: Notify::new(),
      release: Notify::new(),
    }
  }

  pub fn arm(&self) {
    self.armed.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl PermissionCache for GatedCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<EffectivePermission>, AppError> {
    self.inner.get(key).await
  }

  async fn get_many(
    &self,
    keys: &[CacheKey],
  ) -> Result<HashMap<CacheKey, EffectivePermission>, AppError> {
    self.inner.get_many(keys).await
  }

  async fn put(&self, entry: CacheEntry) -> Result<(), AppError> {
    self.inner.put(entry).await
  }

  async fn put_many(&self, entries: Vec<CacheEntry>) -> Result<(), AppError> {
    if self.armed.swap(false, Ordering::SeqCst) {
      self.reached.notify_one();
      self.release.notified().await;
    }
    self.inner.put_many(entries).await
  }

  async fn remove(&self, key: &CacheKey) -> Result<(), AppError> {
    self.inner.remove(key).await
  }

  async fn invalidate(&self, resource: &ResourceRef) -> Result<u64, AppError> {
    self.inner.invalidate(resource).await
  }

  async fn invalidate_for_principal(&self, uid: i64) -> Result<u64, AppError> {
    self.inner.invalidate_for_principal(uid).await
  }

  async fn invalidate_for_group(&self, group_id: i64) -> Result<u64, AppError> {
    self.inner.invalidate_for_group(group_id).await
  }

  async fn clear(&self) -> Result<(), AppError> {
    self.inner.clear().await
  }

  async fn sweep_expired(&self) -> Result<u64, AppError> {
    self.inner.sweep_expired().await
  }

  async fn stats(&self) -> Result<CacheStats, AppError> {
    self.inner.stats().await
  }
}

/// Polls `f` until it returns true or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  while tokio::time::Instant::now() < deadline {
    if f() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  f()
}
