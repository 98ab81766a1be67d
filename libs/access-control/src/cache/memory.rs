use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use app_error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::{CacheCounters, CacheEntry, CacheKey, CacheStats, PermissionCache};
use crate::entity::ResourceRef;
use crate::resolver::EffectivePermission;

struct StoredEntry {
  permission: EffectivePermission,
  expires_at: Instant,
  depends_on: Option<ResourceRef>,
}

/// In-process [PermissionCache] bounded by `max_entries`.
///
/// Reverse indexes map a resource, a principal, a group and a parent folder to the entries
/// that must be dropped when it changes. A set is dropped once its last entry is removed.
/// Group sets may still name principals without entries until the next sweep; invalidating
/// those is a no-op.
pub struct MemoryPermissionCache {
  entries: DashMap<CacheKey, StoredEntry>,
  by_resource: DashMap<ResourceRef, HashSet<i64>>,
  by_principal: DashMap<i64, HashSet<ResourceRef>>,
  by_group: DashMap<i64, HashSet<i64>>,
  dependents: DashMap<ResourceRef, HashSet<CacheKey>>,
  max_entries: usize,
  counters: CacheCounters,
}

impl MemoryPermissionCache {
  pub fn new(max_entries: usize) -> Self {
    Self {
      entries: DashMap::new(),
      by_resource: DashMap::new(),
      by_principal: DashMap::new(),
      by_group: DashMap::new(),
      dependents: DashMap::new(),
      max_entries: max_entries.max(1),
      counters: CacheCounters::default(),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn remove_entry(&self, key: &CacheKey) -> bool {
    let Some((_, entry)) = self.entries.remove(key) else {
      return false;
    };
    unindex(&self.by_resource, &key.resource, &key.uid);
    unindex(&self.by_principal, &key.uid, &key.resource);
    if let Some(parent) = entry.depends_on {
      unindex(&self.dependents, &parent, key);
    }
    true
  }

  /// Drops group members that no longer have any entry.
  fn prune_groups(&self) {
    self.by_group.retain(|_, uids| {
      uids.retain(|uid| self.by_principal.contains_key(uid));
      !uids.is_empty()
    });
  }

  #[cfg(test)]
  fn index_sizes(&self) -> [usize; 4] {
    [
      self.by_resource.len(),
      self.by_principal.len(),
      self.by_group.len(),
      self.dependents.len(),
    ]
  }

  fn remove_keys(&self, keys: impl IntoIterator<Item = CacheKey>) -> u64 {
    keys
      .into_iter()
      .filter(|key| self.remove_entry(key))
      .count() as u64
  }

  /// Makes room for one more entry: expired entries first, then an arbitrary one.
  fn evict_for_insert(&self) {
    if self.entries.len() < self.max_entries {
      return;
    }
    let now = Instant::now();
    let expired = self
      .entries
      .iter()
      .filter(|e| e.value().expires_at <= now)
      .map(|e| *e.key())
      .collect::<Vec<_>>();
    let mut evicted = self.remove_keys(expired);
    while self.entries.len() >= self.max_entries {
      let victim = self.entries.iter().next().map(|e| *e.key());
      match victim {
        Some(key) => {
          if self.remove_entry(&key) {
            evicted += 1;
          }
        },
        None => break,
      }
    }
    if evicted > 0 {
      trace!("[permission cache]: evicted {} entries", evicted);
      self.counters.evicted(evicted);
    }
  }

  fn lookup(&self, key: &CacheKey, now: Instant) -> Option<EffectivePermission> {
    let expired = {
      let entry = self.entries.get(key)?;
      if entry.expires_at > now {
        return Some(entry.permission.clone());
      }
      true
    };
    if expired && self.remove_entry(key) {
      self.counters.evicted(1);
    }
    None
  }
}

/// Removes `member` from the set under `key`, and the set itself once empty.
fn unindex<K, V>(index: &DashMap<K, HashSet<V>>, key: &K, member: &V)
where
  K: Eq + Hash,
  V: Eq + Hash,
{
  if let Some(mut set) = index.get_mut(key) {
    set.remove(member);
  }
  index.remove_if(key, |_, set| set.is_empty());
}

#[async_trait]
impl PermissionCache for MemoryPermissionCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<EffectivePermission>, AppError> {
    let value = self.lookup(key, Instant::now());
    match value {
      Some(_) => self.counters.hit(1),
      None => self.counters.miss(1),
    }
    Ok(value)
  }

  async fn get_many(
    &self,
    keys: &[CacheKey],
  ) -> Result<HashMap<CacheKey, EffectivePermission>, AppError> {
    let now = Instant::now();
    let found = keys
      .iter()
      .filter_map(|key| self.lookup(key, now).map(|value| (*key, value)))
      .collect::<HashMap<_, _>>();
    self.counters.hit(found.len() as u64);
    self.counters.miss((keys.len() - found.len()) as u64);
    Ok(found)
  }

  async fn put(&self, entry: CacheEntry) -> Result<(), AppError> {
    let key = entry.key;
    if !self.entries.contains_key(&key) {
      self.evict_for_insert();
    } else {
      self.remove_entry(&key);
    }
    self.by_resource.entry(key.resource).or_default().insert(key.uid);
    self.by_principal.entry(key.uid).or_default().insert(key.resource);
    for group_id in &entry.groups {
      self.by_group.entry(*group_id).or_default().insert(key.uid);
    }
    if let Some(parent) = entry.depends_on {
      self.dependents.entry(parent).or_default().insert(key);
    }
    self.entries.insert(key, StoredEntry {
      permission: entry.permission,
      expires_at: Instant::now() + entry.ttl,
      depends_on: entry.depends_on,
    });
    Ok(())
  }

  async fn remove(&self, key: &CacheKey) -> Result<(), AppError> {
    self.remove_entry(key);
    Ok(())
  }

  async fn invalidate(&self, resource: &ResourceRef) -> Result<u64, AppError> {
    let mut keys = self
      .by_resource
      .remove(resource)
      .map(|(_, uids)| uids)
      .unwrap_or_default()
      .into_iter()
      .map(|uid| CacheKey::new(uid, *resource))
      .collect::<Vec<_>>();
    if let Some((_, dependents)) = self.dependents.remove(resource) {
      keys.extend(dependents);
    }
    let removed = self.remove_keys(keys);
    trace!(
      "[permission cache]: invalidated {} entries of {}",
      removed,
      resource
    );
    self.counters.invalidated(removed);
    Ok(removed)
  }

  async fn invalidate_for_principal(&self, uid: i64) -> Result<u64, AppError> {
    let keys = self
      .by_principal
      .remove(&uid)
      .map(|(_, resources)| resources)
      .unwrap_or_default()
      .into_iter()
      .map(|resource| CacheKey::new(uid, resource))
      .collect::<Vec<_>>();
    let removed = self.remove_keys(keys);
    self.counters.invalidated(removed);
    Ok(removed)
  }

  async fn invalidate_for_group(&self, group_id: i64) -> Result<u64, AppError> {
    let uids = self
      .by_group
      .remove(&group_id)
      .map(|(_, uids)| uids)
      .unwrap_or_default();
    let mut removed = 0;
    for uid in uids {
      removed += self.invalidate_for_principal(uid).await?;
    }
    Ok(removed)
  }

  async fn clear(&self) -> Result<(), AppError> {
    self.entries.clear();
    self.by_resource.clear();
    self.by_principal.clear();
    self.by_group.clear();
    self.dependents.clear();
    Ok(())
  }

  async fn sweep_expired(&self) -> Result<u64, AppError> {
    let now = Instant::now();
    let expired = self
      .entries
      .iter()
      .filter(|e| e.value().expires_at <= now)
      .map(|e| *e.key())
      .collect::<Vec<_>>();
    let removed = self.remove_keys(expired);
    self.prune_groups();
    self.counters.evicted(removed);
    Ok(removed)
  }

  async fn stats(&self) -> Result<CacheStats, AppError> {
    Ok(self.counters.snapshot(self.entries.len() as u64))
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::act::Capability;

  fn entry(uid: i64, resource: ResourceRef, ttl: Duration) -> CacheEntry {
    CacheEntry {
      key: CacheKey::new(uid, resource),
      permission: EffectivePermission {
        direct: Capability::Read.into(),
        ..Default::default()
      },
      groups: vec![],
      depends_on: None,
      ttl,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn expired_entry_is_a_miss_test() {
    let cache = MemoryPermissionCache::new(10);
    let key = CacheKey::new(1, ResourceRef::folder(1));
    cache
      .put(entry(1, ResourceRef::folder(1), Duration::from_secs(60)))
      .await
      .unwrap();
    assert!(cache.get(&key).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(cache.get(&key).await.unwrap().is_none());

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.entries, 0);
  }

  #[tokio::test]
  async fn capacity_is_bounded_test() {
    let cache = MemoryPermissionCache::new(3);
    for id in 0..10 {
      cache
        .put(entry(1, ResourceRef::file(id), Duration::from_secs(60)))
        .await
        .unwrap();
    }
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.stats().await.unwrap().evictions, 7);
  }

  #[tokio::test]
  async fn indexes_shrink_with_entries_test() {
    let cache = MemoryPermissionCache::new(3);
    for id in 0..1000 {
      let mut file_entry = entry(id, ResourceRef::file(id), Duration::from_secs(60));
      file_entry.groups = vec![id, 5000];
      file_entry.depends_on = Some(ResourceRef::folder(id));
      cache.put(file_entry).await.unwrap();
    }
    assert_eq!(cache.len(), 3);
    let [by_resource, by_principal, _, dependents] = cache.index_sizes();
    assert_eq!(by_resource, 3);
    assert_eq!(by_principal, 3);
    assert_eq!(dependents, 3);

    assert_eq!(cache.sweep_expired().await.unwrap(), 0);
    // one group per remaining principal, plus the group they share
    assert_eq!(cache.index_sizes(), [3, 3, 4, 3]);
    assert_eq!(cache.by_group.get(&5000).unwrap().len(), 3);

    for key in cache.entries.iter().map(|e| *e.key()).collect::<Vec<_>>() {
      cache.remove(&key).await.unwrap();
    }
    cache.sweep_expired().await.unwrap();
    assert!(cache.is_empty());
    assert_eq!(cache.index_sizes(), [0, 0, 0, 0]);
  }

  #[tokio::test]
  async fn folder_invalidation_drops_dependent_files_test() {
    let cache = MemoryPermissionCache::new(100);
    let folder = ResourceRef::folder(1);
    let file = ResourceRef::file(2);
    cache
      .put(entry(7, folder, Duration::from_secs(60)))
      .await
      .unwrap();
    let mut file_entry = entry(8, file, Duration::from_secs(60));
    file_entry.depends_on = Some(folder);
    cache.put(file_entry).await.unwrap();
    cache
      .put(entry(9, ResourceRef::folder(3), Duration::from_secs(60)))
      .await
      .unwrap();

    assert_eq!(cache.invalidate(&folder).await.unwrap(), 2);
    assert!(cache.get(&CacheKey::new(8, file)).await.unwrap().is_none());
    assert!(cache
      .get(&CacheKey::new(9, ResourceRef::folder(3)))
      .await
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn group_invalidation_drops_members_test() {
    let cache = MemoryPermissionCache::new(100);
    let mut member = entry(1, ResourceRef::folder(1), Duration::from_secs(60));
    member.groups = vec![42];
    cache.put(member).await.unwrap();
    cache
      .put(entry(2, ResourceRef::folder(1), Duration::from_secs(60)))
      .await
      .unwrap();

    assert_eq!(cache.invalidate_for_group(42).await.unwrap(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().await.unwrap().invalidations, 1);
  }
}
