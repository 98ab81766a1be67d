use std::collections::HashMap;

use app_error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use super::{CacheCounters, CacheEntry, CacheKey, CacheStats, PermissionCache};
use crate::entity::{ResourceKind, ResourceRef};
use crate::resolver::EffectivePermission;

const KEY_PREFIX: &str = "ac:perm:v1";
const SCAN_BATCH: usize = 500;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
  permission: EffectivePermission,
  computed_at: DateTime<Utc>,
  expires_at: DateTime<Utc>,
}

/// [PermissionCache] shared by every instance through Redis.
///
/// Layout, all under `ac:perm:v1`:
/// - `e:<uid>:<kind>:<id>` the JSON entry, expiring with the entry ttl
/// - `res:<kind>:<id>` set of uids holding an entry for the resource
/// - `uid:<uid>` set of `<kind>:<id>` cached for the user
/// - `grp:<group_id>` set of uids whose entries were computed as members of the group
/// - `dep:<kind>:<id>` set of entry keys inherited from the folder
///
/// Index sets expire with the most recent entry added to them.
pub struct RedisPermissionCache {
  conn: ConnectionManager,
  counters: CacheCounters,
}

impl RedisPermissionCache {
  pub async fn new(redis_uri: &str) -> Result<Self, AppError> {
    let client = redis::Client::open(redis_uri)?;
    let conn = ConnectionManager::new(client).await?;
    info!("[permission cache]: connected to redis");
    Ok(Self::from_connection(conn))
  }

  pub fn from_connection(conn: ConnectionManager) -> Self {
    Self {
      conn,
      counters: CacheCounters::default(),
    }
  }
}

fn entry_key(key: &CacheKey) -> String {
  format!(
    "{}:e:{}:{}:{}",
    KEY_PREFIX,
    key.uid,
    key.resource.kind.as_str(),
    key.resource.id
  )
}

fn resource_member(resource: &ResourceRef) -> String {
  format!("{}:{}", resource.kind.as_str(), resource.id)
}

fn parse_resource_member(member: &str) -> Option<ResourceRef> {
  let (kind, id) = member.split_once(':')?;
  let kind = match kind {
    "folder" => ResourceKind::Folder,
    "file" => ResourceKind::File,
    _ => return None,
  };
  Some(ResourceRef {
    kind,
    id: id.parse().ok()?,
  })
}

fn resource_index_key(resource: &ResourceRef) -> String {
  format!("{}:res:{}", KEY_PREFIX, resource_member(resource))
}

fn principal_index_key(uid: i64) -> String {
  format!("{}:uid:{}", KEY_PREFIX, uid)
}

fn group_index_key(group_id: i64) -> String {
  format!("{}:grp:{}", KEY_PREFIX, group_id)
}

fn dependents_index_key(resource: &ResourceRef) -> String {
  format!("{}:dep:{}", KEY_PREFIX, resource_member(resource))
}

impl RedisPermissionCache {
  async fn delete_keys(&self, keys: Vec<String>) -> Result<u64, AppError> {
    if keys.is_empty() {
      return Ok(0);
    }
    let mut conn = self.conn.clone();
    let removed = redis::cmd("DEL")
      .arg(&keys)
      .query_async::<_, u64>(&mut conn)
      .await?;
    Ok(removed)
  }

  async fn members(&self, key: &str) -> Result<Vec<String>, AppError> {
    let mut conn = self.conn.clone();
    let members = redis::cmd("SMEMBERS")
      .arg(key)
      .query_async::<_, Vec<String>>(&mut conn)
      .await?;
    Ok(members)
  }

  async fn scan(&self, pattern: &str) -> Result<Vec<String>, AppError> {
    let mut conn = self.conn.clone();
    let mut cursor = 0u64;
    let mut keys = vec![];
    loop {
      let (next, batch) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(SCAN_BATCH)
        .query_async::<_, (u64, Vec<String>)>(&mut conn)
        .await?;
      keys.extend(batch);
      if next == 0 {
        break;
      }
      cursor = next;
    }
    Ok(keys)
  }

  /// Deletes the entries of `uid` and its index set. Entry counts come from DEL so keys that
  /// already expired are not counted.
  async fn drop_principal(&self, uid: i64) -> Result<u64, AppError> {
    let index_key = principal_index_key(uid);
    let keys = self
      .members(&index_key)
      .await?
      .iter()
      .filter_map(|member| parse_resource_member(member))
      .map(|resource| entry_key(&CacheKey::new(uid, resource)))
      .collect::<Vec<_>>();
    let removed = self.delete_keys(keys).await?;
    self.delete_keys(vec![index_key]).await?;
    Ok(removed)
  }
}

#[async_trait]
impl PermissionCache for RedisPermissionCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<EffectivePermission>, AppError> {
    let mut conn = self.conn.clone();
    let value = redis::cmd("GET")
      .arg(entry_key(key))
      .query_async::<_, Option<String>>(&mut conn)
      .await?;
    let permission = value
      .and_then(|data| serde_json::from_str::<StoredEntry>(&data).ok())
      .filter(|entry| entry.expires_at > Utc::now())
      .map(|entry| entry.permission);
    match permission {
      Some(_) => self.counters.hit(1),
      None => self.counters.miss(1),
    }
    Ok(permission)
  }

  async fn get_many(
    &self,
    keys: &[CacheKey],
  ) -> Result<HashMap<CacheKey, EffectivePermission>, AppError> {
    if keys.is_empty() {
      return Ok(HashMap::new());
    }
    let mut conn = self.conn.clone();
    let values = redis::cmd("MGET")
      .arg(keys.iter().map(entry_key).collect::<Vec<_>>())
      .query_async::<_, Vec<Option<String>>>(&mut conn)
      .await?;
    let now = Utc::now();
    let found = keys
      .iter()
      .zip(values)
      .filter_map(|(key, value)| {
        let entry = serde_json::from_str::<StoredEntry>(&value?).ok()?;
        (entry.expires_at > now).then_some((*key, entry.permission))
      })
      .collect::<HashMap<_, _>>();
    self.counters.hit(found.len() as u64);
    self.counters.miss((keys.len() - found.len()) as u64);
    Ok(found)
  }

  async fn put(&self, entry: CacheEntry) -> Result<(), AppError> {
    self.put_many(vec![entry]).await
  }

  async fn put_many(&self, entries: Vec<CacheEntry>) -> Result<(), AppError> {
    if entries.is_empty() {
      return Ok(());
    }
    let now = Utc::now();
    let mut pipe = redis::pipe();
    pipe.atomic();
    for entry in &entries {
      let ttl_ms = entry.ttl.as_millis().max(1) as u64;
      let stored = StoredEntry {
        permission: entry.permission.clone(),
        computed_at: now,
        expires_at: now
          + chrono::Duration::from_std(entry.ttl).unwrap_or_else(|_| chrono::Duration::zero()),
      };
      let key = entry_key(&entry.key);
      pipe
        .cmd("SET")
        .arg(&key)
        .arg(serde_json::to_string(&stored)?)
        .arg("PX")
        .arg(ttl_ms)
        .ignore();

      let mut index = vec![
        (resource_index_key(&entry.key.resource), entry.key.uid.to_string()),
        (
          principal_index_key(entry.key.uid),
          resource_member(&entry.key.resource),
        ),
      ];
      for group_id in &entry.groups {
        index.push((group_index_key(*group_id), entry.key.uid.to_string()));
      }
      if let Some(parent) = &entry.depends_on {
        index.push((dependents_index_key(parent), key.clone()));
      }
      for (set_key, member) in index {
        pipe.cmd("SADD").arg(&set_key).arg(member).ignore();
        pipe.cmd("PEXPIRE").arg(&set_key).arg(ttl_ms).ignore();
      }
    }
    let mut conn = self.conn.clone();
    pipe.query_async::<_, ()>(&mut conn).await?;
    trace!("[permission cache]: stored {} entries", entries.len());
    Ok(())
  }

  async fn remove(&self, key: &CacheKey) -> Result<(), AppError> {
    self.delete_keys(vec![entry_key(key)]).await?;
    Ok(())
  }

  async fn invalidate(&self, resource: &ResourceRef) -> Result<u64, AppError> {
    let resource_index = resource_index_key(resource);
    let dependents_index = dependents_index_key(resource);
    let mut keys = self
      .members(&resource_index)
      .await?
      .iter()
      .filter_map(|uid| uid.parse::<i64>().ok())
      .map(|uid| entry_key(&CacheKey::new(uid, *resource)))
      .collect::<Vec<_>>();
    keys.extend(self.members(&dependents_index).await?);
    let removed = self.delete_keys(keys).await?;
    self
      .delete_keys(vec![resource_index, dependents_index])
      .await?;
    self.counters.invalidated(removed);
    trace!(
      "[permission cache]: invalidated {} entries of {}",
      removed,
      resource
    );
    Ok(removed)
  }

  async fn invalidate_for_principal(&self, uid: i64) -> Result<u64, AppError> {
    let removed = self.drop_principal(uid).await?;
    self.counters.invalidated(removed);
    Ok(removed)
  }

  async fn invalidate_for_group(&self, group_id: i64) -> Result<u64, AppError> {
    let group_index = group_index_key(group_id);
    let uids = self
      .members(&group_index)
      .await?
      .iter()
      .filter_map(|uid| uid.parse::<i64>().ok())
      .collect::<Vec<_>>();
    let mut removed = 0;
    for uid in uids {
      removed += self.drop_principal(uid).await?;
    }
    self.delete_keys(vec![group_index]).await?;
    self.counters.invalidated(removed);
    Ok(removed)
  }

  async fn clear(&self) -> Result<(), AppError> {
    let keys = self.scan(&format!("{}:*", KEY_PREFIX)).await?;
    for chunk in keys.chunks(SCAN_BATCH) {
      self.delete_keys(chunk.to_vec()).await?;
    }
    info!("[permission cache]: cleared {} redis keys", keys.len());
    Ok(())
  }

  /// Redis expires entries on its own.
  async fn sweep_expired(&self) -> Result<u64, AppError> {
    Ok(0)
  }

  async fn stats(&self) -> Result<CacheStats, AppError> {
    let entries = self.scan(&format!("{}:e:*", KEY_PREFIX)).await?.len() as u64;
    Ok(self.counters.snapshot(entries))
  }
}
