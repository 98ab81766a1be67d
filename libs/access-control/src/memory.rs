use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use app_error::AppError;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::act::CapabilitySet;
use crate::entity::{
  normalize_path, path_name, Grant, Principal, Resource, ResourceKind, ResourceRef, Subject,
  ROOT_PATH,
};
use crate::store::GrantStore;

#[derive(Default)]
struct MemoryState {
  admins: HashSet<i64>,
  users: HashSet<i64>,
  memberships: HashMap<i64, BTreeSet<i64>>,
  resources: HashMap<ResourceRef, Resource>,
  folder_paths: HashMap<String, i64>,
  file_paths: HashMap<String, i64>,
  grants: HashMap<(Subject, ResourceRef), CapabilitySet>,
  next_id: i64,
}

impl MemoryState {
  fn next_id(&mut self) -> i64 {
    self.next_id += 1;
    self.next_id
  }

  fn insert(&mut self, resource: Resource) {
    match resource.kind {
      ResourceKind::Folder => self.folder_paths.insert(resource.path.clone(), resource.id),
      ResourceKind::File => self.file_paths.insert(resource.path.clone(), resource.id),
    };
    self.resources.insert(resource.resource_ref(), resource);
  }
}

/// A [GrantStore] kept in process memory. Used by tests and local runs.
///
/// It counts every call as one round trip and can simulate an outage or a slow backend.
#[derive(Default)]
pub struct MemoryGrantStore {
  state: RwLock<MemoryState>,
  round_trips: AtomicU64,
  unavailable: AtomicBool,
  latency_micros: AtomicU64,
}

impl MemoryGrantStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn add_user(&self, uid: i64, is_admin: bool) {
    let mut state = self.state.write().await;
    state.users.insert(uid);
    if is_admin {
      state.admins.insert(uid);
    } else {
      state.admins.remove(&uid);
    }
  }

  /// Number of calls served since creation or the last reset.
  pub fn round_trips(&self) -> u64 {
    self.round_trips.load(Ordering::SeqCst)
  }

  pub fn reset_round_trips(&self) {
    self.round_trips.store(0, Ordering::SeqCst);
  }

  /// While set, every call fails with [AppError::StoreUnavailable].
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Delay applied to every call.
  pub fn set_latency(&self, latency: Duration) {
    self
      .latency_micros
      .store(latency.as_micros() as u64, Ordering::SeqCst);
  }

  async fn round_trip(&self, op: &str) -> Result<(), AppError> {
    self.round_trips.fetch_add(1, Ordering::SeqCst);
    let latency = self.latency_micros.load(Ordering::SeqCst);
    if latency > 0 {
      tokio::time::sleep(Duration::from_micros(latency)).await;
    }
    if self.unavailable.load(Ordering::SeqCst) {
      trace!("[memory store]: {} rejected, store unavailable", op);
      return Err(AppError::StoreUnavailable(format!(
        "memory store is offline ({})",
        op
      )));
    }
    Ok(())
  }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
  async fn principal(&self, uid: i64) -> Result<Option<Principal>, AppError> {
    self.round_trip("principal").await?;
    let state = self.state.read().await;
    let groups = state.memberships.get(&uid).cloned();
    if !state.users.contains(&uid) && groups.is_none() {
      return Ok(None);
    }
    Ok(Some(Principal {
      uid,
      is_admin: state.admins.contains(&uid),
      groups: groups.unwrap_or_default(),
    }))
  }

  async fn root_folder(&self) -> Result<Resource, AppError> {
    self.round_trip("root_folder").await?;
    let mut state = self.state.write().await;
    if let Some(id) = state.folder_paths.get(ROOT_PATH) {
      if let Some(root) = state.resources.get(&ResourceRef::folder(*id)) {
        return Ok(root.clone());
      }
    }
    let root = Resource {
      id: state.next_id(),
      kind: ResourceKind::Folder,
      name: String::new(),
      path: ROOT_PATH.to_string(),
      owner_uid: None,
      parent: None,
    };
    state.insert(root.clone());
    Ok(root)
  }

  async fn resources_by_paths(&self, paths: &[String]) -> Result<Vec<Resource>, AppError> {
    self.round_trip("resources_by_paths").await?;
    let state = self.state.read().await;
    let mut resources = vec![];
    for path in paths {
      if let Some(id) = state.folder_paths.get(path) {
        resources.extend(state.resources.get(&ResourceRef::folder(*id)).cloned());
      }
      if let Some(id) = state.file_paths.get(path) {
        resources.extend(state.resources.get(&ResourceRef::file(*id)).cloned());
      }
    }
    Ok(resources)
  }

  async fn resources(&self, refs: &[ResourceRef]) -> Result<Vec<Resource>, AppError> {
    self.round_trip("resources").await?;
    let state = self.state.read().await;
    Ok(
      refs
        .iter()
        .filter_map(|r| state.resources.get(r).cloned())
        .collect(),
    )
  }

  async fn children(&self, folder_ids: &[i64]) -> Result<Vec<Resource>, AppError> {
    self.round_trip("children").await?;
    let parents = folder_ids
      .iter()
      .map(|id| ResourceRef::folder(*id))
      .collect::<HashSet<_>>();
    let state = self.state.read().await;
    let mut children = state
      .resources
      .values()
      .filter(|r| r.parent.map(|p| parents.contains(&p)).unwrap_or(false))
      .cloned()
      .collect::<Vec<_>>();
    children.sort_by(|a, b| a.path.cmp(&b.path).then(a.kind.cmp(&b.kind)));
    Ok(children)
  }

  async fn all_folders(&self) -> Result<Vec<Resource>, AppError> {
    self.round_trip("all_folders").await?;
    let state = self.state.read().await;
    let mut folders = state
      .resources
      .values()
      .filter(|r| r.is_folder())
      .cloned()
      .collect::<Vec<_>>();
    folders.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(folders)
  }

  async fn grants_for(
    &self,
    subjects: &[Subject],
    refs: &[ResourceRef],
  ) -> Result<Vec<Grant>, AppError> {
    self.round_trip("grants_for").await?;
    let state = self.state.read().await;
    let mut grants = vec![];
    for resource in refs.iter().collect::<HashSet<_>>() {
      for subject in subjects {
        if let Some(capabilities) = state.grants.get(&(*subject, *resource)) {
          grants.push(Grant::new(*subject, *resource, *capabilities));
        }
      }
    }
    Ok(grants)
  }

  async fn group_members(&self, group_id: i64) -> Result<Vec<i64>, AppError> {
    self.round_trip("group_members").await?;
    let state = self.state.read().await;
    let mut members = state
      .memberships
      .iter()
      .filter(|(_, groups)| groups.contains(&group_id))
      .map(|(uid, _)| *uid)
      .collect::<Vec<_>>();
    members.sort_unstable();
    Ok(members)
  }

  async fn grant_targets(
    &self,
    subjects: &[Subject],
    limit: usize,
  ) -> Result<Vec<ResourceRef>, AppError> {
    self.round_trip("grant_targets").await?;
    let state = self.state.read().await;
    let targets = state
      .grants
      .keys()
      .filter(|(subject, _)| subjects.contains(subject))
      .map(|(_, resource)| *resource)
      .collect::<BTreeSet<_>>();
    Ok(targets.into_iter().take(limit).collect())
  }

  async fn upsert_grant(&self, grant: &Grant) -> Result<(), AppError> {
    self.round_trip("upsert_grant").await?;
    let mut state = self.state.write().await;
    if !state.resources.contains_key(&grant.resource) {
      return Err(AppError::InvalidResource(grant.resource.to_string()));
    }
    state
      .grants
      .insert((grant.subject, grant.resource), grant.capabilities);
    Ok(())
  }

  async fn delete_grant(&self, subject: Subject, resource: ResourceRef) -> Result<bool, AppError> {
    self.round_trip("delete_grant").await?;
    let mut state = self.state.write().await;
    Ok(state.grants.remove(&(subject, resource)).is_some())
  }

  async fn add_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError> {
    self.round_trip("add_group_member").await?;
    let mut state = self.state.write().await;
    state.users.insert(uid);
    Ok(state.memberships.entry(uid).or_default().insert(group_id))
  }

  async fn remove_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError> {
    self.round_trip("remove_group_member").await?;
    let mut state = self.state.write().await;
    Ok(
      state
        .memberships
        .get_mut(&uid)
        .map(|groups| groups.remove(&group_id))
        .unwrap_or(false),
    )
  }

  async fn create_resource(
    &self,
    kind: ResourceKind,
    path: &str,
    parent_id: i64,
    owner_uid: Option<i64>,
  ) -> Result<Resource, AppError> {
    self.round_trip("create_resource").await?;
    let path = normalize_path(path);
    let mut state = self.state.write().await;
    let parent = ResourceRef::folder(parent_id);
    if !state.resources.contains_key(&parent) {
      return Err(AppError::InvalidResource(parent.to_string()));
    }
    let exists = match kind {
      ResourceKind::Folder => state.folder_paths.contains_key(&path),
      ResourceKind::File => state.file_paths.contains_key(&path),
    };
    if exists {
      return Err(AppError::RecordAlreadyExists(path));
    }
    if path == ROOT_PATH {
      return Err(AppError::Internal(anyhow!("the root folder can not be created")));
    }
    let resource = Resource {
      id: state.next_id(),
      kind,
      name: path_name(&path).to_string(),
      path,
      owner_uid,
      parent: Some(parent),
    };
    state.insert(resource.clone());
    Ok(resource)
  }

  async fn set_admin(&self, uid: i64, is_admin: bool) -> Result<bool, AppError> {
    self.round_trip("set_admin").await?;
    let mut state = self.state.write().await;
    state.users.insert(uid);
    let changed = if is_admin {
      state.admins.insert(uid)
    } else {
      state.admins.remove(&uid)
    };
    Ok(changed)
  }
}
