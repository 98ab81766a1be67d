use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use app_error::AppError;
use async_trait::async_trait;
use tracing::trace;

use crate::act::{Capability, CapabilitySet};
use crate::entity::{Principal, Resource, ResourceRef, Subject};
use crate::resolver::{
  compute_effective_permission, EffectivePermission, GrantSnapshot, MAX_PARENT_HOPS,
};
use crate::store::GrantStore;

/// Strategy used to resolve a set of already loaded resources for one principal.
#[async_trait]
pub trait PermissionResolver: Send + Sync + 'static {
  fn name(&self) -> &'static str;

  async fn resolve_many(
    &self,
    store: &dyn GrantStore,
    principal: &Principal,
    resources: &[Resource],
  ) -> Result<HashMap<ResourceRef, EffectivePermission>, AppError>;
}

/// Resolves any number of resources with a constant number of store reads: the missing parent
/// folders in one call, then every grant of the principal and its groups on the whole set in
/// another.
#[derive(Debug, Default, Clone)]
pub struct BatchResolver;

#[async_trait]
impl PermissionResolver for BatchResolver {
  fn name(&self) -> &'static str {
    "batch"
  }

  async fn resolve_many(
    &self,
    store: &dyn GrantStore,
    principal: &Principal,
    resources: &[Resource],
  ) -> Result<HashMap<ResourceRef, EffectivePermission>, AppError> {
    if resources.is_empty() {
      return Ok(HashMap::new());
    }
    if principal.is_admin {
      return Ok(
        resources
          .iter()
          .map(|r| (r.resource_ref(), EffectivePermission::admin()))
          .collect(),
      );
    }

    let mut loaded = resources
      .iter()
      .map(|r| (r.resource_ref(), r.clone()))
      .collect::<HashMap<_, _>>();

    // Only files fall back to their parent. Walk up until every file reaches a folder.
    let mut pending = resources
      .iter()
      .filter(|r| !r.is_folder())
      .filter_map(|r| r.parent)
      .filter(|p| !loaded.contains_key(p))
      .collect::<HashSet<_>>();
    let mut hops = 0;
    while !pending.is_empty() && hops < MAX_PARENT_HOPS {
      hops += 1;
      let refs = pending.drain().collect::<Vec<_>>();
      for parent in store.resources(&refs).await? {
        if !parent.is_folder() {
          if let Some(grand_parent) = parent.parent {
            if !loaded.contains_key(&grand_parent) {
              pending.insert(grand_parent);
            }
          }
        }
        loaded.insert(parent.resource_ref(), parent);
      }
    }

    let refs = loaded.keys().copied().collect::<Vec<_>>();
    let grants = store.grants_for(&principal.subjects(), &refs).await?;
    trace!(
      "[permission]: batch resolving {} resources for uid {} with {} grants",
      resources.len(),
      principal.uid,
      grants.len()
    );
    let snapshot = GrantSnapshot::new(grants);

    let mut result = HashMap::with_capacity(resources.len());
    for resource in resources {
      let resource_ref = resource.resource_ref();
      let permission = compute_effective_permission(principal, &resource_ref, &loaded, &snapshot)?;
      result.insert(resource_ref, permission);
    }
    Ok(result)
  }
}

/// Reference strategy: every resource is resolved on its own, following the precedence rules
/// step by step with separate store reads. Costs O(n) round trips.
#[derive(Debug, Default, Clone)]
pub struct NaiveResolver;

impl NaiveResolver {
  async fn capabilities_on(
    store: &dyn GrantStore,
    principal: &Principal,
    resource: &ResourceRef,
  ) -> Result<(CapabilitySet, CapabilitySet), AppError> {
    let grants = store
      .grants_for(&principal.subjects(), std::slice::from_ref(resource))
      .await?;
    let mut direct = CapabilitySet::empty();
    let mut via_group = CapabilitySet::empty();
    for grant in grants.iter().filter(|g| g.resource == *resource) {
      match grant.subject {
        Subject::User(uid) if uid == principal.uid => direct |= grant.capabilities,
        Subject::Group(group_id) if principal.groups.contains(&group_id) => {
          via_group |= grant.capabilities
        },
        _ => {},
      }
    }
    Ok((direct, via_group))
  }

  async fn resolve_one(
    store: &dyn GrantStore,
    principal: &Principal,
    resource: &Resource,
  ) -> Result<EffectivePermission, AppError> {
    if principal.is_admin {
      return Ok(EffectivePermission::admin());
    }
    let resource_ref = resource.resource_ref();
    let (direct, via_group) = Self::capabilities_on(store, principal, &resource_ref).await?;
    let mut permission = EffectivePermission {
      direct,
      via_group,
      root_default: resource.is_root(),
      ..Default::default()
    };
    if resource.is_folder() {
      return Ok(permission);
    }

    let mut next = resource.parent;
    for _ in 0..MAX_PARENT_HOPS {
      let Some(parent_ref) = next else {
        return Ok(permission);
      };
      let parent = store
        .resources(&[parent_ref])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Internal(anyhow!("parent {} does not exist", parent_ref)))?;
      if parent.is_folder() {
        let (direct, via_group) = Self::capabilities_on(store, principal, &parent_ref).await?;
        permission.inherited = direct | via_group;
        if parent.is_root() {
          permission.inherited.insert(Capability::Read);
        }
        permission.inherited_from = Some(parent_ref);
        return Ok(permission);
      }
      next = parent.parent;
    }
    Err(AppError::Internal(anyhow!(
      "parent chain of {} exceeds {} hops",
      resource_ref,
      MAX_PARENT_HOPS
    )))
  }
}

#[async_trait]
impl PermissionResolver for NaiveResolver {
  fn name(&self) -> &'static str {
    "naive"
  }

  async fn resolve_many(
    &self,
    store: &dyn GrantStore,
    principal: &Principal,
    resources: &[Resource],
  ) -> Result<HashMap<ResourceRef, EffectivePermission>, AppError> {
    let mut result = HashMap::with_capacity(resources.len());
    for resource in resources {
      let permission = Self::resolve_one(store, principal, resource).await?;
      result.insert(resource.resource_ref(), permission);
    }
    Ok(result)
  }
}
