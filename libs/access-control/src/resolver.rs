use std::collections::{BTreeSet, HashMap};

use anyhow::anyhow;
use app_error::AppError;
use serde::{Deserialize, Serialize};

use crate::act::{Capability, CapabilitySet};
use crate::entity::{Grant, Principal, Resource, ResourceRef, Subject};

/// Hard ceiling on the number of parent links followed while resolving one resource. The tree
/// has no cycles; hitting the ceiling means the data is corrupt.
pub const MAX_PARENT_HOPS: usize = 16;

/// The rule that produced a decision, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
  AdminOverride,
  Direct,
  ViaGroup,
  InheritedFromParent,
  RootDefault,
}

impl Provenance {
  pub fn as_str(&self) -> &'static str {
    match self {
      Provenance::AdminOverride => "admin-override",
      Provenance::Direct => "direct",
      Provenance::ViaGroup => "via-group",
      Provenance::InheritedFromParent => "inherited-from-parent",
      Provenance::RootDefault => "root-default",
    }
  }
}

/// Answer for a single requested capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
  Granted(Provenance),
  Denied,
}

impl Decision {
  pub fn is_granted(&self) -> bool {
    matches!(self, Decision::Granted(_))
  }
}

/// The resolved permission of one principal on one resource. Each rule keeps the capabilities
/// it contributed so the provenance of any capability can be answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePermission {
  pub admin_override: bool,
  pub direct: CapabilitySet,
  pub via_group: CapabilitySet,
  pub inherited: CapabilitySet,
  /// The folder `inherited` was resolved on.
  pub inherited_from: Option<ResourceRef>,
  pub root_default: bool,
}

impl EffectivePermission {
  pub fn admin() -> Self {
    Self {
      admin_override: true,
      ..Default::default()
    }
  }

  pub fn denied() -> Self {
    Self::default()
  }

  /// Read granted on the root folder by default.
  pub fn root_default() -> Self {
    Self {
      root_default: true,
      ..Default::default()
    }
  }

  /// Union of the capabilities contributed by every rule.
  pub fn capabilities(&self) -> CapabilitySet {
    if self.admin_override {
      return CapabilitySet::all();
    }
    let mut set = self.direct | self.via_group | self.inherited;
    if self.root_default {
      set.insert(Capability::Read);
    }
    set
  }

  /// First rule, in precedence order, granting `capability`.
  pub fn provenance_of(&self, capability: Capability) -> Option<Provenance> {
    if self.admin_override {
      Some(Provenance::AdminOverride)
    } else if self.direct.contains(capability) {
      Some(Provenance::Direct)
    } else if self.via_group.contains(capability) {
      Some(Provenance::ViaGroup)
    } else if self.inherited.contains(capability) {
      Some(Provenance::InheritedFromParent)
    } else if self.root_default && capability == Capability::Read {
      Some(Provenance::RootDefault)
    } else {
      None
    }
  }

  pub fn decide(&self, capability: Capability) -> Decision {
    match self.provenance_of(capability) {
      Some(provenance) => Decision::Granted(provenance),
      None => Decision::Denied,
    }
  }

  pub fn allows(&self, capability: Capability) -> bool {
    self.provenance_of(capability).is_some()
  }
}

/// Grants loaded for one resolution pass, indexed by resource.
#[derive(Debug, Default, Clone)]
pub struct GrantSnapshot {
  by_resource: HashMap<ResourceRef, Vec<(Subject, CapabilitySet)>>,
}

impl GrantSnapshot {
  pub fn new(grants: Vec<Grant>) -> Self {
    let mut by_resource: HashMap<ResourceRef, Vec<(Subject, CapabilitySet)>> = HashMap::new();
    for grant in grants {
      by_resource
        .entry(grant.resource)
        .or_default()
        .push((grant.subject, grant.capabilities));
    }
    Self { by_resource }
  }

  pub fn direct(&self, uid: i64, resource: &ResourceRef) -> CapabilitySet {
    self
      .grants_on(resource)
      .filter(|(subject, _)| *subject == Subject::User(uid))
      .fold(CapabilitySet::empty(), |acc, (_, caps)| acc | caps)
  }

  /// Union over every group of the principal. Groups never intersect.
  pub fn via_groups(&self, groups: &BTreeSet<i64>, resource: &ResourceRef) -> CapabilitySet {
    self
      .group_grants(groups, resource)
      .fold(CapabilitySet::empty(), |acc, (_, caps)| acc | caps)
  }

  /// Group grants on `resource` held by any of `groups`.
  pub fn group_grants<'a>(
    &'a self,
    groups: &'a BTreeSet<i64>,
    resource: &ResourceRef,
  ) -> impl Iterator<Item = (i64, CapabilitySet)> + 'a {
    self
      .grants_on(resource)
      .filter_map(move |(subject, caps)| match subject {
        Subject::Group(group_id) if groups.contains(&group_id) => Some((group_id, caps)),
        _ => None,
      })
  }

  fn grants_on(&self, resource: &ResourceRef) -> impl Iterator<Item = (Subject, CapabilitySet)> + '_ {
    self
      .by_resource
      .get(resource)
      .into_iter()
      .flat_map(|grants| grants.iter().copied())
  }
}

/// Pure resolution of one (principal, resource) pair against an in-memory snapshot.
///
/// `resources` must contain the resource and, for a file, its parent folder.
pub fn compute_effective_permission(
  principal: &Principal,
  resource: &ResourceRef,
  resources: &HashMap<ResourceRef, Resource>,
  grants: &GrantSnapshot,
) -> Result<EffectivePermission, AppError> {
  if principal.is_admin {
    return Ok(EffectivePermission::admin());
  }

  let target = resources
    .get(resource)
    .ok_or_else(|| AppError::Internal(anyhow!("resource {} is not loaded", resource)))?;

  let mut permission = EffectivePermission {
    direct: grants.direct(principal.uid, resource),
    via_group: grants.via_groups(&principal.groups, resource),
    root_default: target.is_root(),
    ..Default::default()
  };

  if target.is_folder() {
    return Ok(permission);
  }

  let mut current = target.parent;
  let mut hops = 0;
  while let Some(parent_ref) = current {
    hops += 1;
    if hops > MAX_PARENT_HOPS {
      return Err(AppError::Internal(anyhow!(
        "parent chain of {} exceeds {} hops",
        resource,
        MAX_PARENT_HOPS
      )));
    }
    let parent = resources
      .get(&parent_ref)
      .ok_or_else(|| AppError::Internal(anyhow!("parent {} is not loaded", parent_ref)))?;
    if parent.is_folder() {
      let mut inherited = grants.direct(principal.uid, &parent_ref)
        | grants.via_groups(&principal.groups, &parent_ref);
      if parent.is_root() {
        inherited.insert(Capability::Read);
      }
      permission.inherited = inherited;
      permission.inherited_from = Some(parent_ref);
      break;
    }
    current = parent.parent;
  }
  Ok(permission)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entity::ResourceKind;

  fn folder(id: i64, path: &str, parent: Option<i64>) -> Resource {
    Resource {
      id,
      kind: ResourceKind::Folder,
      name: path.rsplit('/').next().unwrap_or_default().to_string(),
      path: path.to_string(),
      owner_uid: None,
      parent: parent.map(ResourceRef::folder),
    }
  }

  fn file(id: i64, path: &str, parent: i64) -> Resource {
    Resource {
      id,
      kind: ResourceKind::File,
      name: path.rsplit('/').next().unwrap_or_default().to_string(),
      path: path.to_string(),
      owner_uid: Some(1),
      parent: Some(ResourceRef::folder(parent)),
    }
  }

  fn tree() -> HashMap<ResourceRef, Resource> {
    [
      folder(1, "/", None),
      folder(2, "/A", Some(1)),
      file(3, "/A/doc.txt", 2),
      file(4, "/readme.md", 1),
    ]
    .into_iter()
    .map(|r| (r.resource_ref(), r))
    .collect()
  }

  #[test]
  fn direct_wins_over_group_test() {
    let mut principal = Principal::user(10);
    principal.groups.insert(20);
    let a = ResourceRef::folder(2);
    let grants = GrantSnapshot::new(vec![
      Grant::new(Subject::User(10), a, Capability::Read.into()),
      Grant::new(
        Subject::Group(20),
        a,
        [Capability::Read, Capability::Write].into_iter().collect(),
      ),
    ]);
    let perm = compute_effective_permission(&principal, &a, &tree(), &grants).unwrap();
    assert_eq!(perm.decide(Capability::Read), Decision::Granted(Provenance::Direct));
    assert_eq!(
      perm.decide(Capability::Write),
      Decision::Granted(Provenance::ViaGroup)
    );
    assert_eq!(perm.decide(Capability::Delete), Decision::Denied);
  }

  #[test]
  fn groups_are_unioned_test() {
    let mut principal = Principal::user(10);
    principal.groups.extend([20, 21]);
    let a = ResourceRef::folder(2);
    let grants = GrantSnapshot::new(vec![
      Grant::new(Subject::Group(20), a, Capability::Read.into()),
      Grant::new(Subject::Group(21), a, Capability::Share.into()),
      Grant::new(Subject::Group(99), a, Capability::Delete.into()),
    ]);
    let perm = compute_effective_permission(&principal, &a, &tree(), &grants).unwrap();
    assert_eq!(
      perm.capabilities(),
      [Capability::Read, Capability::Share].into_iter().collect()
    );
  }

  #[test]
  fn file_inherits_from_parent_folder_test() {
    let mut principal = Principal::user(10);
    principal.groups.insert(20);
    let grants = GrantSnapshot::new(vec![Grant::new(
      Subject::Group(20),
      ResourceRef::folder(2),
      Capability::Read.into(),
    )]);
    let perm =
      compute_effective_permission(&principal, &ResourceRef::file(3), &tree(), &grants).unwrap();
    assert_eq!(
      perm.decide(Capability::Read),
      Decision::Granted(Provenance::InheritedFromParent)
    );
    assert_eq!(perm.inherited_from, Some(ResourceRef::folder(2)));
    assert!(!perm.allows(Capability::Write));
  }

  #[test]
  fn root_default_only_on_root_test() {
    let principal = Principal::user(10);
    let grants = GrantSnapshot::default();
    let resources = tree();
    let root =
      compute_effective_permission(&principal, &ResourceRef::folder(1), &resources, &grants)
        .unwrap();
    assert_eq!(
      root.decide(Capability::Read),
      Decision::Granted(Provenance::RootDefault)
    );
    assert_eq!(root.decide(Capability::Write), Decision::Denied);

    let a = compute_effective_permission(&principal, &ResourceRef::folder(2), &resources, &grants)
      .unwrap();
    assert_eq!(a.decide(Capability::Read), Decision::Denied);

    // a file directly in the root inherits the root's default read
    let readme =
      compute_effective_permission(&principal, &ResourceRef::file(4), &resources, &grants)
        .unwrap();
    assert_eq!(
      readme.decide(Capability::Read),
      Decision::Granted(Provenance::InheritedFromParent)
    );
  }

  #[test]
  fn admin_override_test() {
    let mut principal = Principal::user(1);
    principal.is_admin = true;
    let perm = compute_effective_permission(
      &principal,
      &ResourceRef::folder(404),
      &HashMap::new(),
      &GrantSnapshot::default(),
    )
    .unwrap();
    assert_eq!(perm.capabilities(), CapabilitySet::all());
    assert_eq!(
      perm.decide(Capability::Share),
      Decision::Granted(Provenance::AdminOverride)
    );
  }

  #[test]
  fn parent_cycle_is_an_error_test() {
    let mut resources = HashMap::new();
    let mut a = file(1, "/x", 0);
    a.parent = Some(ResourceRef::file(2));
    let mut b = file(2, "/y", 0);
    b.parent = Some(ResourceRef::file(1));
    resources.insert(a.resource_ref(), a);
    resources.insert(b.resource_ref(), b);
    let result = compute_effective_permission(
      &Principal::user(1),
      &ResourceRef::file(1),
      &resources,
      &GrantSnapshot::default(),
    );
    assert!(result.is_err());
  }
}
