use std::collections::HashMap;

use app_error::AppError;
use serde::{Deserialize, Serialize};

use crate::act::{Capability, CapabilitySet};
use crate::entity::{Principal, Resource, ResourceRef, Subject};
use crate::resolver::{compute_effective_permission, EffectivePermission, GrantSnapshot};
use crate::store::GrantStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainRule {
  AdminOverride,
  Direct,
  ViaGroup,
  InheritedFromParent,
  RootDefault,
  Deny,
}

/// One rule of the resolution order and what it contributed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainStep {
  pub rule: ExplainRule,
  pub matched: bool,
  pub capabilities: CapabilitySet,
  pub detail: String,
}

/// Diagnostic trail of a single resolution, computed fresh from the grant store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainReport {
  pub uid: i64,
  pub is_admin: bool,
  pub groups: Vec<i64>,
  pub resource: ResourceRef,
  pub path: String,
  pub owner_uid: Option<i64>,
  pub steps: Vec<ExplainStep>,
  pub permission: EffectivePermission,
  pub effective: CapabilitySet,
  /// What the cache currently holds for the pair. A value different from `effective` means the
  /// entry is stale.
  pub cached: Option<CapabilitySet>,
}

impl ExplainReport {
  /// The rules that granted something, in precedence order.
  pub fn fired(&self) -> Vec<ExplainRule> {
    self
      .steps
      .iter()
      .filter(|step| step.matched)
      .map(|step| step.rule)
      .collect()
  }
}

pub(crate) async fn explain_resolution(
  store: &dyn GrantStore,
  principal: &Principal,
  resource: Resource,
  cached: Option<&EffectivePermission>,
) -> Result<ExplainReport, AppError> {
  let resource_ref = resource.resource_ref();
  let mut loaded = HashMap::from([(resource_ref, resource.clone())]);
  let mut parent = None;
  if !resource.is_folder() {
    if let Some(parent_ref) = resource.parent {
      if let Some(folder) = store.resources(&[parent_ref]).await?.into_iter().next() {
        loaded.insert(parent_ref, folder.clone());
        parent = Some(folder);
      }
    }
  }
  let refs = loaded.keys().copied().collect::<Vec<_>>();
  let snapshot = GrantSnapshot::new(store.grants_for(&principal.subjects(), &refs).await?);
  let permission = compute_effective_permission(principal, &resource_ref, &loaded, &snapshot)?;
  let steps = build_steps(principal, &resource, parent.as_ref(), &snapshot, &permission);

  Ok(ExplainReport {
    uid: principal.uid,
    is_admin: principal.is_admin,
    groups: principal.groups.iter().copied().collect(),
    resource: resource_ref,
    path: resource.path,
    owner_uid: resource.owner_uid,
    effective: permission.capabilities(),
    steps,
    permission,
    cached: cached.map(|p| p.capabilities()),
  })
}

fn build_steps(
  principal: &Principal,
  resource: &Resource,
  parent: Option<&Resource>,
  snapshot: &GrantSnapshot,
  permission: &EffectivePermission,
) -> Vec<ExplainStep> {
  let resource_ref = resource.resource_ref();
  let mut steps = vec![ExplainStep {
    rule: ExplainRule::AdminOverride,
    matched: principal.is_admin,
    capabilities: if principal.is_admin {
      CapabilitySet::all()
    } else {
      CapabilitySet::empty()
    },
    detail: if principal.is_admin {
      format!("uid {} is an administrator", principal.uid)
    } else {
      format!("uid {} is not an administrator", principal.uid)
    },
  }];
  if principal.is_admin {
    return steps;
  }

  steps.push(ExplainStep {
    rule: ExplainRule::Direct,
    matched: !permission.direct.is_empty(),
    capabilities: permission.direct,
    detail: format!("{} on {}", Subject::User(principal.uid), resource_ref),
  });

  let group_detail = snapshot
    .group_grants(&principal.groups, &resource_ref)
    .map(|(group_id, caps)| format!("{} grants {}", Subject::Group(group_id), caps))
    .collect::<Vec<_>>();
  steps.push(ExplainStep {
    rule: ExplainRule::ViaGroup,
    matched: !permission.via_group.is_empty(),
    capabilities: permission.via_group,
    detail: if group_detail.is_empty() {
      format!("no grant for the {} group(s) of the user", principal.groups.len())
    } else {
      group_detail.join("; ")
    },
  });

  steps.push(ExplainStep {
    rule: ExplainRule::InheritedFromParent,
    matched: !permission.inherited.is_empty(),
    capabilities: permission.inherited,
    detail: match (resource.is_folder(), parent) {
      (true, _) => "folders do not inherit".to_string(),
      (false, Some(folder)) => format!("from folder {} ({})", folder.path, folder.resource_ref()),
      (false, None) => "parent folder not found".to_string(),
    },
  });

  steps.push(ExplainStep {
    rule: ExplainRule::RootDefault,
    matched: permission.root_default,
    capabilities: if permission.root_default {
      Capability::Read.into()
    } else {
      CapabilitySet::empty()
    },
    detail: if resource.is_root() {
      "read on the root folder".to_string()
    } else {
      "only applies to the root folder".to_string()
    },
  });

  let effective = permission.capabilities();
  steps.push(ExplainStep {
    rule: ExplainRule::Deny,
    matched: effective.is_empty(),
    capabilities: CapabilitySet::empty(),
    detail: if effective.is_empty() {
      "no rule granted any capability".to_string()
    } else {
      format!("denied: {}", missing(effective))
    },
  });
  steps
}

fn missing(granted: CapabilitySet) -> CapabilitySet {
  Capability::ALL
    .into_iter()
    .filter(|cap| !granted.contains(*cap))
    .collect()
}
