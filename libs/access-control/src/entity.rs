use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use database::pg_row::{GrantHolder, ResourceTable};
use serde::{Deserialize, Serialize};

use crate::act::CapabilitySet;

pub const ROOT_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
  Folder,
  File,
}

impl ResourceKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceKind::Folder => "folder",
      ResourceKind::File => "file",
    }
  }
}

impl From<ResourceTable> for ResourceKind {
  fn from(value: ResourceTable) -> Self {
    match value {
      ResourceTable::Folder => ResourceKind::Folder,
      ResourceTable::File => ResourceKind::File,
    }
  }
}

impl From<ResourceKind> for ResourceTable {
  fn from(value: ResourceKind) -> Self {
    match value {
      ResourceKind::Folder => ResourceTable::Folder,
      ResourceKind::File => ResourceTable::File,
    }
  }
}

/// Addresses a resource. Folder and file ids come from different sequences, so the kind is
/// part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
  pub kind: ResourceKind,
  pub id: i64,
}

impl ResourceRef {
  pub fn folder(id: i64) -> Self {
    Self {
      kind: ResourceKind::Folder,
      id,
    }
  }

  pub fn file(id: i64) -> Self {
    Self {
      kind: ResourceKind::File,
      id,
    }
  }
}

/// `folder::<id>` or `file::<id>`
impl Display for ResourceRef {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}::{}", self.kind.as_str(), self.id)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
  pub id: i64,
  pub kind: ResourceKind,
  pub name: String,
  pub path: String,
  pub owner_uid: Option<i64>,
  /// The containing folder. Only the root folder has none.
  pub parent: Option<ResourceRef>,
}

impl Resource {
  pub fn resource_ref(&self) -> ResourceRef {
    ResourceRef {
      kind: self.kind,
      id: self.id,
    }
  }

  pub fn is_folder(&self) -> bool {
    self.kind == ResourceKind::Folder
  }

  pub fn is_root(&self) -> bool {
    self.is_folder() && self.parent.is_none() && self.path == ROOT_PATH
  }
}

/// The holder of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subject {
  User(i64),
  Group(i64),
}

/// `user::<uid>` or `group::<group_id>`
impl Display for Subject {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Subject::User(uid) => write!(f, "user::{}", uid),
      Subject::Group(group_id) => write!(f, "group::{}", group_id),
    }
  }
}

impl From<Subject> for GrantHolder {
  fn from(value: Subject) -> Self {
    match value {
      Subject::User(uid) => GrantHolder::User(uid),
      Subject::Group(group_id) => GrantHolder::Group(group_id),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
  pub subject: Subject,
  pub resource: ResourceRef,
  pub capabilities: CapabilitySet,
}

impl Grant {
  pub fn new(subject: Subject, resource: ResourceRef, capabilities: CapabilitySet) -> Self {
    Self {
      subject,
      resource,
      capabilities,
    }
  }
}

/// The user an authorization decision is made for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
  pub uid: i64,
  pub is_admin: bool,
  pub groups: BTreeSet<i64>,
}

impl Principal {
  /// A non-admin user without any group.
  pub fn user(uid: i64) -> Self {
    Self {
      uid,
      is_admin: false,
      groups: BTreeSet::new(),
    }
  }

  /// The user itself followed by each of its groups.
  pub fn subjects(&self) -> Vec<Subject> {
    let mut subjects = Vec::with_capacity(self.groups.len() + 1);
    subjects.push(Subject::User(self.uid));
    subjects.extend(self.groups.iter().map(|group_id| Subject::Group(*group_id)));
    subjects
  }
}

/// Normalizes a slash delimited path: leading slash enforced, empty segments dropped, no
/// trailing slash. The empty string is the root.
pub fn normalize_path(path: &str) -> String {
  let segments = path
    .split('/')
    .map(str::trim)
    .filter(|segment| !segment.is_empty())
    .collect::<Vec<_>>();
  if segments.is_empty() {
    return ROOT_PATH.to_string();
  }
  format!("/{}", segments.join("/"))
}

/// Last segment of a normalized path. Empty for the root.
pub fn path_name(path: &str) -> &str {
  path.rsplit('/').next().unwrap_or_default()
}
