use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The two physical tables a resource can live in. Folders and files have their own id
/// sequences, so every query is parameterized by the table it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTable {
  Folder,
  File,
}

impl ResourceTable {
  pub fn table(&self) -> &'static str {
    match self {
      ResourceTable::Folder => "nas_folder",
      ResourceTable::File => "nas_file",
    }
  }

  pub fn grant_table(&self) -> &'static str {
    match self {
      ResourceTable::Folder => "nas_folder_grant",
      ResourceTable::File => "nas_file_grant",
    }
  }

  /// Column of the grant table that references the resource.
  pub fn grant_resource_column(&self) -> &'static str {
    match self {
      ResourceTable::Folder => "folder_id",
      ResourceTable::File => "file_id",
    }
  }

  /// Column pointing at the parent folder. Files reference their folder through `folder_id`.
  pub fn parent_column(&self) -> &'static str {
    match self {
      ResourceTable::Folder => "parent_id",
      ResourceTable::File => "folder_id",
    }
  }

  pub(crate) fn select_columns(&self) -> String {
    format!(
      "id, name, path, {} AS parent_id, owner_uid",
      self.parent_column()
    )
  }
}

/// Represent a row of the nas_folder or nas_file table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NasResourceRow {
  pub id: i64,
  pub name: String,
  pub path: String,
  pub parent_id: Option<i64>,
  pub owner_uid: Option<i64>,
}

/// Represent a row of the nas_folder_grant or nas_file_grant table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NasGrantRow {
  pub resource_id: i64,
  pub uid: Option<i64>,
  pub group_id: Option<i64>,
  pub can_read: bool,
  pub can_write: bool,
  pub can_delete: bool,
  pub can_share: bool,
}

impl NasGrantRow {
  pub fn flags(&self) -> GrantFlags {
    GrantFlags {
      can_read: self.can_read,
      can_write: self.can_write,
      can_delete: self.can_delete,
      can_share: self.can_share,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantFlags {
  pub can_read: bool,
  pub can_write: bool,
  pub can_delete: bool,
  pub can_share: bool,
}

/// The holder of a grant row. Exactly one of `uid` / `group_id` is set in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantHolder {
  User(i64),
  Group(i64),
}

impl GrantHolder {
  pub fn column(&self) -> &'static str {
    match self {
      GrantHolder::User(_) => "uid",
      GrantHolder::Group(_) => "group_id",
    }
  }

  pub fn id(&self) -> i64 {
    match self {
      GrantHolder::User(uid) => *uid,
      GrantHolder::Group(group_id) => *group_id,
    }
  }
}

/// A user together with the groups it belongs to.
#[derive(Debug, Clone, FromRow)]
pub struct NasPrincipalRow {
  pub uid: i64,
  pub is_admin: bool,
  pub group_ids: Vec<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct NasGrantTargetRow {
  pub kind: String,
  pub resource_id: i64,
}

impl NasGrantTargetRow {
  pub fn table(&self) -> Option<ResourceTable> {
    match self.kind.as_str() {
      "folder" => Some(ResourceTable::Folder),
      "file" => Some(ResourceTable::File),
      _ => None,
    }
  }
}
