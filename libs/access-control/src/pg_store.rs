use std::collections::HashSet;

use app_error::AppError;
use async_trait::async_trait;
use database::grant::{delete_grant, select_grant_targets, select_grants, upsert_grant};
use database::pg_row::{NasGrantRow, NasResourceRow, ResourceTable};
use database::principal::{
  delete_group_member, insert_group_member, select_group_member_uids, select_principal,
  update_user_admin,
};
use database::resource::{
  insert_resource, insert_root_folder, select_all_folders, select_children,
  select_resources_by_ids, select_resources_by_paths, select_root_folder,
};
use sqlx::PgPool;
use tracing::{info, trace};

use crate::act::CapabilitySet;
use crate::entity::{
  normalize_path, path_name, Grant, Principal, Resource, ResourceKind, ResourceRef, Subject,
};
use crate::store::{into_store_error, GrantStore};

/// [GrantStore] backed by the `nas_*` tables. Queries that span folders and files run against
/// both tables concurrently and count as one round trip.
#[derive(Clone)]
pub struct PgGrantStore {
  pg_pool: PgPool,
}

impl PgGrantStore {
  pub fn new(pg_pool: PgPool) -> Self {
    Self { pg_pool }
  }
}

fn to_resource(table: ResourceTable, row: NasResourceRow) -> Resource {
  Resource {
    id: row.id,
    kind: table.into(),
    name: row.name,
    path: row.path,
    owner_uid: row.owner_uid,
    parent: row.parent_id.map(ResourceRef::folder),
  }
}

fn to_resources(table: ResourceTable, rows: Vec<NasResourceRow>) -> Vec<Resource> {
  rows.into_iter().map(|row| to_resource(table, row)).collect()
}

fn to_grant(table: ResourceTable, row: NasGrantRow) -> Option<Grant> {
  let subject = match (row.uid, row.group_id) {
    (Some(uid), None) => Subject::User(uid),
    (None, Some(group_id)) => Subject::Group(group_id),
    _ => return None,
  };
  let resource = ResourceRef {
    kind: table.into(),
    id: row.resource_id,
  };
  Some(Grant::new(subject, resource, CapabilitySet::from(row.flags())))
}

fn split_subjects(subjects: &[Subject]) -> (Vec<i64>, Vec<i64>) {
  let mut uids = vec![];
  let mut group_ids = vec![];
  for subject in subjects {
    match subject {
      Subject::User(uid) => uids.push(*uid),
      Subject::Group(group_id) => group_ids.push(*group_id),
    }
  }
  (uids, group_ids)
}

fn split_refs(refs: &[ResourceRef]) -> (Vec<i64>, Vec<i64>) {
  let mut folders = HashSet::new();
  let mut files = HashSet::new();
  for resource in refs {
    match resource.kind {
      ResourceKind::Folder => folders.insert(resource.id),
      ResourceKind::File => files.insert(resource.id),
    };
  }
  (folders.into_iter().collect(), files.into_iter().collect())
}

#[async_trait]
impl GrantStore for PgGrantStore {
  async fn principal(&self, uid: i64) -> Result<Option<Principal>, AppError> {
    let row = select_principal(&self.pg_pool, uid)
      .await
      .map_err(into_store_error)?;
    Ok(row.map(|row| Principal {
      uid: row.uid,
      is_admin: row.is_admin,
      groups: row.group_ids.into_iter().collect(),
    }))
  }

  async fn root_folder(&self) -> Result<Resource, AppError> {
    let row = match select_root_folder(&self.pg_pool)
      .await
      .map_err(into_store_error)?
    {
      Some(row) => row,
      None => {
        info!("[permission]: creating the root folder");
        insert_root_folder(&self.pg_pool)
          .await
          .map_err(into_store_error)?
      },
    };
    Ok(to_resource(ResourceTable::Folder, row))
  }

  async fn resources_by_paths(&self, paths: &[String]) -> Result<Vec<Resource>, AppError> {
    let (folders, files) = tokio::try_join!(
      select_resources_by_paths(&self.pg_pool, ResourceTable::Folder, paths),
      select_resources_by_paths(&self.pg_pool, ResourceTable::File, paths),
    )
    .map_err(into_store_error)?;
    let mut resources = to_resources(ResourceTable::Folder, folders);
    resources.extend(to_resources(ResourceTable::File, files));
    Ok(resources)
  }

  async fn resources(&self, refs: &[ResourceRef]) -> Result<Vec<Resource>, AppError> {
    let (folder_ids, file_ids) = split_refs(refs);
    let (folders, files) = tokio::try_join!(
      select_resources_by_ids(&self.pg_pool, ResourceTable::Folder, &folder_ids),
      select_resources_by_ids(&self.pg_pool, ResourceTable::File, &file_ids),
    )
    .map_err(into_store_error)?;
    let mut resources = to_resources(ResourceTable::Folder, folders);
    resources.extend(to_resources(ResourceTable::File, files));
    Ok(resources)
  }

  async fn children(&self, folder_ids: &[i64]) -> Result<Vec<Resource>, AppError> {
    let (folders, files) = tokio::try_join!(
      select_children(&self.pg_pool, ResourceTable::Folder, folder_ids),
      select_children(&self.pg_pool, ResourceTable::File, folder_ids),
    )
    .map_err(into_store_error)?;
    let mut children = to_resources(ResourceTable::Folder, folders);
    children.extend(to_resources(ResourceTable::File, files));
    children.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(children)
  }

  async fn all_folders(&self) -> Result<Vec<Resource>, AppError> {
    let rows = select_all_folders(&self.pg_pool)
      .await
      .map_err(into_store_error)?;
    Ok(to_resources(ResourceTable::Folder, rows))
  }

  async fn grants_for(
    &self,
    subjects: &[Subject],
    refs: &[ResourceRef],
  ) -> Result<Vec<Grant>, AppError> {
    let (uids, group_ids) = split_subjects(subjects);
    let (folder_ids, file_ids) = split_refs(refs);
    let (folder_rows, file_rows) = tokio::try_join!(
      select_grants(
        &self.pg_pool,
        ResourceTable::Folder,
        &folder_ids,
        &uids,
        &group_ids
      ),
      select_grants(
        &self.pg_pool,
        ResourceTable::File,
        &file_ids,
        &uids,
        &group_ids
      ),
    )
    .map_err(into_store_error)?;
    let grants = folder_rows
      .into_iter()
      .filter_map(|row| to_grant(ResourceTable::Folder, row))
      .chain(
        file_rows
          .into_iter()
          .filter_map(|row| to_grant(ResourceTable::File, row)),
      )
      .collect::<Vec<_>>();
    trace!(
      "[permission]: {} grants for {} subjects on {} resources",
      grants.len(),
      subjects.len(),
      refs.len()
    );
    Ok(grants)
  }

  async fn group_members(&self, group_id: i64) -> Result<Vec<i64>, AppError> {
    select_group_member_uids(&self.pg_pool, group_id)
      .await
      .map_err(into_store_error)
  }

  async fn grant_targets(
    &self,
    subjects: &[Subject],
    limit: usize,
  ) -> Result<Vec<ResourceRef>, AppError> {
    let (uids, group_ids) = split_subjects(subjects);
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = select_grant_targets(&self.pg_pool, &uids, &group_ids, limit)
      .await
      .map_err(into_store_error)?;
    Ok(
      rows
        .into_iter()
        .filter_map(|row| {
          row.table().map(|table| ResourceRef {
            kind: table.into(),
            id: row.resource_id,
          })
        })
        .collect(),
    )
  }

  async fn upsert_grant(&self, grant: &Grant) -> Result<(), AppError> {
    upsert_grant(
      &self.pg_pool,
      grant.resource.kind.into(),
      grant.resource.id,
      grant.subject.into(),
      grant.capabilities.into(),
    )
    .await
    .map_err(|err| grant_write_error(err, &grant.resource))
  }

  async fn delete_grant(&self, subject: Subject, resource: ResourceRef) -> Result<bool, AppError> {
    delete_grant(&self.pg_pool, resource.kind.into(), resource.id, subject.into())
      .await
      .map_err(into_store_error)
  }

  async fn add_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError> {
    insert_group_member(&self.pg_pool, group_id, uid)
      .await
      .map_err(into_store_error)
  }

  async fn remove_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError> {
    delete_group_member(&self.pg_pool, group_id, uid)
      .await
      .map_err(into_store_error)
  }

  async fn create_resource(
    &self,
    kind: ResourceKind,
    path: &str,
    parent_id: i64,
    owner_uid: Option<i64>,
  ) -> Result<Resource, AppError> {
    let path = normalize_path(path);
    let table = ResourceTable::from(kind);
    let row = insert_resource(
      &self.pg_pool,
      table,
      path_name(&path),
      &path,
      Some(parent_id),
      owner_uid,
    )
    .await
    .map_err(|err| resource_insert_error(err, &path, parent_id))?;
    Ok(to_resource(table, row))
  }

  async fn set_admin(&self, uid: i64, is_admin: bool) -> Result<bool, AppError> {
    update_user_admin(&self.pg_pool, uid, is_admin)
      .await
      .map_err(into_store_error)
  }
}

/// A grant can only violate the foreign key of its resource.
fn grant_write_error(err: AppError, resource: &ResourceRef) -> AppError {
  match err {
    AppError::InvalidResource(_) => AppError::InvalidResource(resource.to_string()),
    other => into_store_error(other),
  }
}

fn resource_insert_error(err: AppError, path: &str, parent_id: i64) -> AppError {
  match err {
    AppError::RecordAlreadyExists(_) => AppError::RecordAlreadyExists(path.to_string()),
    AppError::InvalidResource(_) => {
      AppError::InvalidResource(ResourceRef::folder(parent_id).to_string())
    },
    other => into_store_error(other),
  }
}
