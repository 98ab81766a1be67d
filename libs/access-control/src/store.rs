use app_error::AppError;
use async_trait::async_trait;

use crate::entity::{Grant, Principal, Resource, ResourceKind, ResourceRef, Subject};

/// Durable record of users, groups, the resource tree and the directly authored grants.
///
/// Every method is a single logical round trip to the backing store, so the number of calls
/// made while resolving a request is the number of round trips it costs.
#[async_trait]
pub trait GrantStore: Send + Sync + 'static {
  /// Returns None for a uid the store does not know.
  async fn principal(&self, uid: i64) -> Result<Option<Principal>, AppError>;

  /// Returns the root folder, creating it if it does not exist yet.
  async fn root_folder(&self) -> Result<Resource, AppError>;

  /// Resources whose path is one of `paths`. Paths must already be normalized; unknown
  /// paths are simply absent from the result.
  async fn resources_by_paths(&self, paths: &[String]) -> Result<Vec<Resource>, AppError>;

  async fn resources(&self, refs: &[ResourceRef]) -> Result<Vec<Resource>, AppError>;

  /// Direct child folders and files of any of the given folders, ordered by path.
  async fn children(&self, folder_ids: &[i64]) -> Result<Vec<Resource>, AppError>;

  async fn all_folders(&self) -> Result<Vec<Resource>, AppError>;

  /// Every grant held by any of `subjects` on any of `refs`.
  async fn grants_for(
    &self,
    subjects: &[Subject],
    refs: &[ResourceRef],
  ) -> Result<Vec<Grant>, AppError>;

  async fn group_members(&self, group_id: i64) -> Result<Vec<i64>, AppError>;

  /// Resources on which any of `subjects` holds a grant, at most `limit` of them.
  async fn grant_targets(
    &self,
    subjects: &[Subject],
    limit: usize,
  ) -> Result<Vec<ResourceRef>, AppError>;

  async fn upsert_grant(&self, grant: &Grant) -> Result<(), AppError>;

  /// Returns true if a grant was removed.
  async fn delete_grant(&self, subject: Subject, resource: ResourceRef) -> Result<bool, AppError>;

  async fn add_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError>;

  async fn remove_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError>;

  /// Creates a folder or a file under the folder `parent_id`.
  async fn create_resource(
    &self,
    kind: ResourceKind,
    path: &str,
    parent_id: i64,
    owner_uid: Option<i64>,
  ) -> Result<Resource, AppError>;

  async fn set_admin(&self, uid: i64, is_admin: bool) -> Result<bool, AppError>;
}

/// Every failure of the durable store other than a missing record is reported as
/// [AppError::StoreUnavailable].
pub(crate) fn into_store_error(err: AppError) -> AppError {
  match err {
    AppError::RecordNotFound(_) | AppError::StoreUnavailable(_) | AppError::InvalidResource(_) => {
      err
    },
    AppError::RecordAlreadyExists(_) | AppError::InvalidRequest(_) => err,
    other => AppError::StoreUnavailable(other.to_string()),
  }
}
