use app_error::AppError;
use sqlx::PgPool;

use crate::pg_row::{NasResourceRow, ResourceTable};

pub const ROOT_FOLDER_PATH: &str = "/";

#[inline]
pub async fn select_root_folder(pg_pool: &PgPool) -> Result<Option<NasResourceRow>, AppError> {
  let row = sqlx::query_as::<_, NasResourceRow>(
    r#"
      SELECT id, name, path, parent_id, owner_uid
      FROM nas_folder
      WHERE path = $1
    "#,
  )
  .bind(ROOT_FOLDER_PATH)
  .fetch_optional(pg_pool)
  .await?;
  Ok(row)
}

/// Creates the root folder if it does not exist yet and returns it. Safe to race with other
/// instances doing the same.
pub async fn insert_root_folder(pg_pool: &PgPool) -> Result<NasResourceRow, AppError> {
  let row = sqlx::query_as::<_, NasResourceRow>(
    r#"
      INSERT INTO nas_folder (name, path, parent_id)
      VALUES ('', $1, NULL)
      ON CONFLICT (path) DO UPDATE SET path = EXCLUDED.path
      RETURNING id, name, path, parent_id, owner_uid
    "#,
  )
  .bind(ROOT_FOLDER_PATH)
  .fetch_one(pg_pool)
  .await?;
  Ok(row)
}

pub async fn select_resources_by_paths(
  pg_pool: &PgPool,
  table: ResourceTable,
  paths: &[String],
) -> Result<Vec<NasResourceRow>, AppError> {
  if paths.is_empty() {
    return Ok(vec![]);
  }
  let sql = format!(
    "SELECT {} FROM {} WHERE path = ANY($1)",
    table.select_columns(),
    table.table()
  );
  let rows = sqlx::query_as::<_, NasResourceRow>(&sql)
    .bind(paths)
    .fetch_all(pg_pool)
    .await?;
  Ok(rows)
}

pub async fn select_resources_by_ids(
  pg_pool: &PgPool,
  table: ResourceTable,
  ids: &[i64],
) -> Result<Vec<NasResourceRow>, AppError> {
  if ids.is_empty() {
    return Ok(vec![]);
  }
  let sql = format!(
    "SELECT {} FROM {} WHERE id = ANY($1)",
    table.select_columns(),
    table.table()
  );
  let rows = sqlx::query_as::<_, NasResourceRow>(&sql)
    .bind(ids)
    .fetch_all(pg_pool)
    .await?;
  Ok(rows)
}

/// Direct children stored in `table` of any of the given folders, ordered by path.
pub async fn select_children(
  pg_pool: &PgPool,
  table: ResourceTable,
  parent_ids: &[i64],
) -> Result<Vec<NasResourceRow>, AppError> {
  if parent_ids.is_empty() {
    return Ok(vec![]);
  }
  let sql = format!(
    "SELECT {} FROM {} WHERE {} = ANY($1) ORDER BY path",
    table.select_columns(),
    table.table(),
    table.parent_column(),
  );
  let rows = sqlx::query_as::<_, NasResourceRow>(&sql)
    .bind(parent_ids)
    .fetch_all(pg_pool)
    .await?;
  Ok(rows)
}

pub async fn select_all_folders(pg_pool: &PgPool) -> Result<Vec<NasResourceRow>, AppError> {
  let rows = sqlx::query_as::<_, NasResourceRow>(
    r#"
      SELECT id, name, path, parent_id, owner_uid
      FROM nas_folder
      ORDER BY path
    "#,
  )
  .fetch_all(pg_pool)
  .await?;
  Ok(rows)
}

pub async fn insert_resource(
  pg_pool: &PgPool,
  table: ResourceTable,
  name: &str,
  path: &str,
  parent_id: Option<i64>,
  owner_uid: Option<i64>,
) -> Result<NasResourceRow, AppError> {
  let sql = format!(
    "INSERT INTO {} (name, path, {}, owner_uid) VALUES ($1, $2, $3, $4) RETURNING {}",
    table.table(),
    table.parent_column(),
    table.select_columns(),
  );
  let row = sqlx::query_as::<_, NasResourceRow>(&sql)
    .bind(name)
    .bind(path)
    .bind(parent_id)
    .bind(owner_uid)
    .fetch_one(pg_pool)
    .await?;
  Ok(row)
}
