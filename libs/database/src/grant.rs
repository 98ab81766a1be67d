use app_error::AppError;
use sqlx::PgPool;
use tracing::trace;

use crate::pg_row::{GrantFlags, GrantHolder, NasGrantRow, NasGrantTargetRow, ResourceTable};

/// Loads every grant on any of `resource_ids` held by any of `uids` or any of `group_ids`,
/// in a single round trip.
pub async fn select_grants(
  pg_pool: &PgPool,
  table: ResourceTable,
  resource_ids: &[i64],
  uids: &[i64],
  group_ids: &[i64],
) -> Result<Vec<NasGrantRow>, AppError> {
  if resource_ids.is_empty() || (uids.is_empty() && group_ids.is_empty()) {
    return Ok(vec![]);
  }
  let column = table.grant_resource_column();
  let sql = format!(
    r#"
      SELECT {column} AS resource_id, uid, group_id, can_read, can_write, can_delete, can_share
      FROM {}
      WHERE {column} = ANY($1)
        AND (uid = ANY($2) OR group_id = ANY($3))
    "#,
    table.grant_table(),
  );
  let rows = sqlx::query_as::<_, NasGrantRow>(&sql)
    .bind(resource_ids)
    .bind(uids)
    .bind(group_ids)
    .fetch_all(pg_pool)
    .await?;
  trace!(
    "[Grant]: loaded {} rows for {} {:?} resources",
    rows.len(),
    resource_ids.len(),
    table
  );
  Ok(rows)
}

/// Inserts the grant or replaces the capability flags of the existing one.
pub async fn upsert_grant(
  pg_pool: &PgPool,
  table: ResourceTable,
  resource_id: i64,
  holder: GrantHolder,
  flags: GrantFlags,
) -> Result<(), AppError> {
  let column = table.grant_resource_column();
  let holder_column = holder.column();
  let sql = format!(
    r#"
      INSERT INTO {} ({column}, {holder_column}, can_read, can_write, can_delete, can_share)
      VALUES ($1, $2, $3, $4, $5, $6)
      ON CONFLICT ({column}, {holder_column}) WHERE {holder_column} IS NOT NULL
      DO UPDATE SET
        can_read = EXCLUDED.can_read,
        can_write = EXCLUDED.can_write,
        can_delete = EXCLUDED.can_delete,
        can_share = EXCLUDED.can_share,
        updated_at = NOW()
    "#,
    table.grant_table(),
  );
  sqlx::query(&sql)
    .bind(resource_id)
    .bind(holder.id())
    .bind(flags.can_read)
    .bind(flags.can_write)
    .bind(flags.can_delete)
    .bind(flags.can_share)
    .execute(pg_pool)
    .await?;
  Ok(())
}

/// Returns true if a grant row was removed.
pub async fn delete_grant(
  pg_pool: &PgPool,
  table: ResourceTable,
  resource_id: i64,
  holder: GrantHolder,
) -> Result<bool, AppError> {
  let sql = format!(
    "DELETE FROM {} WHERE {} = $1 AND {} = $2",
    table.grant_table(),
    table.grant_resource_column(),
    holder.column(),
  );
  let affected = sqlx::query(&sql)
    .bind(resource_id)
    .bind(holder.id())
    .execute(pg_pool)
    .await?
    .rows_affected();
  Ok(affected > 0)
}

/// Resources carrying at least one grant for any of the holders. Used to warm the cache.
pub async fn select_grant_targets(
  pg_pool: &PgPool,
  uids: &[i64],
  group_ids: &[i64],
  limit: i64,
) -> Result<Vec<NasGrantTargetRow>, AppError> {
  let rows = sqlx::query_as::<_, NasGrantTargetRow>(
    r#"
      SELECT kind, resource_id FROM (
        SELECT 'folder' AS kind, folder_id AS resource_id
        FROM nas_folder_grant
        WHERE uid = ANY($1) OR group_id = ANY($2)
        UNION
        SELECT 'file' AS kind, file_id AS resource_id
        FROM nas_file_grant
        WHERE uid = ANY($1) OR group_id = ANY($2)
      ) AS targets
      ORDER BY kind DESC, resource_id
      LIMIT $3
    "#,
  )
  .bind(uids)
  .bind(group_ids)
  .bind(limit)
  .fetch_all(pg_pool)
  .await?;
  Ok(rows)
}
