use app_error::AppError;
use sqlx::PgPool;

use crate::pg_row::NasPrincipalRow;

/// Returns the user with the ids of every group it belongs to, or None for an unknown uid.
#[inline]
pub async fn select_principal(
  pg_pool: &PgPool,
  uid: i64,
) -> Result<Option<NasPrincipalRow>, AppError> {
  let row = sqlx::query_as::<_, NasPrincipalRow>(
    r#"
      SELECT
        u.uid,
        u.is_admin,
        COALESCE(
          array_agg(ug.group_id) FILTER (WHERE ug.group_id IS NOT NULL),
          '{}'
        )::BIGINT[] AS group_ids
      FROM nas_user u
      LEFT JOIN nas_user_group ug ON ug.uid = u.uid
      WHERE u.uid = $1
      GROUP BY u.uid, u.is_admin
    "#,
  )
  .bind(uid)
  .fetch_optional(pg_pool)
  .await?;
  Ok(row)
}

#[inline]
pub async fn select_group_member_uids(
  pg_pool: &PgPool,
  group_id: i64,
) -> Result<Vec<i64>, AppError> {
  let uids = sqlx::query_scalar::<_, i64>(
    r#"
      SELECT uid FROM nas_user_group WHERE group_id = $1
    "#,
  )
  .bind(group_id)
  .fetch_all(pg_pool)
  .await?;
  Ok(uids)
}

pub async fn insert_group_member(
  pg_pool: &PgPool,
  group_id: i64,
  uid: i64,
) -> Result<bool, AppError> {
  let affected = sqlx::query(
    r#"
      INSERT INTO nas_user_group (uid, group_id)
      VALUES ($1, $2)
      ON CONFLICT DO NOTHING
    "#,
  )
  .bind(uid)
  .bind(group_id)
  .execute(pg_pool)
  .await?
  .rows_affected();
  Ok(affected > 0)
}

pub async fn delete_group_member(
  pg_pool: &PgPool,
  group_id: i64,
  uid: i64,
) -> Result<bool, AppError> {
  let affected = sqlx::query("DELETE FROM nas_user_group WHERE uid = $1 AND group_id = $2")
    .bind(uid)
    .bind(group_id)
    .execute(pg_pool)
    .await?
    .rows_affected();
  Ok(affected > 0)
}

pub async fn update_user_admin(
  pg_pool: &PgPool,
  uid: i64,
  is_admin: bool,
) -> Result<bool, AppError> {
  let affected = sqlx::query("UPDATE nas_user SET is_admin = $1 WHERE uid = $2")
    .bind(is_admin)
    .bind(uid)
    .execute(pg_pool)
    .await?
    .rows_affected();
  Ok(affected > 0)
}
