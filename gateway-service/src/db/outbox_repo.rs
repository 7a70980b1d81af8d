//! Score outbox repository.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` inside a transaction so parallel
//! workers never block on, or double-claim, the same rows.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::models::{OutboxEntry, OutboxStatus};

const COLUMNS: &str = "id, osm_user_id, section_id, patrol_id, points_delta, idempotency_key, \
     status, attempt_count, last_error, next_retry_at, processed_at, created_at";

fn map_row(row: &PgRow) -> Result<OutboxEntry, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let status = OutboxStatus::parse(&status_raw).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown outbox status: {status_raw}").into())
    })?;
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        osm_user_id: row.try_get("osm_user_id")?,
        section_id: row.try_get("section_id")?,
        patrol_id: row.try_get("patrol_id")?,
        points_delta: row.try_get("points_delta")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
        next_retry_at: row.try_get("next_retry_at")?,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert(
    pool: &PgPool,
    osm_user_id: i64,
    section_id: i64,
    patrol_id: &str,
    points_delta: i64,
    idempotency_key: &str,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO score_outbox
            (osm_user_id, section_id, patrol_id, points_delta, idempotency_key, status)
        VALUES ($1, $2, $3, $4, $5, 'pending')
        RETURNING id
        "#,
    )
    .bind(osm_user_id)
    .bind(section_id)
    .bind(patrol_id)
    .bind(points_delta)
    .bind(idempotency_key)
    .fetch_one(pool)
    .await?;
    row.try_get("id")
}

/// Duplicate detection by idempotency key: an exact match, or any stored
/// composite key sharing the submitted key as its base prefix.
pub async fn key_already_seen(
    pool: &PgPool,
    osm_user_id: i64,
    idempotency_key: &str,
) -> Result<bool, sqlx::Error> {
    let prefix = format!("{idempotency_key}:%");
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM score_outbox
            WHERE osm_user_id = $1
              AND (idempotency_key = $2 OR idempotency_key LIKE $3)
        )
        "#,
    )
    .bind(osm_user_id)
    .bind(idempotency_key)
    .bind(prefix)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Distinct `(user, section, patrol)` tuples with at least one claimable
/// row: `pending`, or `failed` whose backoff has elapsed.
pub async fn select_due_tuples(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<(i64, i64, String)>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT osm_user_id, section_id, patrol_id
        FROM score_outbox
        WHERE status = 'pending'
           OR (status = 'failed' AND next_retry_at <= NOW())
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok((
                row.try_get("osm_user_id")?,
                row.try_get("section_id")?,
                row.try_get("patrol_id")?,
            ))
        })
        .collect()
}

/// Claim every due row for one tuple: lock with SKIP LOCKED, flip to
/// `processing`, bump the attempt counter, and return the updated rows.
pub async fn claim_tuple(
    tx: &mut Transaction<'_, Postgres>,
    osm_user_id: i64,
    section_id: i64,
    patrol_id: &str,
) -> Result<Vec<OutboxEntry>, sqlx::Error> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM score_outbox
        WHERE osm_user_id = $1 AND section_id = $2 AND patrol_id = $3
          AND (status = 'pending' OR (status = 'failed' AND next_retry_at <= NOW()))
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(osm_user_id)
    .bind(section_id)
    .bind(patrol_id)
    .fetch_all(&mut **tx)
    .await?;

    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "UPDATE score_outbox
         SET status = 'processing', attempt_count = attempt_count + 1
         WHERE id = ANY($1)
         RETURNING {COLUMNS}"
    );
    let rows = sqlx::query(&sql).bind(&ids).fetch_all(&mut **tx).await?;
    rows.iter().map(map_row).collect()
}

pub async fn mark_completed(pool: &PgPool, ids: &[i64]) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE score_outbox
         SET status = 'completed', processed_at = NOW(), last_error = NULL
         WHERE id = ANY($1)",
    )
    .bind(ids)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(
    pool: &PgPool,
    ids: &[i64],
    error: &str,
    next_retry_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE score_outbox
         SET status = 'failed', last_error = $2, next_retry_at = $3
         WHERE id = ANY($1)",
    )
    .bind(ids)
    .bind(error)
    .bind(next_retry_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Freeze every live row for a user whose grant was revoked.
pub async fn quarantine_user(pool: &PgPool, osm_user_id: i64) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE score_outbox
         SET status = 'auth_revoked'
         WHERE osm_user_id = $1 AND status IN ('pending', 'processing', 'failed')",
    )
    .bind(osm_user_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Thaw quarantined rows after the user re-enrolls.
pub async fn recover_auth_revoked(pool: &PgPool, osm_user_id: i64) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE score_outbox
         SET status = 'pending', next_retry_at = NULL
         WHERE osm_user_id = $1 AND status = 'auth_revoked'",
    )
    .bind(osm_user_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Un-applied delta per patrol, for optimistic display.
pub async fn pending_deltas_by_section(
    pool: &PgPool,
    osm_user_id: i64,
    section_id: i64,
) -> Result<Vec<(String, i64)>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT patrol_id, SUM(points_delta)::BIGINT AS delta
        FROM score_outbox
        WHERE osm_user_id = $1 AND section_id = $2
          AND status IN ('pending', 'processing')
        GROUP BY patrol_id
        "#,
    )
    .bind(osm_user_id)
    .bind(section_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| Ok((row.try_get("patrol_id")?, row.try_get("delta")?)))
        .collect()
}

pub async fn pending_depth(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*)::BIGINT FROM score_outbox WHERE status IN ('pending', 'processing')",
    )
    .fetch_one(pool)
    .await
}

/// Retention: completed rows are kept 24 h, failed/quarantined 7 days.
pub async fn purge_retention(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let completed = sqlx::query(
        "DELETE FROM score_outbox
         WHERE status = 'completed' AND processed_at < NOW() - INTERVAL '24 hours'",
    )
    .execute(pool)
    .await?;
    let dead = sqlx::query(
        "DELETE FROM score_outbox
         WHERE status IN ('failed', 'auth_revoked')
           AND created_at < NOW() - INTERVAL '7 days'",
    )
    .execute(pool)
    .await?;
    Ok(completed.rows_affected() + dead.rows_affected())
}
