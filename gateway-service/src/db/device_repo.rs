//! Device authorization repository.
//!
//! Every update is scoped by primary key; concurrent token refreshes are
//! benign because both winners persist an equally valid pair.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{DeviceAuthorization, DeviceStatus};

const COLUMNS: &str = "device_code, user_code, client_id, created_by_id, status, expires_at, \
     osm_access_token, osm_refresh_token, osm_token_expiry, osm_user_id, section_id, \
     device_access_token, term_id, term_checked_at, term_end_date, created_at, last_used_at";

fn map_row(row: &PgRow) -> Result<DeviceAuthorization, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let status = DeviceStatus::parse(&status_raw).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown device status: {status_raw}").into())
    })?;
    Ok(DeviceAuthorization {
        device_code: row.try_get("device_code")?,
        user_code: row.try_get("user_code")?,
        client_id: row.try_get("client_id")?,
        created_by_id: row.try_get("created_by_id")?,
        status,
        expires_at: row.try_get("expires_at")?,
        osm_access_token: row.try_get("osm_access_token")?,
        osm_refresh_token: row.try_get("osm_refresh_token")?,
        osm_token_expiry: row.try_get("osm_token_expiry")?,
        osm_user_id: row.try_get("osm_user_id")?,
        section_id: row.try_get("section_id")?,
        device_access_token: row.try_get("device_access_token")?,
        term_id: row.try_get("term_id")?,
        term_checked_at: row.try_get("term_checked_at")?,
        term_end_date: row.try_get("term_end_date")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

/// Insert a fresh `pending` enrollment.
pub async fn insert(
    pool: &PgPool,
    device_code: &str,
    user_code: &str,
    client_id: &str,
    created_by_id: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO device_authorizations
            (device_code, user_code, client_id, created_by_id, status, expires_at)
        VALUES ($1, $2, $3, $4, 'pending', $5)
        "#,
    )
    .bind(device_code)
    .bind(user_code)
    .bind(client_id)
    .bind(created_by_id)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_by_device_code(
    pool: &PgPool,
    device_code: &str,
) -> Result<Option<DeviceAuthorization>, sqlx::Error> {
    let sql = format!("SELECT {COLUMNS} FROM device_authorizations WHERE device_code = $1");
    let row = sqlx::query(&sql)
        .bind(device_code)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn find_by_user_code(
    pool: &PgPool,
    user_code: &str,
) -> Result<Option<DeviceAuthorization>, sqlx::Error> {
    let sql = format!("SELECT {COLUMNS} FROM device_authorizations WHERE user_code = $1");
    let row = sqlx::query(&sql)
        .bind(user_code)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_row).transpose()
}

/// Resolve an API bearer token. Only `authorized` rows qualify.
pub async fn find_by_access_token(
    pool: &PgPool,
    device_access_token: &str,
) -> Result<Option<DeviceAuthorization>, sqlx::Error> {
    let sql = format!(
        "SELECT {COLUMNS} FROM device_authorizations
         WHERE device_access_token = $1 AND status = 'authorized'"
    );
    let row = sqlx::query(&sql)
        .bind(device_access_token)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_row).transpose()
}

/// Any authorized enrollment for this OSM user, most recently used first.
/// The outbox worker borrows its token material from here.
pub async fn find_authorized_by_osm_user(
    pool: &PgPool,
    osm_user_id: i64,
) -> Result<Option<DeviceAuthorization>, sqlx::Error> {
    let sql = format!(
        "SELECT {COLUMNS} FROM device_authorizations
         WHERE osm_user_id = $1 AND status = 'authorized'
         ORDER BY last_used_at DESC NULLS LAST LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(osm_user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_row).transpose()
}

/// Every enrollment belonging to an OSM user, newest first. Backs the
/// admin scoreboard listing.
pub async fn list_by_osm_user(
    pool: &PgPool,
    osm_user_id: i64,
) -> Result<Vec<DeviceAuthorization>, sqlx::Error> {
    let sql = format!(
        "SELECT {COLUMNS} FROM device_authorizations
         WHERE osm_user_id = $1
         ORDER BY created_at DESC"
    );
    let rows = sqlx::query(&sql).bind(osm_user_id).fetch_all(pool).await?;
    rows.iter().map(map_row).collect()
}

/// Persist the OSM token pair won at the authorization-code callback and
/// advance `pending -> awaiting_section`.
pub async fn store_osm_tokens(
    pool: &PgPool,
    device_code: &str,
    access_token: &str,
    refresh_token: &str,
    token_expiry: DateTime<Utc>,
    osm_user_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE device_authorizations
        SET osm_access_token = $2,
            osm_refresh_token = $3,
            osm_token_expiry = $4,
            osm_user_id = $5,
            status = 'awaiting_section'
        WHERE device_code = $1 AND status = 'pending'
        "#,
    )
    .bind(device_code)
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expiry)
    .bind(osm_user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Section chosen: mint the device token and advance to `authorized`.
pub async fn authorize(
    pool: &PgPool,
    device_code: &str,
    section_id: i64,
    device_access_token: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE device_authorizations
        SET section_id = $2,
            device_access_token = $3,
            status = 'authorized',
            last_used_at = NOW()
        WHERE device_code = $1 AND status = 'awaiting_section'
        "#,
    )
    .bind(device_code)
    .bind(section_id)
    .bind(device_access_token)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_denied(pool: &PgPool, device_code: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE device_authorizations SET status = 'denied'
         WHERE device_code = $1 AND status IN ('pending', 'awaiting_section')",
    )
    .bind(device_code)
    .execute(pool)
    .await?;
    Ok(())
}

/// Upstream refresh reported the grant revoked: clear all OSM material and
/// the minted device token so subsequent bearer lookups fail.
pub async fn revoke(pool: &PgPool, device_code: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE device_authorizations
        SET status = 'revoked',
            osm_access_token = NULL,
            osm_refresh_token = NULL,
            osm_token_expiry = NULL,
            device_access_token = NULL
        WHERE device_code = $1
        "#,
    )
    .bind(device_code)
    .execute(pool)
    .await?;
    Ok(())
}

/// Refresh success: persist the rotated pair.
pub async fn update_osm_tokens(
    pool: &PgPool,
    device_code: &str,
    access_token: &str,
    refresh_token: &str,
    token_expiry: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE device_authorizations
        SET osm_access_token = $2,
            osm_refresh_token = $3,
            osm_token_expiry = $4
        WHERE device_code = $1
        "#,
    )
    .bind(device_code)
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expiry)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn touch_last_used(pool: &PgPool, device_code: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE device_authorizations SET last_used_at = NOW() WHERE device_code = $1")
        .bind(device_code)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_term(
    pool: &PgPool,
    device_code: &str,
    term_id: &str,
    term_end_date: NaiveDate,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE device_authorizations
        SET term_id = $2, term_end_date = $3, term_checked_at = NOW()
        WHERE device_code = $1
        "#,
    )
    .bind(device_code)
    .bind(term_id)
    .bind(term_end_date)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reap device codes that expired before ever being authorized.
pub async fn delete_expired_preauth(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "DELETE FROM device_authorizations
         WHERE status NOT IN ('authorized', 'revoked') AND expires_at < NOW()",
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Reap authorized/revoked devices idle longer than the threshold.
pub async fn delete_idle(pool: &PgPool, idle_days: i64) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        r#"
        DELETE FROM device_authorizations
        WHERE status IN ('authorized', 'revoked')
          AND COALESCE(last_used_at, created_at) < NOW() - make_interval(days => $1::int)
        "#,
    )
    .bind(idle_days)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}
