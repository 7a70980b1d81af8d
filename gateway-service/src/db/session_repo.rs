//! Web-session (device bridge) and admin-session repositories.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::{AdminSession, WebSession};

fn map_web_session(row: &PgRow) -> Result<WebSession, sqlx::Error> {
    Ok(WebSession {
        session_id: row.try_get("session_id")?,
        device_code: row.try_get("device_code")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn map_admin_session(row: &PgRow) -> Result<AdminSession, sqlx::Error> {
    Ok(AdminSession {
        session_id: row.try_get("session_id")?,
        csrf_token: row.try_get("csrf_token")?,
        osm_user_id: row.try_get("osm_user_id")?,
        osm_access_token: row.try_get("osm_access_token")?,
        osm_refresh_token: row.try_get("osm_refresh_token")?,
        osm_token_expiry: row.try_get("osm_token_expiry")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

pub async fn create_web_session(
    pool: &PgPool,
    session_id: &str,
    device_code: Option<&str>,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO web_sessions (session_id, device_code, expires_at) VALUES ($1, $2, $3)",
    )
    .bind(session_id)
    .bind(device_code)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_web_session(
    pool: &PgPool,
    session_id: &str,
) -> Result<Option<WebSession>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT session_id, device_code, created_at, expires_at
         FROM web_sessions WHERE session_id = $1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_web_session).transpose()
}

/// Consume the session: a `state` value is good for exactly one callback.
pub async fn delete_web_session(pool: &PgPool, session_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM web_sessions WHERE session_id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_expired_web_sessions(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("DELETE FROM web_sessions WHERE expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn create_admin_session(
    pool: &PgPool,
    session: &AdminSession,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO admin_sessions
            (session_id, csrf_token, osm_user_id, osm_access_token, osm_refresh_token,
             osm_token_expiry, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&session.session_id)
    .bind(&session.csrf_token)
    .bind(session.osm_user_id)
    .bind(&session.osm_access_token)
    .bind(&session.osm_refresh_token)
    .bind(session.osm_token_expiry)
    .bind(session.created_at)
    .bind(session.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_admin_session(
    pool: &PgPool,
    session_id: &str,
) -> Result<Option<AdminSession>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT session_id, csrf_token, osm_user_id, osm_access_token, osm_refresh_token,
                osm_token_expiry, created_at, expires_at
         FROM admin_sessions WHERE session_id = $1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_admin_session).transpose()
}

pub async fn update_admin_tokens(
    pool: &PgPool,
    session_id: &str,
    access_token: &str,
    refresh_token: &str,
    token_expiry: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE admin_sessions
        SET osm_access_token = $2, osm_refresh_token = $3, osm_token_expiry = $4
        WHERE session_id = $1
        "#,
    )
    .bind(session_id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expiry)
    .execute(pool)
    .await?;
    Ok(())
}

/// Sliding expiry: every authenticated admin request pushes the window out.
pub async fn extend_admin_session(
    pool: &PgPool,
    session_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE admin_sessions SET expires_at = $2 WHERE session_id = $1")
        .bind(session_id)
        .bind(expires_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_admin_session(pool: &PgPool, session_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM admin_sessions WHERE session_id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_expired_admin_sessions(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("DELETE FROM admin_sessions WHERE expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
