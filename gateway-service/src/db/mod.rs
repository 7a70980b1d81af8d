use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub mod adhoc_repo;
pub mod client_repo;
pub mod device_repo;
pub mod outbox_repo;
pub mod session_repo;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Idempotent schema bootstrap, run once at startup.
///
/// Safe to call from several instances at once: every statement is
/// `IF NOT EXISTS`.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Ensuring database schema");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS allowed_clients (
            id UUID PRIMARY KEY,
            client_id TEXT NOT NULL UNIQUE,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_authorizations (
            device_code TEXT PRIMARY KEY,
            user_code TEXT UNIQUE,
            client_id TEXT NOT NULL,
            created_by_id UUID REFERENCES allowed_clients(id),
            status TEXT NOT NULL DEFAULT 'pending',
            expires_at TIMESTAMPTZ NOT NULL,
            osm_access_token TEXT,
            osm_refresh_token TEXT,
            osm_token_expiry TIMESTAMPTZ,
            osm_user_id BIGINT,
            section_id BIGINT,
            device_access_token TEXT UNIQUE,
            term_id TEXT,
            term_checked_at TIMESTAMPTZ,
            term_end_date DATE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_used_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_device_auth_status_expires
         ON device_authorizations (status, expires_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_device_auth_osm_user
         ON device_authorizations (osm_user_id) WHERE osm_user_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS web_sessions (
            session_id TEXT PRIMARY KEY,
            device_code TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS admin_sessions (
            session_id TEXT PRIMARY KEY,
            csrf_token TEXT NOT NULL,
            osm_user_id BIGINT NOT NULL,
            osm_access_token TEXT NOT NULL,
            osm_refresh_token TEXT NOT NULL,
            osm_token_expiry TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS score_outbox (
            id BIGSERIAL PRIMARY KEY,
            osm_user_id BIGINT NOT NULL,
            section_id BIGINT NOT NULL,
            patrol_id TEXT NOT NULL,
            points_delta BIGINT NOT NULL,
            idempotency_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INT NOT NULL DEFAULT 0,
            last_error TEXT,
            next_retry_at TIMESTAMPTZ,
            processed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_score_outbox_claim
         ON score_outbox (osm_user_id, section_id, patrol_id)
         WHERE status IN ('pending', 'failed')",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_score_outbox_idem
         ON score_outbox (osm_user_id, idempotency_key)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS adhoc_patrols (
            osm_user_id BIGINT NOT NULL,
            patrol_id TEXT NOT NULL,
            name TEXT NOT NULL,
            score BIGINT NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (osm_user_id, patrol_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Database schema ready");
    Ok(())
}
