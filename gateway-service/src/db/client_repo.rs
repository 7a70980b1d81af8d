//! Whitelist of public device client ids.
//!
//! The DB table is authoritative. The deprecated `ALLOWED_CLIENT_IDS` env
//! list is folded in once at startup so existing deployments keep working,
//! after which operators manage rows directly.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::models::AllowedClient;

fn map_row(row: &PgRow) -> Result<AllowedClient, sqlx::Error> {
    Ok(AllowedClient {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn find_enabled(
    pool: &PgPool,
    client_id: &str,
) -> Result<Option<AllowedClient>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, client_id, enabled, created_at, updated_at
         FROM allowed_clients WHERE client_id = $1 AND enabled",
    )
    .bind(client_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_row).transpose()
}

/// Insert env-seeded client ids that the table does not know yet.
pub async fn seed_from_env(pool: &PgPool, client_ids: &[String]) -> Result<(), sqlx::Error> {
    for client_id in client_ids {
        let res = sqlx::query(
            "INSERT INTO allowed_clients (id, client_id, enabled)
             VALUES ($1, $2, TRUE)
             ON CONFLICT (client_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(client_id)
        .execute(pool)
        .await?;
        if res.rows_affected() > 0 {
            info!(client_id = %client_id, "Seeded allowed client from environment");
        }
    }
    Ok(())
}
