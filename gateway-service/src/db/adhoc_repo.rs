//! Ad-hoc patrol storage for devices enrolled with section 0.
//!
//! Teams are managed out of band; this repository only reads scores and
//! applies deltas.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::Patrol;

fn map_row(row: &PgRow) -> Result<Patrol, sqlx::Error> {
    Ok(Patrol {
        id: row.try_get("patrol_id")?,
        name: row.try_get("name")?,
        score: row.try_get("score")?,
    })
}

/// Patrols for a user, sorted by name (case-sensitive, matching the
/// upstream read path).
pub async fn list(pool: &PgPool, osm_user_id: i64) -> Result<Vec<Patrol>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT patrol_id, name, score FROM adhoc_patrols
         WHERE osm_user_id = $1
         ORDER BY name COLLATE \"C\"",
    )
    .bind(osm_user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_row).collect()
}

/// Apply a delta to an existing ad-hoc patrol; returns the new score, or
/// `None` when the patrol does not exist.
pub async fn apply_delta(
    pool: &PgPool,
    osm_user_id: i64,
    patrol_id: &str,
    delta: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE adhoc_patrols
        SET score = score + $3, updated_at = NOW()
        WHERE osm_user_id = $1 AND patrol_id = $2
        RETURNING score
        "#,
    )
    .bind(osm_user_id)
    .bind(patrol_id)
    .bind(delta)
    .fetch_optional(pool)
    .await?;
    row.map(|r| r.try_get("score")).transpose()
}
