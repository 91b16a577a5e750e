use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct FirmwareVersionRecord {
    pub device_prefix: String,
    pub latest_version: String,
    pub updated_at: DateTime<Utc>,
}

pub async fn list_versions(pool: &Db) -> Result<Vec<FirmwareVersionRecord>> {
    let records = sqlx::query_as::<_, FirmwareVersionRecord>(
        "SELECT device_prefix, latest_version, updated_at FROM firmware_versions ORDER BY device_prefix",
    )
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn get_version(pool: &Db, device_prefix: &str) -> Result<Option<FirmwareVersionRecord>> {
    let record = sqlx::query_as::<_, FirmwareVersionRecord>(
        "SELECT device_prefix, latest_version, updated_at FROM firmware_versions WHERE device_prefix = ?1",
    )
    .bind(device_prefix)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn upsert_version(pool: &Db, device_prefix: &str, latest_version: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO firmware_versions (device_prefix, latest_version)
        VALUES (?1, ?2)
        ON CONFLICT (device_prefix) DO UPDATE SET
            latest_version = excluded.latest_version,
            updated_at = datetime('now')
        "#,
    )
    .bind(device_prefix)
    .bind(latest_version)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_version(pool: &Db, device_prefix: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM firmware_versions WHERE device_prefix = ?1")
        .bind(device_prefix)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
