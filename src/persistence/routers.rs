use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum RouterStatus {
    Unknown,
    UpToDate,
    UpdateAvailable,
    Updating,
    Unreachable,
    Error,
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct RouterRecord {
    pub id: Uuid,
    pub device_name: String,
    pub ip_address: String,
    #[serde(skip_serializing)]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub current_firmware: Option<String>,
    pub available_firmware: Option<String>,
    pub status: RouterStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRouter {
    pub id: Uuid,
    pub device_name: String,
    pub ip_address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl NewRouter {
    pub fn new(device_name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_name: device_name.into(),
            ip_address: ip_address.into(),
            username: None,
            password: None,
        }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        device_name,
        ip_address,
        username,
        password,
        current_firmware,
        available_firmware,
        status,
        last_check,
        created_at,
        updated_at
    FROM routers
"#;

pub async fn list_routers(pool: &Db) -> Result<Vec<RouterRecord>> {
    let query = format!("{SELECT_COLUMNS} ORDER BY device_name, ip_address");
    let records = sqlx::query_as::<_, RouterRecord>(&query)
        .fetch_all(pool)
        .await?;
    Ok(records)
}

pub async fn list_routers_by_status(pool: &Db, status: RouterStatus) -> Result<Vec<RouterRecord>> {
    let query = format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY device_name, ip_address");
    let records = sqlx::query_as::<_, RouterRecord>(&query)
        .bind(status)
        .fetch_all(pool)
        .await?;
    Ok(records)
}

pub async fn get_router(pool: &Db, id: Uuid) -> Result<Option<RouterRecord>> {
    let query = format!("{SELECT_COLUMNS} WHERE id = ?1");
    let record = sqlx::query_as::<_, RouterRecord>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn insert_router(pool: &Db, new_router: NewRouter) -> Result<RouterRecord> {
    let id = new_router.id;
    sqlx::query(
        r#"
        INSERT INTO routers (id, device_name, ip_address, username, password, status)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(id)
    .bind(&new_router.device_name)
    .bind(&new_router.ip_address)
    .bind(&new_router.username)
    .bind(&new_router.password)
    .bind(RouterStatus::Unknown)
    .execute(pool)
    .await?;

    get_router(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("router insert did not return row"))
}

/// Bulk upsert in one transaction, keyed by router id. Running the same
/// batch twice leaves the table in the same state.
pub async fn insert_routers(pool: &Db, new_routers: &[NewRouter]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut written = 0u64;
    for router in new_routers {
        let result = sqlx::query(
            r#"
            INSERT INTO routers (id, device_name, ip_address, username, password, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (id) DO UPDATE SET
                device_name = excluded.device_name,
                ip_address = excluded.ip_address,
                username = excluded.username,
                password = excluded.password,
                updated_at = datetime('now')
            "#,
        )
        .bind(router.id)
        .bind(&router.device_name)
        .bind(&router.ip_address)
        .bind(&router.username)
        .bind(&router.password)
        .bind(RouterStatus::Unknown)
        .execute(&mut *tx)
        .await?;
        written += result.rows_affected();
    }
    tx.commit().await?;
    Ok(written)
}

pub async fn update_firmware_info(
    pool: &Db,
    id: Uuid,
    current: Option<&str>,
    available: Option<&str>,
    status: RouterStatus,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE routers
        SET current_firmware = ?2,
            available_firmware = ?3,
            status = ?4,
            last_check = ?5,
            updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(current)
    .bind(available)
    .bind(status)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn update_status(pool: &Db, id: Uuid, status: RouterStatus) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE routers
        SET status = ?2, updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(status)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_all_routers(pool: &Db) -> Result<u64> {
    // update_history rows are retained on purpose; they are the audit trail
    // for flashes that already happened.
    let result = sqlx::query("DELETE FROM routers").execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn count_by_status(pool: &Db) -> Result<Vec<(RouterStatus, i64)>> {
    let rows = sqlx::query_as::<_, (RouterStatus, i64)>(
        "SELECT status, COUNT(*) FROM routers GROUP BY status",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Startup reconciliation: an `updating` router whose owning job died with
/// the process has no lease holder left.
pub async fn reset_updating_to_error(pool: &Db) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE routers
        SET status = ?1, updated_at = datetime('now')
        WHERE status = ?2
        "#,
    )
    .bind(RouterStatus::Error)
    .bind(RouterStatus::Updating)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
