use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum HistoryStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub router_id: Uuid,
    pub firmware_before: Option<String>,
    pub firmware_after: Option<String>,
    pub status: HistoryStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// History row joined with the router's identity for operator listings.
/// The join is LEFT so records survive inventory deletion.
#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct HistoryListRow {
    pub id: Uuid,
    pub router_id: Uuid,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub firmware_before: Option<String>,
    pub firmware_after: Option<String>,
    pub status: HistoryStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewHistoryRecord {
    pub id: Uuid,
    pub router_id: Uuid,
    pub firmware_before: Option<String>,
}

impl NewHistoryRecord {
    pub fn started(router_id: Uuid, firmware_before: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            router_id,
            firmware_before,
        }
    }
}

pub async fn insert_history(pool: &Db, new_record: NewHistoryRecord) -> Result<HistoryRecord> {
    sqlx::query(
        r#"
        INSERT INTO update_history (id, router_id, firmware_before, status, started_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(new_record.id)
    .bind(new_record.router_id)
    .bind(&new_record.firmware_before)
    .bind(HistoryStatus::Running)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_history(pool, new_record.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("history insert did not return row"))
}

pub async fn get_history(pool: &Db, id: Uuid) -> Result<Option<HistoryRecord>> {
    let record = sqlx::query_as::<_, HistoryRecord>(
        r#"
        SELECT id, router_id, firmware_before, firmware_after, status,
               error_message, started_at, completed_at
        FROM update_history
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn finish_success(pool: &Db, id: Uuid, firmware_after: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE update_history
        SET status = ?2, firmware_after = ?3, completed_at = ?4
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(HistoryStatus::Success)
    .bind(firmware_after)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn finish_failed(pool: &Db, id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE update_history
        SET status = ?2, error_message = ?3, completed_at = ?4
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(HistoryStatus::Failed)
    .bind(error_message)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_for_router(pool: &Db, router_id: Uuid) -> Result<Vec<HistoryRecord>> {
    let records = sqlx::query_as::<_, HistoryRecord>(
        r#"
        SELECT id, router_id, firmware_before, firmware_after, status,
               error_message, started_at, completed_at
        FROM update_history
        WHERE router_id = ?1
        ORDER BY started_at DESC
        "#,
    )
    .bind(router_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn list_recent(pool: &Db, limit: u32) -> Result<Vec<HistoryListRow>> {
    let rows = sqlx::query_as::<_, HistoryListRow>(
        r#"
        SELECT h.id, h.router_id, r.device_name, r.ip_address,
               h.firmware_before, h.firmware_after, h.status,
               h.error_message, h.started_at, h.completed_at
        FROM update_history h
        LEFT JOIN routers r ON r.id = h.router_id
        ORDER BY h.started_at DESC
        LIMIT ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_recent_for_router(
    pool: &Db,
    router_id: Uuid,
    limit: u32,
) -> Result<Vec<HistoryListRow>> {
    let rows = sqlx::query_as::<_, HistoryListRow>(
        r#"
        SELECT h.id, h.router_id, r.device_name, r.ip_address,
               h.firmware_before, h.firmware_after, h.status,
               h.error_message, h.started_at, h.completed_at
        FROM update_history h
        LEFT JOIN routers r ON r.id = h.router_id
        WHERE h.router_id = ?1
        ORDER BY h.started_at DESC
        LIMIT ?2
        "#,
    )
    .bind(router_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Startup reconciliation: a `running` attempt cannot outlive the process
/// that was driving it.
pub async fn fail_running(pool: &Db, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE update_history
        SET status = ?2, error_message = ?3, completed_at = ?4
        WHERE status = ?1
        "#,
    )
    .bind(HistoryStatus::Running)
    .bind(HistoryStatus::Failed)
    .bind(error_message)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::routers::{insert_router, NewRouter};
    use crate::persistence::migrations;

    async fn test_pool() -> Db {
        let pool = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn running_record_has_no_completion() {
        let pool = test_pool().await;
        let router = NewRouter::new("a", "10.0.0.1");
        insert_router(&pool, router.clone()).await.expect("router");

        let record = insert_history(
            &pool,
            NewHistoryRecord::started(router.id, Some("RUT9_R_00.07.06.11".into())),
        )
        .await
        .expect("insert");

        assert_eq!(record.status, HistoryStatus::Running);
        assert!(record.completed_at.is_none());
        assert!(record.firmware_after.is_none());
    }

    #[tokio::test]
    async fn success_sets_firmware_after_and_completed_at() {
        let pool = test_pool().await;
        let router = NewRouter::new("a", "10.0.0.1");
        insert_router(&pool, router.clone()).await.expect("router");
        let record = insert_history(&pool, NewHistoryRecord::started(router.id, None))
            .await
            .expect("insert");

        finish_success(&pool, record.id, "RUT9_R_00.07.06.20")
            .await
            .expect("finish");

        let updated = get_history(&pool, record.id).await.expect("get").expect("some");
        assert_eq!(updated.status, HistoryStatus::Success);
        assert_eq!(updated.firmware_after.as_deref(), Some("RUT9_R_00.07.06.20"));
        assert!(updated.completed_at.is_some());
    }

    #[tokio::test]
    async fn recent_listing_joins_router_identity_and_survives_deletion() {
        let pool = test_pool().await;
        let router = NewRouter::new("branch-01", "10.0.0.1");
        insert_router(&pool, router.clone()).await.expect("router");
        let record = insert_history(&pool, NewHistoryRecord::started(router.id, None))
            .await
            .expect("insert");
        finish_failed(&pool, record.id, "Firmware download failed")
            .await
            .expect("finish");

        let rows = list_recent(&pool, 10).await.expect("recent");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_name.as_deref(), Some("branch-01"));

        crate::persistence::routers::delete_all_routers(&pool)
            .await
            .expect("delete");
        let rows = list_recent(&pool, 10).await.expect("recent after delete");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].device_name.is_none());
    }

    #[tokio::test]
    async fn recent_listing_filters_by_router() {
        let pool = test_pool().await;
        let first = NewRouter::new("branch-01", "10.0.0.1");
        let second = NewRouter::new("branch-02", "10.0.0.2");
        insert_router(&pool, first.clone()).await.expect("router");
        insert_router(&pool, second.clone()).await.expect("router");
        insert_history(&pool, NewHistoryRecord::started(first.id, None))
            .await
            .expect("insert");
        insert_history(&pool, NewHistoryRecord::started(second.id, None))
            .await
            .expect("insert");

        let rows = list_recent_for_router(&pool, first.id, 10).await.expect("filtered");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].router_id, first.id);
        assert_eq!(rows[0].device_name.as_deref(), Some("branch-01"));

        let all = list_recent(&pool, 10).await.expect("recent");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn fail_running_reconciles_stale_attempts() {
        let pool = test_pool().await;
        let router = NewRouter::new("a", "10.0.0.1");
        insert_router(&pool, router.clone()).await.expect("router");
        insert_history(&pool, NewHistoryRecord::started(router.id, None))
            .await
            .expect("insert");

        let reconciled = fail_running(&pool, "process restarted").await.expect("fail");
        assert_eq!(reconciled, 1);

        let rows = list_for_router(&pool, router.id).await.expect("list");
        assert_eq!(rows[0].status, HistoryStatus::Failed);
        assert_eq!(rows[0].error_message.as_deref(), Some("process restarted"));
        assert!(rows[0].completed_at.is_some());
    }
}
