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
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub batch_size: i64,
    pub total_routers: i64,
    pub completed_routers: i64,
    pub failed_routers: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub batch_size: u32,
    pub total_routers: u32,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, status, batch_size, total_routers, completed_routers,
           failed_routers, created_at, started_at, completed_at
    FROM batch_jobs
"#;

pub async fn insert_job(pool: &Db, new_job: NewJob) -> Result<JobRecord> {
    sqlx::query(
        r#"
        INSERT INTO batch_jobs (id, status, batch_size, total_routers)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(new_job.id)
    .bind(JobStatus::Pending)
    .bind(new_job.batch_size)
    .bind(new_job.total_routers)
    .execute(pool)
    .await?;

    get_job(pool, new_job.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job insert did not return row"))
}

pub async fn get_job(pool: &Db, id: Uuid) -> Result<Option<JobRecord>> {
    let query = format!("{SELECT_COLUMNS} WHERE id = ?1");
    let record = sqlx::query_as::<_, JobRecord>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// The most recent job that is still `pending` or `running`. By invariant
/// there is at most one; callers treat its presence as the rollout write
/// lock.
pub async fn get_active_job(pool: &Db) -> Result<Option<JobRecord>> {
    let query = format!(
        "{SELECT_COLUMNS} WHERE status IN (?1, ?2) ORDER BY created_at DESC LIMIT 1"
    );
    let record = sqlx::query_as::<_, JobRecord>(&query)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn list_jobs(pool: &Db) -> Result<Vec<JobRecord>> {
    let query = format!("{SELECT_COLUMNS} ORDER BY created_at DESC");
    let records = sqlx::query_as::<_, JobRecord>(&query).fetch_all(pool).await?;
    Ok(records)
}

pub async fn mark_running(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE batch_jobs SET status = ?2, started_at = ?3 WHERE id = ?1",
    )
    .bind(id)
    .bind(JobStatus::Running)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn update_progress(pool: &Db, id: Uuid, completed: u32, failed: u32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE batch_jobs SET completed_routers = ?2, failed_routers = ?3 WHERE id = ?1",
    )
    .bind(id)
    .bind(completed)
    .bind(failed)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn finish_job(pool: &Db, id: Uuid, status: JobStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE batch_jobs SET status = ?2, completed_at = ?3 WHERE id = ?1",
    )
    .bind(id)
    .bind(status)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Startup reconciliation: the abort flags live in process memory, so a job
/// that was `pending`/`running` when the process died can never resume.
pub async fn cancel_active_jobs(pool: &Db) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE batch_jobs
        SET status = ?1, completed_at = ?2
        WHERE status IN (?3, ?4)
        "#,
    )
    .bind(JobStatus::Cancelled)
    .bind(Utc::now())
    .bind(JobStatus::Pending)
    .bind(JobStatus::Running)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
