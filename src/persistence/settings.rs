use super::Db;
use crate::Result;

pub const KEY_GLOBAL_USERNAME: &str = "global_username";
pub const KEY_GLOBAL_PASSWORD: &str = "global_password";
pub const KEY_BATCH_WAIT_MINUTES: &str = "batch_wait_minutes";

/// Pause between rollout batches when the operator has not configured one.
/// Conservative on purpose: simultaneous reboot storms destabilize the
/// access network.
pub const DEFAULT_BATCH_WAIT_MINUTES: u32 = 5;

pub async fn get_setting(pool: &Db, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_setting(pool: &Db, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value)
        VALUES (?1, ?2)
        ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Global SSH credentials used for routers without per-device overrides.
/// Both halves must be present for the pair to count.
pub async fn global_credentials(pool: &Db) -> Result<Option<(String, String)>> {
    let username = get_setting(pool, KEY_GLOBAL_USERNAME).await?;
    let password = get_setting(pool, KEY_GLOBAL_PASSWORD).await?;
    match (username, password) {
        (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
            Ok(Some((user, pass)))
        }
        _ => Ok(None),
    }
}

pub async fn set_global_credentials(pool: &Db, username: &str, password: &str) -> Result<()> {
    set_setting(pool, KEY_GLOBAL_USERNAME, username).await?;
    set_setting(pool, KEY_GLOBAL_PASSWORD, password).await?;
    Ok(())
}

pub async fn batch_wait_minutes(pool: &Db) -> Result<u32> {
    let value = get_setting(pool, KEY_BATCH_WAIT_MINUTES).await?;
    match value {
        Some(raw) => Ok(raw.trim().parse().unwrap_or(DEFAULT_BATCH_WAIT_MINUTES)),
        None => Ok(DEFAULT_BATCH_WAIT_MINUTES),
    }
}

pub async fn set_batch_wait_minutes(pool: &Db, minutes: u32) -> Result<()> {
    set_setting(pool, KEY_BATCH_WAIT_MINUTES, &minutes.to_string()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;

    async fn test_pool() -> Db {
        let pool = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn set_overwrites_existing_value() {
        let pool = test_pool().await;
        set_setting(&pool, "k", "v1").await.expect("set");
        set_setting(&pool, "k", "v2").await.expect("set again");
        assert_eq!(get_setting(&pool, "k").await.expect("get").as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn credentials_require_both_halves() {
        let pool = test_pool().await;
        assert!(global_credentials(&pool).await.expect("none").is_none());

        set_setting(&pool, KEY_GLOBAL_USERNAME, "admin").await.expect("user");
        assert!(global_credentials(&pool).await.expect("half").is_none());

        set_setting(&pool, KEY_GLOBAL_PASSWORD, "secret").await.expect("pass");
        let creds = global_credentials(&pool).await.expect("pair").expect("some");
        assert_eq!(creds, ("admin".to_string(), "secret".to_string()));
    }

    #[tokio::test]
    async fn batch_wait_minutes_defaults_and_round_trips() {
        let pool = test_pool().await;
        assert_eq!(
            batch_wait_minutes(&pool).await.expect("default"),
            DEFAULT_BATCH_WAIT_MINUTES
        );

        set_batch_wait_minutes(&pool, 0).await.expect("set");
        assert_eq!(batch_wait_minutes(&pool).await.expect("zero"), 0);

        set_batch_wait_minutes(&pool, 2).await.expect("set");
        assert_eq!(batch_wait_minutes(&pool).await.expect("two"), 2);
    }
}
