//! SQLite blob store
//!
//! Per-item results live under disjoint keys, so concurrent workers never
//! write the same row unless they hold the same item (duplicate delivery),
//! in which case the last write wins.

use super::BlobStore;
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shelf_common::{Error, Result};
use sqlx::SqlitePool;

/// `LIKE` pattern matching everything that starts with `prefix`
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub struct SqliteBlobStore {
    pool: SqlitePool,
}

impl SqliteBlobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, key: &str, body: &str) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        retry_on_lock("blob put", DEFAULT_MAX_LOCK_WAIT, || async {
            sqlx::query(
                r#"
                INSERT INTO blobs (key, body, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    body = excluded.body,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(body)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn put_if_absent(&self, key: &str, body: &str) -> Result<bool> {
        let updated_at = Utc::now().to_rfc3339();
        retry_on_lock("blob put_if_absent", DEFAULT_MAX_LOCK_WAIT, || async {
            let result = sqlx::query(
                "INSERT INTO blobs (key, body, updated_at) VALUES (?, ?, ?) ON CONFLICT(key) DO NOTHING",
            )
            .bind(key)
            .bind(body)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM blobs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(body)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar(r"SELECT COUNT(*) FROM blobs WHERE key LIKE ? ESCAPE '\'")
                .bind(like_prefix(prefix))
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r"SELECT key, body FROM blobs WHERE key LIKE ? ESCAPE '\' ORDER BY key",
        )
        .bind(like_prefix(prefix))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = like_prefix(prefix);
        retry_on_lock("blob delete_prefix", DEFAULT_MAX_LOCK_WAIT, || async {
            let result = sqlx::query(r"DELETE FROM blobs WHERE key LIKE ? ESCAPE '\'")
                .bind(&pattern)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        retry_on_lock("blob delete", DEFAULT_MAX_LOCK_WAIT, || async {
            let result = sqlx::query("DELETE FROM blobs WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }
}

/// Store `value` as JSON, overwriting
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_string(value)?;
    store.put(key, &body).await
}

/// Store `value` as JSON only if `key` is unused
pub async fn put_json_if_absent<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> Result<bool> {
    let body = serde_json::to_string(value)?;
    store.put_if_absent(key, &body).await
}

/// Load and decode a JSON blob
pub async fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(body) => serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| Error::Internal(format!("Corrupt blob '{}': {}", key, e))),
        None => Ok(None),
    }
}
