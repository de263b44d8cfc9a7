//! Cache entry repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};

use hearth_core::{CacheEntry, CacheStore, Error, Result};

/// PostgreSQL implementation of CacheStore.
#[derive(Clone)]
pub struct PgCacheRepository {
    pool: Pool<Postgres>,
}

impl PgCacheRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PgCacheRepository {
    async fn get(&self, domain: &str, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT domain, key, value, expires_at FROM cache_entry
             WHERE domain = $1 AND key = $2",
        )
        .bind(domain)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| CacheEntry {
            domain: r.get("domain"),
            key: r.get("key"),
            value: r.get("value"),
            expires_at: r.get("expires_at"),
        }))
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        // Last writer wins when two sets race on the same key.
        sqlx::query(
            "INSERT INTO cache_entry (domain, key, value, expires_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (domain, key) DO UPDATE
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(&entry.domain)
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete(&self, domain: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entry WHERE domain = $1 AND key = $2")
            .bind(domain)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entry WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
