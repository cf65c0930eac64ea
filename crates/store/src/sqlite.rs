//! SQLite-backed token store using sqlx.
//!
//! Schema: `provider_tokens(provider_id, token_json, stored_at, updated_at)`
//! with `provider_id` as primary key. Timestamps are epoch milliseconds and
//! the columns are authoritative over the copies inside `token_json`.

use async_trait::async_trait;
use keyrelay_types::{
    ProviderId, ProviderToken, RelayError, TokenStore, epoch_ms, normalize, traits::Result,
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::str::FromStr;

/// A persistent [`TokenStore`] backed by `SQLite`.
pub struct SqliteTokenStore {
    pool: SqlitePool,
}

fn to_db(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_db(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

fn decode_row(
    provider_id: &str,
    json: &str,
    stored_at: i64,
    updated_at: i64,
) -> Result<ProviderToken> {
    let mut token: ProviderToken =
        serde_json::from_str(json).map_err(|e| RelayError::Storage(e.to_string()))?;
    token.provider_id = ProviderId::new(provider_id);
    token.stored_at = from_db(stored_at);
    token.updated_at = from_db(updated_at);
    Ok(token)
}

impl SqliteTokenStore {
    /// Connects to a `SQLite` database (e.g. `"sqlite:./tokens.db"` or `"sqlite::memory:"`).
    ///
    /// Automatically creates the database file if it does not exist.
    /// Runs migrations to create / upgrade the schema.
    ///
    /// # Errors
    ///
    /// Returns a [`sqlx::Error`] if the connection or table creation fails.
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            // `sqlite::memory:` is per-connection.
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Run schema migrations.
    ///
    /// - Creates the `provider_tokens` table if it does not exist.
    /// - Re-keys rows whose provider id is not canonical. When the canonical
    ///   key already exists, the most recently updated record wins.
    async fn migrate(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS provider_tokens (
                provider_id TEXT    NOT NULL PRIMARY KEY,
                token_json  TEXT    NOT NULL,
                stored_at   INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT provider_id, updated_at FROM provider_tokens")
                .fetch_all(pool)
                .await?;

        let mut tx = pool.begin().await?;
        for (raw, updated_at) in rows {
            let canonical = normalize(&raw).id;
            if canonical.as_str() == raw || canonical.is_empty() {
                continue;
            }
            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT updated_at FROM provider_tokens WHERE provider_id = ?")
                    .bind(canonical.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            match existing {
                Some((canonical_updated,)) if canonical_updated >= updated_at => {
                    sqlx::query("DELETE FROM provider_tokens WHERE provider_id = ?")
                        .bind(&raw)
                        .execute(&mut *tx)
                        .await?;
                }
                Some(_) => {
                    sqlx::query("DELETE FROM provider_tokens WHERE provider_id = ?")
                        .bind(canonical.as_str())
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("UPDATE provider_tokens SET provider_id = ? WHERE provider_id = ?")
                        .bind(canonical.as_str())
                        .bind(&raw)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query("UPDATE provider_tokens SET provider_id = ? WHERE provider_id = ?")
                        .bind(canonical.as_str())
                        .bind(&raw)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            tracing::info!(from = %raw, to = %canonical, "migrated provider id");
        }
        tx.commit().await?;

        Ok(())
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn get(&self, provider: &ProviderId) -> Result<Option<ProviderToken>> {
        let row: Option<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT provider_id, token_json, stored_at, updated_at
             FROM provider_tokens WHERE provider_id = ?",
        )
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, json, stored_at, updated_at)| decode_row(&id, &json, stored_at, updated_at))
            .transpose()
    }

    async fn put(&self, mut token: ProviderToken) -> Result<ProviderToken> {
        let now = epoch_ms();
        token.updated_at = now;
        if token.stored_at == 0 {
            token.stored_at = now;
        }
        let json = serde_json::to_string(&token).map_err(|e| RelayError::Storage(e.to_string()))?;

        // On conflict only the payload and `updated_at` change, so RETURNING
        // yields the original `stored_at`.
        let (stored_at,): (i64,) = sqlx::query_as(
            "INSERT INTO provider_tokens (provider_id, token_json, stored_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(provider_id) DO UPDATE SET
                 token_json = excluded.token_json,
                 updated_at = excluded.updated_at
             RETURNING stored_at",
        )
        .bind(token.provider_id.as_str())
        .bind(&json)
        .bind(to_db(token.stored_at))
        .bind(to_db(now))
        .fetch_one(&self.pool)
        .await?;

        token.stored_at = from_db(stored_at);
        Ok(token)
    }

    async fn remove(&self, provider: &ProviderId) -> Result<()> {
        sqlx::query("DELETE FROM provider_tokens WHERE provider_id = ?")
            .bind(provider.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProviderToken>> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT provider_id, token_json, stored_at, updated_at
             FROM provider_tokens ORDER BY provider_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for (id, json, stored_at, updated_at) in rows {
            match decode_row(&id, &json, stored_at, updated_at) {
                Ok(token) => result.push(token),
                Err(e) => {
                    tracing::warn!(provider = %id, error = %e, "skipping unreadable token row");
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem() -> SqliteTokenStore {
        SqliteTokenStore::new("sqlite::memory:").await.unwrap()
    }

    fn id(s: &str) -> ProviderId {
        ProviderId::new(s)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let s = mem().await;
        let tok = ProviderToken::new(id("github"), "access").with_refresh("refresh");
        s.put(tok).await.unwrap();
        let loaded = s.get(&id("github")).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "access");
        assert_eq!(loaded.refresh_token, Some("refresh".into()));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let s = mem().await;
        assert!(s.get(&id("google")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let s = mem().await;
        s.put(ProviderToken::new(id("slack"), "tok")).await.unwrap();
        s.remove(&id("slack")).await.unwrap();
        assert!(s.get(&id("slack")).await.unwrap().is_none());
        // idempotent
        s.remove(&id("slack")).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_keeps_stored_at() {
        let s = mem().await;
        let mut first = ProviderToken::new(id("github"), "first");
        first.stored_at = 42;
        let stored = s.put(first).await.unwrap();
        assert_eq!(stored.stored_at, 42);

        let second = s.put(ProviderToken::new(id("github"), "second")).await.unwrap();
        assert_eq!(second.stored_at, 42);

        let loaded = s.get(&id("github")).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "second");
        assert_eq!(loaded.stored_at, 42);
        assert!(loaded.updated_at >= 42);
    }

    #[tokio::test]
    async fn test_expiry_and_user_persist() {
        let s = mem().await;
        let tok = ProviderToken::new(id("notion"), "tok")
            .with_expiry(3600)
            .with_user(keyrelay_types::UserInfo {
                name: Some("Ada".into()),
                email: Some("ada@example.com".into()),
            });
        s.put(tok).await.unwrap();
        let loaded = s.get(&id("notion")).await.unwrap().unwrap();
        assert!(loaded.expires_at.is_some());
        assert_eq!(
            loaded.user.unwrap().email.as_deref(),
            Some("ada@example.com")
        );
    }

    #[tokio::test]
    async fn test_status_map() {
        let s = mem().await;
        s.put(ProviderToken::new(id("gh"), "old").with_expires_at(1))
            .await
            .unwrap();
        s.put(ProviderToken::new(id("linear"), "fresh")).await.unwrap();
        let status = s.status().await.unwrap();
        assert!(status[&id("gh")].expired);
        assert!(!status[&id("linear")].expired);
    }

    #[tokio::test]
    async fn test_migration_rekeys_non_canonical_ids() {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap();
        SqliteTokenStore::migrate(&pool).await.unwrap();

        let legacy = serde_json::to_string(&ProviderToken::new(id("x"), "legacy")).unwrap();
        let newer = serde_json::to_string(&ProviderToken::new(id("x"), "newer")).unwrap();
        // `Google_Drive` collides with an older canonical row and should win.
        for (pid, json, updated) in [
            ("Google_Drive", &newer, 200_i64),
            ("google-drive", &legacy, 100),
            ("GitHub", &legacy, 50),
        ] {
            sqlx::query(
                "INSERT INTO provider_tokens (provider_id, token_json, stored_at, updated_at)
                 VALUES (?, ?, 1, ?)",
            )
            .bind(pid)
            .bind(json)
            .bind(updated)
            .execute(&pool)
            .await
            .unwrap();
        }

        SqliteTokenStore::migrate(&pool).await.unwrap();
        let store = SqliteTokenStore { pool };

        let all = store.list().await.unwrap();
        let ids: Vec<_> = all.iter().map(|t| t.provider_id.to_string()).collect();
        assert_eq!(ids, ["github", "google-drive"]);
        let drive = store.get(&id("google-drive")).await.unwrap().unwrap();
        assert_eq!(drive.access_token, "newer");
    }
}
