//! The single-writer embedded store (core spec §4.1).
//!
//! Every public operation is implemented in one of the sibling modules and
//! runs through [`Store::with_tx`], which serializes all database work
//! behind one non-reentrant mutex and retries on transient contention.
//! Nothing in this crate talks to `sqlx` directly outside this module.

use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{AppError, AppResult};

pub mod ad_queries;
pub mod ads;
pub mod models;
pub mod push_queue;
pub mod sessions;

pub struct Store {
    pool: SqlitePool,
    /// The serialization point. `pool` is pinned to one connection
    /// ([`crate::config::DatabaseConfig::max_connections`]) as a second line
    /// of defense, but this mutex is what actually enforces the ordering
    /// guarantee in core spec §5.
    lock: Mutex<()>,
}

impl Store {
    pub async fn connect(config: &Config) -> AppResult<Self> {
        let db_url = &config.database.url;
        let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Internal(anyhow::anyhow!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect_with(connect_options)
            .await?;

        tracing::info!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Store {
            pool,
            lock: Mutex::new(()),
        })
    }

    /// Connects to an in-process database for tests. Not reachable from
    /// production code paths.
    #[cfg(test)]
    pub async fn connect_in_memory() -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Store {
            pool,
            lock: Mutex::new(()),
        })
    }

    /// Escape hatch for tests that need to inspect or mutate rows the
    /// public API has no way to reach (e.g. backdating `last_seen`).
    #[cfg(test)]
    pub(crate) fn pool_for_test(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `f` inside a single transaction, serialized by `lock`.
    ///
    /// Begin/commit with a deferred rollback on error, looping the whole
    /// block only on transient contention (`SQLITE_BUSY`/`SQLITE_LOCKED`).
    /// Any other error rolls back and propagates. Nesting is forbidden by
    /// contract: never call `with_tx` from inside `f`.
    pub(crate) async fn with_tx<T, F>(&self, mut f: F) -> AppResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut Transaction<'static, Sqlite>) -> BoxFuture<'c, AppResult<T>>
            + Send,
    {
        let _guard = self.lock.lock().await;

        loop {
            let mut tx = self.pool.begin().await?;

            match f(&mut tx).await {
                Ok(value) => {
                    tx.commit().await?;
                    return Ok(value);
                }
                Err(AppError::Database(e)) if is_locked(&e) => {
                    tx.rollback().await.ok();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                Err(e) => {
                    tx.rollback().await.ok();
                    return Err(e);
                }
            }
        }
    }
}

fn is_locked(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|c| c == "5" || c == "6") // SQLITE_BUSY / SQLITE_LOCKED
            .unwrap_or_else(|| db_err.message().contains("database is locked")),
        _ => false,
    }
}

/// `session_hash = SHA-256(session_id)`, hex-encoded. Only this hash is
/// ever written to the database (core spec §9 identifier widening).
pub fn hash_session_id(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    hex::encode(digest)
}

/// Truncates ad text to 128 chars for the notification payload (core spec
/// §6), respecting UTF-8 boundaries.
pub fn truncate_notification_text(text: &str) -> String {
    match text.char_indices().nth(128) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
