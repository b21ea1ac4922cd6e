//! Durable per-unit state.
//!
//! Each dispatch unit (the pool scheduler, every reader pump) owns exactly
//! one key and writes it at the end of a turn. The store is a plain JSON
//! key-value abstraction so units can be tested without a database;
//! production uses PostgreSQL.

use std::{future::Future, pin::Pin, sync::Arc};

use courier_core::{CoreError, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use tracing::debug;

/// Boxed future returned by [`StateStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key-value storage for unit state.
pub trait StateStore: Send + Sync + std::fmt::Debug + 'static {
    /// Loads the value stored under `key`.
    fn load(&self, key: &str) -> StoreFuture<'_, Option<Value>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn save(&self, key: &str, value: Value) -> StoreFuture<'_, ()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> StoreFuture<'_, ()>;
}

/// Loads and decodes a typed value.
///
/// # Errors
///
/// Returns the store error, or `CoreError::Serialization` when the stored
/// value does not decode as `T`.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    match store.load(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encodes and stores a typed value.
///
/// # Errors
///
/// Returns `CoreError::Serialization` when encoding fails, or the store
/// error.
pub async fn save_json<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    store.save(key, value).await
}

/// PostgreSQL-backed state store.
///
/// Uses one row per key in `courier_state`.
#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: Arc<PgPool>,
}

impl PostgresStateStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Creates the state table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` if the DDL fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS courier_state (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&*self.pool)
        .await
        .map_err(store_error)?;
        debug!("courier_state table ready");
        Ok(())
    }
}

fn store_error(e: sqlx::Error) -> CoreError {
    CoreError::Store(e.to_string())
}

impl StateStore for PostgresStateStore {
    fn load(&self, key: &str) -> StoreFuture<'_, Option<Value>> {
        let pool = self.pool.clone();
        let key = key.to_string();
        Box::pin(async move {
            let row: Option<Json<Value>> =
                sqlx::query_scalar("SELECT value FROM courier_state WHERE key = $1")
                    .bind(&key)
                    .fetch_optional(&*pool)
                    .await
                    .map_err(store_error)?;
            Ok(row.map(|Json(value)| value))
        })
    }

    fn save(&self, key: &str, value: Value) -> StoreFuture<'_, ()> {
        let pool = self.pool.clone();
        let key = key.to_string();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO courier_state (key, value, updated_at) VALUES ($1, $2, now())
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
            )
            .bind(&key)
            .bind(Json(value))
            .execute(&*pool)
            .await
            .map_err(store_error)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> StoreFuture<'_, ()> {
        let pool = self.pool.clone();
        let key = key.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM courier_state WHERE key = $1")
                .bind(&key)
                .execute(&*pool)
                .await
                .map_err(store_error)?;
            Ok(())
        })
    }
}

pub mod mock {
    //! In-memory state store for tests and single-process runs.
    //!
    //! Clones share the same map, so a "restarted" unit built over a clone
    //! sees what its predecessor persisted. Save failures can be injected.

    use std::{collections::HashMap, sync::Arc};

    use courier_core::{CoreError, Result};
    use serde_json::Value;
    use tokio::sync::RwLock;

    use super::{StateStore, StoreFuture};

    /// In-memory state store.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStateStore {
        values: Arc<RwLock<HashMap<String, Value>>>,
        fail_saves: Arc<RwLock<u32>>,
        save_count: Arc<RwLock<usize>>,
    }

    impl MemoryStateStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `times` saves fail.
        pub async fn fail_next_saves(&self, times: u32) {
            *self.fail_saves.write().await = times;
        }

        /// Raw value under `key`.
        pub async fn get(&self, key: &str) -> Option<Value> {
            self.values.read().await.get(key).cloned()
        }

        /// Sorted keys currently stored.
        pub async fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.values.read().await.keys().cloned().collect();
            keys.sort();
            keys
        }

        /// Number of successful saves so far.
        pub async fn save_count(&self) -> usize {
            *self.save_count.read().await
        }
    }

    impl StateStore for MemoryStateStore {
        fn load(&self, key: &str) -> StoreFuture<'_, Option<Value>> {
            let key = key.to_string();
            Box::pin(async move { Ok(self.values.read().await.get(&key).cloned()) })
        }

        fn save(&self, key: &str, value: Value) -> StoreFuture<'_, ()> {
            let key = key.to_string();
            Box::pin(async move {
                {
                    let mut fail = self.fail_saves.write().await;
                    if *fail > 0 {
                        *fail -= 1;
                        return Err(CoreError::Store(format!("injected save failure for {key}")));
                    }
                }
                self.values.write().await.insert(key, value);
                *self.save_count.write().await += 1;
                Ok(())
            })
        }

        fn delete(&self, key: &str) -> StoreFuture<'_, ()> {
            let key = key.to_string();
            Box::pin(async move {
                self.values.write().await.remove(&key);
                Ok(())
            })
        }
    }
}
