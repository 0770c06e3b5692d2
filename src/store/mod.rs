//! Persistence seam for instances and challenges.
//!
//! The store is the source of truth across restarts. At runtime the engine
//! keeps its own in-memory view and writes through to the store.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{Challenge, Instance, InstanceId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// `Database_Url` value selecting the in-process store.
pub const MEMORY_URL: &str = "memory";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_instance(&self, instance: &Instance) -> Result<(), StoreError>;

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError>;

    async fn count_instances(&self) -> Result<i64, StoreError>;

    async fn active_instance_for_user(&self, user_id: &str)
        -> Result<Option<Instance>, StoreError>;

    async fn set_backend_resource_id(
        &self,
        instance_id: InstanceId,
        resource_id: &str,
    ) -> Result<(), StoreError>;

    async fn set_expiry(&self, instance_id: InstanceId, expiry: i64) -> Result<(), StoreError>;

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<(), StoreError>;

    /// Insert or replace, keyed by `challenge_id`.
    async fn upsert_challenge(&self, challenge: &Challenge) -> Result<(), StoreError>;

    async fn get_challenge(&self, challenge_id: &str) -> Result<Option<Challenge>, StoreError>;

    async fn find_challenge_by_name(&self, name: &str) -> Result<Option<Challenge>, StoreError>;

    async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError>;

    async fn delete_challenge(&self, challenge_id: &str) -> Result<(), StoreError>;
}

/// Open the store named by `url`, retrying failed connections up to
/// `attempts` times with `wait` in between.
pub async fn connect(
    url: &str,
    attempts: u32,
    wait: Duration,
) -> Result<Arc<dyn Store>, StoreError> {
    if url == MEMORY_URL {
        info!("using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match SqliteStore::connect(url).await {
            Ok(store) => {
                info!(attempt, "connected to database");
                return Ok(Arc::new(store));
            }
            Err(err) if attempt < attempts => {
                warn!(attempt, attempts, error = %err, "database connection failed, retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Comma-joined port list, the column format for `ports_used`.
pub(crate) fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn split_ports(column: &str) -> Result<Vec<u16>, StoreError> {
    column
        .split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("bad port {part:?}")))
        })
        .collect()
}
