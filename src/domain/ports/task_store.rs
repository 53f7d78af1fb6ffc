//! Task store port.
//!
//! Durable persistence of per-task records. Writes for one task are
//! serialized by the single-threaded dispatcher; implementations must stay
//! safe under concurrent readers.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::{Task, TaskPatch};

/// Repository interface for task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a new record. Fails `AlreadyExists` on id collision.
    async fn create(&self, task: &Task) -> CoreResult<()>;

    /// Apply a partial update. Fails `NotFound` for unknown ids.
    async fn update(&self, id: Uuid, patch: TaskPatch) -> CoreResult<()>;

    /// Fetch the full record. Fails `NotFound` for unknown ids.
    async fn get(&self, id: Uuid) -> CoreResult<Task>;

    /// Page through records in reverse chronological order of creation.
    /// Returns the page plus the total record count.
    async fn list(&self, limit: usize, offset: usize) -> CoreResult<(Vec<Task>, usize)>;

    /// Append opaque conversation messages to a record.
    async fn append_conversation(
        &self,
        id: Uuid,
        messages: Vec<serde_json::Value>,
    ) -> CoreResult<()>;

    /// Mark records left `running` by a dead process as failed. Returns the
    /// number of records recovered. In-memory stores have nothing to do.
    async fn recover_interrupted(&self) -> CoreResult<u64> {
        Ok(0)
    }
}
