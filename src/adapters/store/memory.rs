//! In-memory implementation of the task store.
//!
//! A guarded map plus a creation-ordered index. Writes are synchronous;
//! readers and the single per-task writer interleave safely through the
//! RwLock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Task, TaskPatch};
use crate::domain::ports::TaskStore;

#[derive(Default)]
struct MemoryState {
    records: HashMap<Uuid, Task>,
    /// (created_at, id), kept sorted ascending for reverse-chron listing
    index: Vec<(DateTime<Utc>, Uuid)>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    state: RwLock<MemoryState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &Task) -> CoreResult<()> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&task.id) {
            return Err(CoreError::AlreadyExists(task.id));
        }
        let key = (task.created_at, task.id);
        let pos = state.index.partition_point(|entry| *entry <= key);
        state.index.insert(pos, key);
        state.records.insert(task.id, task.clone());
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: TaskPatch) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let task = state
            .records
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found_task(id))?;
        patch.apply(task);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Task> {
        let state = self.state.read().await;
        state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found_task(id))
    }

    async fn list(&self, limit: usize, offset: usize) -> CoreResult<(Vec<Task>, usize)> {
        let state = self.state.read().await;
        let total = state.index.len();
        let page: Vec<Task> = state
            .index
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|(_, id)| state.records.get(id).cloned())
            .collect();
        Ok((page, total))
    }

    async fn append_conversation(
        &self,
        id: Uuid,
        messages: Vec<serde_json::Value>,
    ) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let task = state
            .records
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found_task(id))?;
        task.conversation.extend(messages);
        Ok(())
    }
}
