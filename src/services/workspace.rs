//! Per-task workspace.
//!
//! A task owns one directory tree under the log root: structured state
//! files, an append-only action/reflection trail, and captured screenshots.
//! State writes are atomic (tmp + fsync + rename) so a reader never
//! observes a partial file; access to each state file is serialized by an
//! in-process per-file lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};

/// Per-task scoped filesystem area.
pub struct Workspace {
    root: PathBuf,
    task_id: Uuid,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    last_screenshot_ts: AtomicU64,
}

impl Workspace {
    /// Create `<log_dir>/<timestamp>_<task_id>/{screens,state,logs}`.
    pub async fn create(log_dir: &Path, task_id: Uuid) -> CoreResult<Self> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let root = log_dir.join(format!("{stamp}_{task_id}"));
        for sub in ["screens", "state", "logs"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self {
            root,
            task_id,
            locks: Mutex::new(HashMap::new()),
            last_screenshot_ts: AtomicU64::new(0),
        })
    }

    /// Open an existing workspace directory (recovery and tests).
    pub fn open(root: PathBuf, task_id: Uuid) -> Self {
        Self {
            root,
            task_id,
            locks: Mutex::new(HashMap::new()),
            last_screenshot_ts: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    async fn file_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.root.join("state").join(name)
    }

    /// Serialize `value` as JSON and atomically replace `state/<name>`:
    /// write to `<name>.tmp`, fsync, rename over the target.
    pub async fn write_state<T: Serialize>(&self, name: &str, value: &T) -> CoreResult<()> {
        let lock = self.file_lock(name).await;
        let _guard = lock.lock().await;

        let target = self.state_path(name);
        let tmp = self.state_path(&format!("{name}.tmp"));
        let bytes = serde_json::to_vec_pretty(value)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    /// Read `state/<name>`, returning `default` when the file is absent or
    /// unreadable. Strict UTF-8 is attempted first, then one lenient pass.
    pub async fn read_state<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        let lock = self.file_lock(name).await;
        let _guard = lock.lock().await;

        let raw = match tokio::fs::read(self.state_path(name)).await {
            Ok(raw) => raw,
            Err(_) => return default,
        };
        let text = match String::from_utf8(raw) {
            Ok(text) => text,
            Err(err) => {
                warn!(task_id = %self.task_id, file = name, "state file is not valid UTF-8, decoding leniently");
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            }
        };
        match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                warn!(task_id = %self.task_id, file = name, error = %err, "unreadable state file, using default");
                default
            }
        }
    }

    /// Append one JSON line to `state/<name>`. Whole line plus trailing
    /// newline per record.
    pub async fn append_jsonl<T: Serialize>(&self, name: &str, value: &T) -> CoreResult<()> {
        let lock = self.file_lock(name).await;
        let _guard = lock.lock().await;

        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.state_path(name))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read all records from `state/<name>`. A final truncated line (a
    /// crash mid-append) is tolerated and skipped.
    pub async fn read_jsonl<T: DeserializeOwned>(&self, name: &str) -> Vec<T> {
        let lock = self.file_lock(name).await;
        let _guard = lock.lock().await;

        let raw = match tokio::fs::read_to_string(self.state_path(name)).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let mut records = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(_) => {
                    // Truncated tail from an interrupted append.
                    warn!(task_id = %self.task_id, file = name, "skipping malformed jsonl line");
                }
            }
        }
        records
    }

    /// Persist a screenshot under `screens/` with a strictly increasing
    /// millisecond timestamp filename. Returns the absolute path.
    pub async fn save_screenshot(&self, image: &[u8]) -> CoreResult<PathBuf> {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let ts = self
            .last_screenshot_ts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .map(|prev| now.max(prev + 1))
            .unwrap_or(now);

        let path = self.root.join("screens").join(format!("{ts}.png"));
        tokio::fs::write(&path, image).await?;
        Ok(path)
    }

    /// Bytes of the most recently saved screenshot, if any.
    pub async fn latest_screenshot(&self) -> Option<Vec<u8>> {
        let screens = self.root.join("screens");
        let mut entries = tokio::fs::read_dir(&screens).await.ok()?;
        let mut newest: Option<(u64, PathBuf)> = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let stamp = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(stamp) = stamp {
                if newest.as_ref().map(|(n, _)| stamp > *n).unwrap_or(true) {
                    newest = Some((stamp, path));
                }
            }
        }
        let (_, path) = newest?;
        tokio::fs::read(path).await.ok()
    }

    /// Path of the dispatcher log file inside this workspace.
    pub fn dispatcher_log_path(&self) -> PathBuf {
        self.root.join("logs").join("dispatcher.log")
    }

    /// Append one timestamped line to the dispatcher log. Best effort; the
    /// durable trail lives in the state files.
    pub async fn append_log(&self, line: &str) {
        let entry = format!("{} {}\n", Utc::now().to_rfc3339(), line);
        if let Ok(mut file) = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dispatcher_log_path())
            .await
        {
            let _ = file.write_all(entry.as_bytes()).await;
        }
    }

    /// Delete the whole workspace tree.
    pub async fn remove(&self) -> CoreResult<()> {
        tokio::fs::remove_dir_all(&self.root)
            .await
            .map_err(|e| CoreError::Fatal(format!("failed to remove workspace: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), Uuid::new_v4()).await.unwrap();
        (dir, ws)
    }

    #[tokio::test]
    async fn test_state_round_trip_is_identical() {
        let (_dir, ws) = workspace().await;
        let value = json!({"text": "open calculator", "nested": {"k": [1, 2, 3]}});
        ws.write_state("instruction.json", &value).await.unwrap();
        let back: serde_json::Value = ws.read_state("instruction.json", json!(null)).await;
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn test_read_state_returns_default_when_absent() {
        let (_dir, ws) = workspace().await;
        let value: serde_json::Value = ws.read_state("missing.json", json!({"d": true})).await;
        assert_eq!(value["d"], true);
    }

    #[tokio::test]
    async fn test_write_leaves_no_tmp_file() {
        let (_dir, ws) = workspace().await;
        ws.write_state("plan.json", &json!({"remaining": []}))
            .await
            .unwrap();
        assert!(ws.state_path("plan.json").exists());
        assert!(!ws.state_path("plan.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_jsonl_tolerates_truncated_tail() {
        let (_dir, ws) = workspace().await;
        ws.append_jsonl("actions.jsonl", &json!({"step": 1}))
            .await
            .unwrap();
        ws.append_jsonl("actions.jsonl", &json!({"step": 2}))
            .await
            .unwrap();
        // Simulate a crash mid-append.
        let path = ws.state_path("actions.jsonl");
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"{\"step\": 3, \"trunc");
        std::fs::write(&path, raw).unwrap();

        let records: Vec<serde_json::Value> = ws.read_jsonl("actions.jsonl").await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["step"], 2);
    }

    #[tokio::test]
    async fn test_screenshot_names_strictly_increase() {
        let (_dir, ws) = workspace().await;
        let a = ws.save_screenshot(b"one").await.unwrap();
        let b = ws.save_screenshot(b"two").await.unwrap();
        let c = ws.save_screenshot(b"three").await.unwrap();

        let stamp = |p: &PathBuf| {
            p.file_stem()
                .unwrap()
                .to_str()
                .unwrap()
                .parse::<u64>()
                .unwrap()
        };
        assert!(stamp(&a) < stamp(&b));
        assert!(stamp(&b) < stamp(&c));

        let latest = ws.latest_screenshot().await.unwrap();
        assert_eq!(latest, b"three");
    }

    #[tokio::test]
    async fn test_remove_deletes_tree() {
        let (_dir, ws) = workspace().await;
        let root = ws.root().to_path_buf();
        ws.remove().await.unwrap();
        assert!(!root.exists());
    }
}
