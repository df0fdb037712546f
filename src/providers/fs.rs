use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use super::{HistoryStore, QueueKind, StoreError, WorkItem, completion_key};
use crate::Event;

/// Filesystem-backed history store writing one JSONL file per instance.
/// Queues are JSONL files rewritten atomically via temp-file rename; peek-lock
/// tokens are lock sidecar files holding the invisible item. Queue rewrites
/// and history appends are read-modify-write, so each is serialized behind an
/// interior mutex shared across clones.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    cap: usize,
    history_lock: Arc<Mutex<()>>,
    orch_queue_lock: Arc<Mutex<()>>,
    work_queue_lock: Arc<Mutex<()>>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let work_q = path.join("work-queue.jsonl");
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&orch_q);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&work_q);
        Self {
            root: path,
            orch_queue_file: orch_q,
            work_queue_file: work_q,
            cap: 1024,
            history_lock: Arc::new(Mutex::new(())),
            orch_queue_lock: Arc::new(Mutex::new(())),
            work_queue_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{instance}.jsonl"))
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
        }
    }
    fn queue_lock(&self, kind: QueueKind) -> &Mutex<()> {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_lock,
            QueueKind::Worker => &self.work_queue_lock,
        }
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), StoreError> {
        // Rewrite atomically via temp file + rename. The temp name carries a
        // nonce so a concurrent writer in another process cannot clobber it.
        let qf = self.queue_file(kind);
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp = qf.with_extension(format!("jsonl.tmp-{nonce:x}-{:x}", std::process::id()));
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            for it in items {
                let line = serde_json::to_string(it).map_err(|e| StoreError::Unavailable(e.to_string()))?;
                use std::io::Write as _;
                tf.write_all(line.as_bytes())
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                tf.write_all(b"\n").map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        std::fs::rename(&tmp, qf).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    /// Read the entire JSONL file for the instance and deserialize each line.
    async fn read(&self, instance: &str) -> Vec<Event> {
        let data = fs::read_to_string(self.inst_path(instance)).await.unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(ev) = serde_json::from_str::<Event>(line) {
                out.push(ev)
            }
        }
        out
    }

    /// Append events with a capacity guard and idempotent completion dedupe.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, StoreError> {
        let _guard = self.history_lock.lock().await;
        fs::create_dir_all(&self.root).await.ok();
        let path = self.inst_path(instance);
        // The instance file must exist (create_instance first)
        if !fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        let existing = self.read(instance).await;
        if existing.len() + new_events.len() > self.cap {
            return Err(StoreError::CapacityExceeded {
                cap: self.cap,
                have: existing.len(),
                append: new_events.len(),
            });
        }
        // Append only not-yet-seen completion-like events; always append schedule-like ones
        use std::collections::HashSet;
        let mut seen: HashSet<(u64, &'static str)> = existing.iter().filter_map(completion_key).collect();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut written = existing.len();
        for ev in new_events {
            if let Some(key) = completion_key(&ev) {
                if !seen.insert(key) {
                    continue;
                }
            }
            let line = serde_json::to_string(&ev).map_err(|e| StoreError::Unavailable(e.to_string()))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            file.write_all(b"\n")
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            written += 1;
        }
        file.flush().await.ok();
        Ok(written as u64)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let path = self.inst_path(instance);
        match fs::OpenOptions::new().create_new(true).write(true).open(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::InstanceExists(instance.to_string()))
            }
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        let path = self.inst_path(instance);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        fs::remove_file(&path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    /// List instances by scanning `.jsonl` files under the root.
    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".jsonl") {
                        if !stem.ends_with("-queue") {
                            out.push(stem.to_string());
                        }
                    }
                }
            }
        }
        out
    }

    /// Remove the root directory and all contents.
    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }

    /// Produce a human-readable dump of all stored histories.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for ev in self.read(&inst).await {
                out.push_str(&format!("  {ev:#?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        // Idempotent enqueue: load current items and only append if not present
        let _guard = self.queue_lock(kind).lock().await;
        let mut items = self.read_queue(kind);
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        // Pop first item but write it to a lock sidecar to keep invisible until ack/abandon
        let _guard = self.queue_lock(kind).lock().await;
        let mut items = self.read_queue(kind);
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        self.write_queue(kind, &items).ok()?;
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        let token = format!("{now_ns:x}-{pid:x}");
        let _ = std::fs::create_dir_all(self.lock_dir(kind));
        let line = serde_json::to_string(&first).ok()?;
        let _ = std::fs::write(self.lock_path(kind, &token), line);
        Some((first, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        // Read locked item and re-enqueue at front, then remove lock
        let _guard = self.queue_lock(kind).lock().await;
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let item: WorkItem = serde_json::from_str(&data).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut items = self.read_queue(kind);
        items.insert(0, item);
        self.write_queue(kind, &items)?;
        std::fs::remove_file(&path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
