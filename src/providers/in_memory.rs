use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{HistoryStore, QueueKind, StoreError, WorkItem, completion_key};
use crate::Event;

const CAP: usize = 1024;

/// In-process store used by tests and samples. Histories live in a map, the
/// queues are plain FIFOs with a token map holding peek-locked items.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Vec<Event>>>,
    orchestrator_q: Mutex<Vec<WorkItem>>,
    worker_q: Mutex<Vec<WorkItem>>,
    // Peek-lock state per-queue: token -> item. Items here are invisible until ack/abandon.
    invisible_orchestrator: Mutex<HashMap<String, WorkItem>>,
    invisible_worker: Mutex<HashMap<String, WorkItem>>,
}

impl InMemoryHistoryStore {
    fn queue(&self, kind: QueueKind) -> &Mutex<Vec<WorkItem>> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
        }
    }
    fn invisible(&self, kind: QueueKind) -> &Mutex<HashMap<String, WorkItem>> {
        match kind {
            QueueKind::Orchestrator => &self.invisible_orchestrator,
            QueueKind::Worker => &self.invisible_worker,
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.inner.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, StoreError> {
        let mut g = self.inner.lock().await;
        let cur = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        if cur.len() + new_events.len() > CAP {
            return Err(StoreError::CapacityExceeded {
                cap: CAP,
                have: cur.len(),
                append: new_events.len(),
            });
        }
        // Idempotent append for completion-like events by (id, kind)
        use std::collections::HashSet;
        let mut seen: HashSet<(u64, &'static str)> = cur.iter().filter_map(completion_key).collect();
        for e in new_events.into_iter() {
            match completion_key(&e) {
                Some(key) => {
                    if seen.insert(key) {
                        cur.push(e);
                    }
                }
                None => cur.push(e),
            }
        }
        Ok(cur.len() as u64)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(StoreError::InstanceExists(instance.to_string()));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if g.remove(instance).is_none() {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    async fn reset(&self) {
        // Histories, queues, and peek-locked items all go; a stale token
        // abandoned after reset must not resurrect work
        self.inner.lock().await.clear();
        self.orchestrator_q.lock().await.clear();
        self.worker_q.lock().await.clear();
        self.invisible_orchestrator.lock().await.clear();
        self.invisible_worker.lock().await.clear();
    }

    async fn dump_all_pretty(&self) -> String {
        let g = self.inner.lock().await;
        let mut out = String::new();
        for (inst, events) in g.iter() {
            out.push_str(&format!("instance={inst}\n"));
            for e in events {
                out.push_str(&format!("  {e:#?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        let mut q = self.queue(kind).lock().await;
        if !q.contains(&item) {
            q.push(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let item = {
            let mut q = self.queue(kind).lock().await;
            if q.is_empty() {
                return None;
            }
            q.remove(0)
        };
        let token = format!(
            "{}:{}",
            match kind {
                QueueKind::Orchestrator => "o",
                QueueKind::Worker => "w",
            },
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .ok()?
                .as_nanos()
        );
        self.invisible(kind).lock().await.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        self.invisible(kind).lock().await.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        if let Some(item) = self.invisible(kind).lock().await.remove(token) {
            self.queue(kind).lock().await.insert(0, item);
        }
        Ok(())
    }
}
