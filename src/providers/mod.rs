//! Durable history and queue providers.
//!
//! A `HistoryStore` owns two responsibilities: the append-only per-instance
//! event log, and the two work queues (orchestrator and worker) with
//! peek-lock semantics. Appends are idempotent for completion-like events so
//! crash-window redelivery never duplicates history.

use crate::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fs;
pub mod in_memory;

pub use fs::FsHistoryStore;
pub use in_memory::InMemoryHistoryStore;

/// Errors surfaced by store operations. `Unavailable` is transient and safe
/// to retry; the rest indicate caller mistakes or exhausted capacity.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("instance already exists: {0}")]
    InstanceExists(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("history cap exceeded (cap={cap}, have={have}, append={append})")]
    CapacityExceeded { cap: usize, have: usize, append: usize },
}

/// The two provider-backed queues: orchestrator-bound messages (starts,
/// completions, terminations) and worker-bound activity executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Orchestrator,
    Worker,
}

/// Queue payloads exchanged between the runtime's dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

/// Dedupe key for idempotent appends: completion-like events key on
/// (correlation id, kind); start and terminal events use a synthetic id=0
/// slot since at most one of each may exist per instance. Racing duplicate
/// starts fold into one event, keeping the recorded input immutable.
pub(crate) fn completion_key(ev: &Event) -> Option<(u64, &'static str)> {
    match ev {
        Event::ActivityCompleted { id, .. } => Some((*id, "ac")),
        Event::ActivityFailed { id, .. } => Some((*id, "af")),
        Event::OrchestrationStarted { .. } => Some((0, "os")),
        Event::OrchestrationCompleted { .. } => Some((0, "oc")),
        Event::OrchestrationFailed { .. } => Some((0, "of")),
        Event::OrchestrationTerminated { .. } => Some((0, "ot")),
        _ => None,
    }
}

/// Durable storage abstraction for instance histories and work queues.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the full history for an instance in append order. Unknown
    /// instances read as empty.
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Append events atomically and return the last sequence number (the
    /// history length after the append). Completion-like duplicates are
    /// silently dropped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, StoreError>;

    /// Create an empty instance. Fails with `InstanceExists` if present.
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Remove an instance and its history.
    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// List all known instance ids.
    async fn list_instances(&self) -> Vec<String>;

    /// Drop all stored state. Test hook.
    async fn reset(&self);

    /// Produce a human-readable dump of all stored histories.
    async fn dump_all_pretty(&self) -> String;

    /// Enqueue a work item; duplicate items already queued are ignored.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError>;

    /// Pop the next item behind a lock token. The item stays invisible until
    /// `ack` removes it or `abandon` returns it to the front of the queue.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;
}
