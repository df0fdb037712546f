use crate::Event;
use serde::{Deserialize, Serialize};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Instance exists but no start event has been appended yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed { .. } | InstanceStatus::Failed { .. } | InstanceStatus::Terminated { .. }
        )
    }
}

/// Point-in-time view of an instance, derived purely from its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub input: String,
    pub output: Option<String>,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

impl InstanceSnapshot {
    pub(crate) fn from_history(instance: &str, history: &[Event]) -> Self {
        let mut snap = Self {
            instance_id: instance.to_string(),
            status: InstanceStatus::Pending,
            input: String::new(),
            output: None,
            created_at_ms: 0,
            completed_at_ms: None,
        };
        for e in history {
            match e {
                Event::OrchestrationStarted { input, at_ms, .. } => {
                    snap.status = InstanceStatus::Running;
                    snap.input = input.clone();
                    snap.created_at_ms = *at_ms;
                }
                Event::OrchestrationCompleted { output, at_ms } => {
                    snap.status = InstanceStatus::Completed { output: output.clone() };
                    snap.output = Some(output.clone());
                    snap.completed_at_ms = Some(*at_ms);
                }
                Event::OrchestrationFailed { error, at_ms } => {
                    snap.status = InstanceStatus::Failed { error: error.clone() };
                    snap.completed_at_ms = Some(*at_ms);
                }
                Event::OrchestrationTerminated { reason, at_ms } => {
                    snap.status = InstanceStatus::Terminated { reason: reason.clone() };
                    snap.completed_at_ms = Some(*at_ms);
                }
                _ => {}
            }
        }
        snap
    }
}

impl super::Runtime {
    /// Return the current snapshot for an instance, or `None` if the store
    /// has never heard of it.
    pub async fn get_instance(&self, instance: &str) -> Option<InstanceSnapshot> {
        let hist = self.history_store.read(instance).await;
        if hist.is_empty() && !self.history_store.list_instances().await.iter().any(|i| i == instance) {
            return None;
        }
        Some(InstanceSnapshot::from_history(instance, &hist))
    }

    /// Status-only variant of `get_instance`; unknown instances read as `Pending`.
    pub async fn get_orchestration_status(&self, instance: &str) -> InstanceStatus {
        let hist = self.history_store.read(instance).await;
        InstanceSnapshot::from_history(instance, &hist).status
    }

    /// Return execution history for an instance.
    pub async fn get_execution_history(&self, instance: &str) -> Vec<Event> {
        self.history_store.read(instance).await
    }
}
