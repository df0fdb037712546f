use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Messages delivered back to the orchestrator loop by the dispatchers.
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TerminateRequested {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
}

pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    pub async fn forward(&self, msg: OrchestratorMsg) {
        let key = instance_of(&msg).to_string();
        let kind = kind_of(&msg);
        if let Some(tx) = self.inboxes.lock().await.get(&key) {
            if tx.send(msg).is_err() {
                warn!(instance=%key, kind=%kind, "router: receiver dropped, dropping message");
            }
        } else {
            warn!(instance=%key, kind=%kind, "router: unknown instance, dropping message");
        }
    }

}

fn instance_of(msg: &OrchestratorMsg) -> &str {
    match msg {
        OrchestratorMsg::ActivityCompleted { instance, .. }
        | OrchestratorMsg::ActivityFailed { instance, .. }
        | OrchestratorMsg::TerminateRequested { instance, .. } => instance,
    }
}

pub fn kind_of(msg: &OrchestratorMsg) -> &'static str {
    match msg {
        OrchestratorMsg::ActivityCompleted { .. } => "ActivityCompleted",
        OrchestratorMsg::ActivityFailed { .. } => "ActivityFailed",
        OrchestratorMsg::TerminateRequested { .. } => "TerminateRequested",
    }
}
