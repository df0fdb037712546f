use super::router::OrchestratorMsg;
use crate::Event;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use std::sync::Arc;

/// Fold one router message into local history. Returns the ack token plus
/// whether the history actually changed; duplicates and messages arriving
/// after a terminal event leave history untouched.
pub fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> (Option<String>, bool) {
    match msg {
        OrchestratorMsg::ActivityCompleted {
            id, result, ack_token, ..
        } => {
            let duplicate = history
                .iter()
                .any(|e| matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id));
            if duplicate {
                return (ack_token, false);
            }
            history.push(Event::ActivityCompleted { id, result });
            (ack_token, true)
        }
        OrchestratorMsg::ActivityFailed { id, error, ack_token, .. } => {
            let duplicate = history
                .iter()
                .any(|e| matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id));
            if duplicate {
                return (ack_token, false);
            }
            history.push(Event::ActivityFailed { id, error });
            (ack_token, true)
        }
        OrchestratorMsg::TerminateRequested { reason, ack_token, .. } => {
            if history.iter().any(Event::is_terminal) {
                return (ack_token, false);
            }
            history.push(Event::OrchestrationTerminated {
                reason,
                at_ms: super::now_ms(),
            });
            (ack_token, true)
        }
    }
}

/// Re-enqueue worker items for every scheduled activity that has no recorded
/// outcome yet. Called when an instance is reloaded after a crash or
/// dehydration; the idempotent queues and history appends make redelivery of
/// already-executed work harmless.
pub async fn rehydrate_pending(instance: &str, history: &[Event], store: &Arc<dyn HistoryStore>) {
    for e in history {
        if let Event::ActivityScheduled { id, name, input } = e {
            let resolved = history.iter().any(
                |c| matches!(c, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if cid == id),
            );
            if resolved {
                continue;
            }
            if let Err(e) = super::dispatch::enqueue_with_retry(
                store,
                QueueKind::Worker,
                WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                },
            )
            .await
            {
                tracing::warn!(instance, id = *id, error = %e, "failed to re-enqueue pending activity");
            }
        }
    }
}
