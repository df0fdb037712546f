use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::Runtime;
use crate::Event;
use crate::providers::{HistoryStore, QueueKind, StoreError, WorkItem};

const ENQUEUE_ATTEMPTS: usize = 3;
const ENQUEUE_RETRY_DELAY_MS: u64 = 25;

/// Enqueue with bounded retries. `Unavailable` is the only transient variant;
/// anything else is returned immediately.
pub(crate) async fn enqueue_with_retry(
    store: &Arc<dyn HistoryStore>,
    kind: QueueKind,
    item: WorkItem,
) -> Result<(), StoreError> {
    let mut attempt = 0;
    loop {
        match store.enqueue_work(kind, item.clone()).await {
            Ok(()) => return Ok(()),
            Err(StoreError::Unavailable(_)) if attempt + 1 < ENQUEUE_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(ENQUEUE_RETRY_DELAY_MS)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Hand a `CallActivity` decision to the worker queue. Skips dispatch when a
/// completion for the id is already recorded (replay after crash).
pub async fn dispatch_call_activity(
    rt: &Arc<Runtime>,
    instance: &str,
    history: &[Event],
    id: u64,
    name: String,
    input: String,
) -> Result<(), StoreError> {
    let already_resolved = history.iter().any(
        |e| matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id),
    );
    if already_resolved {
        debug!(instance, id, name=%name, "skipping dispatch for resolved activity");
        return Ok(());
    }
    enqueue_with_retry(
        &rt.history_store,
        QueueKind::Worker,
        WorkItem::ActivityExecute {
            instance: instance.to_string(),
            id,
            name,
            input,
        },
    )
    .await
}
