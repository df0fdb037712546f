use duraflow::Event;
use duraflow::providers::HistoryStore;
use std::sync::Arc;
use std::time::Duration;

/// Poll the store until the instance history satisfies `pred` or the timeout
/// elapses. Returns true on success.
#[allow(dead_code)]
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let h = store.read(instance).await;
        if pred(&h) {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
