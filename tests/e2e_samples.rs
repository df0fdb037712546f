//! End-to-end samples: a chunked batch pipeline that fans out one activity
//! per chunk, fans the results back in, and reports business failures as
//! data instead of failing the instance.
use duraflow::providers::HistoryStore;
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::replay_info;
use duraflow::runtime::registry::ActivityRegistry;
use duraflow::runtime::{self};
use duraflow::{Event, InstanceStatus, OrchestrationContext, OrchestrationRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    start: u64,
    #[serde(default)]
    end: u64,
    #[serde(default)]
    total_chunks: i64,
    time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkRequest {
    index: u32,
    time: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct BatchReport {
    status: String,
    total_chunks: u32,
    results: Vec<String>,
}

// Requested counts outside [1, 5] are coerced rather than rejected: batches
// must run even on malformed trigger payloads. A missing count deserializes
// to 0 and lands on the default.
fn effective_chunk_count(requested: i64) -> u32 {
    if requested <= 0 {
        3
    } else if requested > 5 {
        5
    } else {
        requested as u32
    }
}

async fn chunk_pipeline(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let req: BatchRequest = serde_json::from_str(&input).map_err(|e| format!("invalid request: {e}"))?;
    let total = effective_chunk_count(req.total_chunks);
    replay_info!(ctx, "fanning out {total} chunks for window {}", req.time);

    let futs = (0..total)
        .map(|index| {
            ctx.schedule_activity_typed(
                "ProcessChunk",
                &ChunkRequest {
                    index,
                    time: req.time.clone(),
                },
            )
        })
        .collect();
    let outcomes = ctx.join(futs).await;

    let mut failed = false;
    let mut results = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Ok(r) => results.push(r),
            Err(e) => {
                failed = true;
                results.push(format!("error: {e}"));
            }
        }
    }
    let report = BatchReport {
        status: if failed { "error" } else { "ok" }.to_string(),
        total_chunks: total,
        results,
    };
    serde_json::to_string(&report).map_err(|e| e.to_string())
}

async fn process_chunk(req: ChunkRequest) -> Result<String, String> {
    if req.time == "poison" && req.index == 2 {
        return Err("chunk 2 exploded".to_string());
    }
    Ok(format!("chunk-{}@{}", req.index, req.time))
}

async fn pipeline_runtime(store: Arc<dyn HistoryStore>) -> Arc<runtime::Runtime> {
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("ChunkPipeline", chunk_pipeline)
        .build();
    let activity_registry = ActivityRegistry::builder()
        .register_typed("ProcessChunk", process_chunk)
        .build();
    runtime::Runtime::start_with_store(store, Arc::new(activity_registry), orchestration_registry).await
}

fn request(total_chunks: i64, time: &str) -> String {
    serde_json::to_string(&BatchRequest {
        start: 0,
        end: 0,
        total_chunks,
        time: time.to_string(),
    })
    .unwrap()
}

async fn run_pipeline(rt: &Arc<runtime::Runtime>, input: String) -> (String, BatchReport) {
    let inst = rt.start_new("ChunkPipeline", input).await.unwrap();
    let status = rt.wait_for_orchestration(&inst, Duration::from_secs(5)).await.unwrap();
    let output = match status {
        InstanceStatus::Completed { output } => output,
        other => panic!("expected Completed, got {other:?}"),
    };
    let report: BatchReport = serde_json::from_str(&output).unwrap();
    (inst, report)
}

#[tokio::test]
async fn pipeline_happy_path() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = pipeline_runtime(store.clone()).await;

    let (inst, report) = run_pipeline(&rt, request(4, "w0")).await;
    assert_eq!(report.status, "ok");
    assert_eq!(report.total_chunks, 4);
    assert_eq!(
        report.results,
        vec!["chunk-0@w0", "chunk-1@w0", "chunk-2@w0", "chunk-3@w0"]
    );

    // Fan-out happens in one turn: every schedule precedes every completion
    let hist = store.read(&inst).await;
    let first_completion = hist
        .iter()
        .position(|e| matches!(e, Event::ActivityCompleted { .. } | Event::ActivityFailed { .. }))
        .unwrap();
    let last_schedule = hist
        .iter()
        .rposition(|e| matches!(e, Event::ActivityScheduled { .. }))
        .unwrap();
    assert!(
        last_schedule < first_completion,
        "all chunks must be scheduled before any completes"
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn pipeline_coerces_invalid_chunk_counts() {
    let rt = pipeline_runtime(Arc::new(InMemoryHistoryStore::default())).await;

    let (_i, report) = run_pipeline(&rt, request(0, "w")).await;
    assert_eq!(report.total_chunks, 3, "non-positive count defaults to 3");
    assert_eq!(report.results.len(), 3);

    let (_i, report) = run_pipeline(&rt, request(-7, "w")).await;
    assert_eq!(report.total_chunks, 3);

    let (_i, report) = run_pipeline(&rt, request(100, "w")).await;
    assert_eq!(report.total_chunks, 5, "oversized count clamps to 5");
    assert_eq!(report.results.len(), 5);

    // A payload with no count at all also lands on the default
    let (_i, report) = run_pipeline(&rt, r#"{"time":"w"}"#.to_string()).await;
    assert_eq!(report.total_chunks, 3);

    rt.shutdown().await;
}

// A failing chunk is reported in its slot; siblings run to completion and the
// instance itself still completes, carrying the business error as data.
#[tokio::test]
async fn pipeline_reports_partial_failure_as_error_status() {
    let rt = pipeline_runtime(Arc::new(InMemoryHistoryStore::default())).await;

    let (_i, report) = run_pipeline(&rt, request(5, "poison")).await;
    assert_eq!(report.status, "error");
    assert_eq!(report.results.len(), 5);
    assert_eq!(report.results[2], "error: chunk 2 exploded");
    assert_eq!(report.results[0], "chunk-0@poison");
    assert_eq!(report.results[4], "chunk-4@poison");

    rt.shutdown().await;
}

// Malformed input is an orchestration failure, not a hang.
#[tokio::test]
async fn pipeline_rejects_unparseable_input() {
    let rt = pipeline_runtime(Arc::new(InMemoryHistoryStore::default())).await;
    let inst = rt.start_new("ChunkPipeline", "not json").await.unwrap();
    let status = rt.wait_for_orchestration(&inst, Duration::from_secs(5)).await.unwrap();
    match status {
        InstanceStatus::Failed { error } => assert!(error.contains("invalid request"), "got: {error}"),
        other => panic!("expected Failed, got {other:?}"),
    }
    rt.shutdown().await;
}

// Trigger glue: a scheduler tick covers the 10-minute window it falls in and
// sizes the batch from the row count and chunk size.
const WINDOW_MS: u64 = 10 * 60 * 1000;

fn batch_request_for(now_ms: u64, total_rows: u64, chunk_size: u64) -> BatchRequest {
    let window_start = now_ms / WINDOW_MS * WINDOW_MS;
    BatchRequest {
        start: window_start,
        end: window_start + WINDOW_MS,
        total_chunks: ((total_rows + chunk_size - 1) / chunk_size) as i64,
        time: window_start.to_string(),
    }
}

#[tokio::test]
async fn scheduler_trigger_starts_windowed_batch() {
    let rt = pipeline_runtime(Arc::new(InMemoryHistoryStore::default())).await;

    let now_ms = 1_700_000_123_456u64;
    let req = batch_request_for(now_ms, 10, 4);
    assert_eq!(req.start, 1_699_999_800_000);
    assert_eq!(req.end, req.start + WINDOW_MS);
    assert_eq!(req.total_chunks, 3, "10 rows in chunks of 4");

    let input = serde_json::to_string(&req).unwrap();
    let (_i, report) = run_pipeline(&rt, input).await;
    assert_eq!(report.status, "ok");
    assert_eq!(report.total_chunks, 3);
    assert_eq!(report.results[0], format!("chunk-0@{}", req.time));

    rt.shutdown().await;
}

// Instances share the runtime but never each other's history.
#[tokio::test]
async fn concurrent_instances_are_isolated() {
    let rt = pipeline_runtime(Arc::new(InMemoryHistoryStore::default())).await;

    let (a, b) = futures::future::join(
        run_pipeline(&rt, request(2, "wa")),
        run_pipeline(&rt, request(3, "wb")),
    )
    .await;
    assert_eq!(a.1.results, vec!["chunk-0@wa", "chunk-1@wa"]);
    assert_eq!(b.1.total_chunks, 3);
    assert!(b.1.results.iter().all(|r| r.ends_with("@wb")));

    rt.shutdown().await;
}

// Status endpoint glue: the snapshot carries everything a status API needs.
#[tokio::test]
async fn snapshot_backs_a_status_endpoint() {
    let rt = pipeline_runtime(Arc::new(InMemoryHistoryStore::default())).await;

    assert!(rt.get_instance("wf-unknown").await.is_none());

    let (inst, _report) = run_pipeline(&rt, request(2, "w")).await;
    let snap = rt.get_instance(&inst).await.unwrap();
    assert_eq!(snap.instance_id, inst);
    assert!(matches!(snap.status, InstanceStatus::Completed { .. }));
    assert!(snap.output.is_some());
    assert!(snap.created_at_ms > 0);
    assert!(snap.completed_at_ms.unwrap() >= snap.created_at_ms);

    rt.shutdown().await;
}
