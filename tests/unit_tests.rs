use duraflow::providers::HistoryStore;
use duraflow::providers::fs::FsHistoryStore;
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::providers::{QueueKind, StoreError, WorkItem};
use duraflow::{Action, Event, Executor, OrchestrationContext, run_turn};

// 1) Single-turn emission: exactly one action per scheduled future, with the
// matching schedule event already recorded in history.
#[test]
fn action_emission_single_turn() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let _ = ctx.schedule_activity("A", "1").await;
        unreachable!()
    };

    let history: Vec<Event> = Vec::new();
    let (hist_after, actions, _logs, out): (_, _, _, Option<String>) = run_turn(history, orchestrator);
    assert!(out.is_none(), "must not complete in first turn");
    assert_eq!(actions.len(), 1, "exactly one action expected");
    match &actions[0] {
        Action::CallActivity { name, input, .. } => {
            assert_eq!(name, "A");
            assert_eq!(input, "1");
        }
    }
    assert!(matches!(hist_after[0], Event::ActivityScheduled { .. }));
}

// 2) Correlation: completions recorded out of order still resolve the right
// futures by id.
#[test]
fn correlation_out_of_order_completion() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "1".into(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "B".into(),
            input: "2".into(),
        },
        Event::ActivityCompleted {
            id: 2,
            result: "b-done".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "a-done".into(),
        },
    ];

    let orchestrator = |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "1");
        let b = ctx.schedule_activity("B", "2");
        ctx.join(vec![a, b]).await
    };

    let (_hist_after, actions, _logs, out) = run_turn(history, orchestrator);
    assert!(actions.is_empty(), "fully recorded turn must emit no actions");
    let results = out.expect("should complete");
    assert_eq!(results, vec![Ok("a-done".to_string()), Ok("b-done".to_string())]);
}

// 3) Replaying a complete history is idempotent: same output, no new events,
// no new actions.
#[test]
fn replay_of_complete_history_is_idempotent() {
    let orchestrator = |ctx: OrchestrationContext| async move { ctx.schedule_activity("Echo", "hi").await };

    let (final_hist, out) = Executor::drive_to_completion(Vec::new(), orchestrator, |actions, hist| {
        for a in actions {
            match a {
                Action::CallActivity { id, input, .. } => hist.push(Event::ActivityCompleted {
                    id,
                    result: format!("{input}!"),
                }),
            }
        }
    });
    assert_eq!(out, Ok("hi!".to_string()));

    for _ in 0..3 {
        let (hist_again, actions, _logs, out_again) = run_turn(final_hist.clone(), orchestrator);
        assert_eq!(hist_again, final_hist, "replay must not mutate history");
        assert!(actions.is_empty());
        assert_eq!(out_again, Some(Ok("hi!".to_string())));
    }
}

// 4) Fan-out in one turn: all schedule events land before suspension, in
// submission order with ascending ids.
#[test]
fn fan_out_schedules_in_submission_order() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let futs = (0..3).map(|i| ctx.schedule_activity("Chunk", i.to_string())).collect();
        ctx.join(futs).await
    };

    let (hist_after, actions, _logs, out): (_, _, _, Option<Vec<Result<String, String>>>) =
        run_turn(Vec::new(), orchestrator);
    assert!(out.is_none());
    assert_eq!(actions.len(), 3);
    let ids: Vec<u64> = hist_after
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { id, input, .. } => Some((*id, input.clone())),
            _ => None,
        })
        .enumerate()
        .map(|(i, (id, input))| {
            assert_eq!(input, i.to_string(), "schedules must follow submission order");
            id
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

// 5) Fan-in isolates failures: one failed child does not disturb siblings.
#[test]
fn fan_in_isolates_partial_failure() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "Chunk".into(),
            input: "0".into(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "Chunk".into(),
            input: "1".into(),
        },
        Event::ActivityScheduled {
            id: 3,
            name: "Chunk".into(),
            input: "2".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "r0".into(),
        },
        Event::ActivityFailed {
            id: 2,
            error: "boom".into(),
        },
        Event::ActivityCompleted {
            id: 3,
            result: "r2".into(),
        },
    ];

    let orchestrator = |ctx: OrchestrationContext| async move {
        let futs = (0..3).map(|i| ctx.schedule_activity("Chunk", i.to_string())).collect();
        ctx.join(futs).await
    };

    let (_h, _a, _l, out) = run_turn(history, orchestrator);
    assert_eq!(
        out,
        Some(vec![
            Ok("r0".to_string()),
            Err("boom".to_string()),
            Ok("r2".to_string())
        ])
    );
}

// ---------------- store behavior

#[tokio::test]
async fn in_memory_append_requires_instance() {
    let store = InMemoryHistoryStore::default();
    let err = store
        .append(
            "nope",
            vec![Event::ActivityCompleted {
                id: 1,
                result: "x".into(),
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InstanceNotFound(_)));
}

#[tokio::test]
async fn in_memory_create_twice_fails() {
    let store = InMemoryHistoryStore::default();
    store.create_instance("i1").await.unwrap();
    let err = store.create_instance("i1").await.unwrap_err();
    assert!(matches!(err, StoreError::InstanceExists(_)));
}

#[tokio::test]
async fn in_memory_completion_append_is_idempotent() {
    let store = InMemoryHistoryStore::default();
    store.create_instance("i1").await.unwrap();
    store
        .append(
            "i1",
            vec![Event::ActivityScheduled {
                id: 1,
                name: "A".into(),
                input: "x".into(),
            }],
        )
        .await
        .unwrap();
    let comp = Event::ActivityCompleted {
        id: 1,
        result: "ok".into(),
    };
    store.append("i1", vec![comp.clone()]).await.unwrap();
    store.append("i1", vec![comp.clone()]).await.unwrap();
    store
        .append(
            "i1",
            vec![Event::ActivityCompleted {
                id: 1,
                result: "other".into(),
            }],
        )
        .await
        .unwrap();

    let hist = store.read("i1").await;
    let completions = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { id: 1, .. }))
        .count();
    assert_eq!(completions, 1, "duplicate completion appends must be dropped");
}

#[tokio::test]
async fn in_memory_terminal_events_dedupe_on_synthetic_slot() {
    let store = InMemoryHistoryStore::default();
    store.create_instance("i1").await.unwrap();
    let term = Event::OrchestrationCompleted {
        output: "done".into(),
        at_ms: 1,
    };
    store.append("i1", vec![term.clone()]).await.unwrap();
    store.append("i1", vec![term]).await.unwrap();
    assert_eq!(store.read("i1").await.len(), 1);
}

// The start event shares the synthetic-slot dedupe: a second append leaves
// the recorded input untouched.
#[tokio::test]
async fn in_memory_start_event_dedupes() {
    let store = InMemoryHistoryStore::default();
    store.create_instance("i1").await.unwrap();
    let started = Event::OrchestrationStarted {
        name: "Flow".into(),
        input: "first".into(),
        at_ms: 1,
    };
    store.append("i1", vec![started]).await.unwrap();
    store
        .append(
            "i1",
            vec![Event::OrchestrationStarted {
                name: "Flow".into(),
                input: "second".into(),
                at_ms: 2,
            }],
        )
        .await
        .unwrap();

    let hist = store.read("i1").await;
    assert_eq!(hist.len(), 1);
    assert!(matches!(&hist[0], Event::OrchestrationStarted { input, .. } if input == "first"));
}

#[tokio::test]
async fn in_memory_reset_clears_queues_and_locks() {
    let store = InMemoryHistoryStore::default();
    store.create_instance("i1").await.unwrap();
    let item = WorkItem::ActivityExecute {
        instance: "i1".into(),
        id: 1,
        name: "A".into(),
        input: "x".into(),
    };
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();
    store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::TerminateInstance {
                instance: "i1".into(),
                reason: "r".into(),
            },
        )
        .await
        .unwrap();
    let (_locked, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();

    store.reset().await;

    assert!(store.list_instances().await.is_empty());
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());
    // Abandoning a pre-reset token must not resurrect the item
    store.abandon(QueueKind::Orchestrator, &token).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

#[tokio::test]
async fn fs_store_roundtrip_and_listing() {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(td.path(), true);
    store.create_instance("wf-1").await.unwrap();
    store
        .append(
            "wf-1",
            vec![Event::OrchestrationStarted {
                name: "Flow".into(),
                input: "in".into(),
                at_ms: 42,
            }],
        )
        .await
        .unwrap();

    let hist = store.read("wf-1").await;
    assert_eq!(hist.len(), 1);
    assert!(matches!(&hist[0], Event::OrchestrationStarted { name, .. } if name == "Flow"));
    assert_eq!(store.list_instances().await, vec!["wf-1".to_string()]);

    store.remove_instance("wf-1").await.unwrap();
    assert!(store.read("wf-1").await.is_empty());
}

#[tokio::test]
async fn fs_store_capacity_guard() {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new_with_cap(td.path(), true, 2);
    store.create_instance("wf-cap").await.unwrap();
    store
        .append(
            "wf-cap",
            vec![Event::OrchestrationStarted {
                name: "Flow".into(),
                input: String::new(),
                at_ms: 0,
            }],
        )
        .await
        .unwrap();
    let err = store
        .append(
            "wf-cap",
            vec![
                Event::ActivityScheduled {
                    id: 1,
                    name: "A".into(),
                    input: String::new(),
                },
                Event::ActivityScheduled {
                    id: 2,
                    name: "B".into(),
                    input: String::new(),
                },
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::CapacityExceeded {
            cap: 2,
            have: 1,
            append: 2
        }
    ));
}

#[tokio::test]
async fn queue_peek_lock_ack_and_abandon() {
    let store = InMemoryHistoryStore::default();
    let item = WorkItem::ActivityExecute {
        instance: "wf-1".into(),
        id: 1,
        name: "A".into(),
        input: "x".into(),
    };
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();
    // Duplicate enqueue of an identical item is a no-op
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();

    let (got, token) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(got, item);
    // Locked item is invisible to other consumers
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());

    // Abandon returns it to the front
    store.abandon(QueueKind::Worker, &token).await.unwrap();
    let (again, token2) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(again, item);

    // Ack removes it for good
    store.ack(QueueKind::Worker, &token2).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());
}
