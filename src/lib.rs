//! Minimal replay-deterministic orchestration core for fan-out/fan-in workflows.
//!
//! This crate exposes a replay-driven programming model that records
//! append-only `Event`s and replays them to make orchestration logic
//! deterministic. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn`, `run_turn_with_claims`, and `Executor`
//! - An `OrchestrationContext` with futures to schedule activities using
//!   correlation IDs, and `join` to fan-in a batch of them
//! - A `Runtime` that persists history via a `HistoryStore` and executes
//!   activities on a worker pool

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use crate::futures::{ActivityFuture, JoinFuture};
pub use logging::LogLevel;
pub use runtime::{
    InstanceSnapshot, InstanceStatus, OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder,
};

use crate::_typed_codec::Codec;
use serde::{Deserialize, Serialize};

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // If the value is a JSON string, return raw content to preserve historic behavior
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            // Try parse as JSON first
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat raw string as JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Variants use stable correlation IDs to pair
/// scheduling operations with their completions.
///
/// `at_ms` timestamps are written by the runtime at append time and are never
/// read during replay; they back the instance snapshot's created/completed
/// times only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Orchestration instance was created and started by name with input.
    OrchestrationStarted { name: String, input: String, at_ms: u64 },
    /// Activity was scheduled with a unique correlation ID and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string.
    ActivityFailed { id: u64, error: String },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String, at_ms: u64 },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String, at_ms: u64 },
    /// Orchestration was terminated by operator request before finishing.
    OrchestrationTerminated { reason: String, at_ms: u64 },
}

impl Event {
    /// True for events that end the instance: no further history may follow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The runtime is
/// responsible for materializing these into dispatched work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,

    pub(crate) next_correlation_id: u64,

    // Logging and turn metadata
    turn_index: u64,
    // Per-turn buffered logs (messages to flush once per progress turn)
    log_buffer: Vec<(LogLevel, String)>,

    // Scheduling events claimed by futures during this poll, in history order.
    pub(crate) claimed_activity_ids: std::collections::HashSet<u64>,
    // First determinism violation observed this poll; fatal for the instance.
    pub(crate) nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        // Compute next correlation id based on max id found in history
        let mut max_id = 0u64;
        for ev in &history {
            if let Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. } = ev
            {
                max_id = max_id.max(*id);
            }
        }
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            log_buffer: Vec::new(),
            claimed_activity_ids: Default::default(),
            nondeterminism: None,
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    /// Drain the buffered log messages accumulated during the last turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.inner.lock().unwrap().log_buffer)
    }
    /// Buffer a structured log message for the current turn. The runtime
    /// flushes the buffer only on progress turns.
    pub fn push_log(&self, level: LogLevel, msg: String) {
        self.inner.lock().unwrap().log_buffer.push((level, msg));
    }

    /// Convenience wrapper buffering an INFO message.
    pub fn trace_info(&self, message: impl Into<String>) {
        self.push_log(LogLevel::Info, message.into());
    }
    /// Convenience wrapper buffering a WARN message.
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.push_log(LogLevel::Warn, message.into());
    }
    /// Convenience wrapper buffering an ERROR message.
    pub fn trace_error(&self, message: impl Into<String>) {
        self.push_log(LogLevel::Error, message.into());
    }
    /// Convenience wrapper buffering a DEBUG message.
    pub fn trace_debug(&self, message: impl Into<String>) {
        self.push_log(LogLevel::Debug, message.into());
    }

    /// Schedule an activity and return an `ActivityFuture` correlated to it.
    ///
    /// Scheduling is lazy: the activity claims its position in history on the
    /// first poll, so a batch of calls made before the first `.await` fans out
    /// as one turn.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        ActivityFuture::new(self.clone(), name.into(), input.into())
    }

    /// Typed helper that serializes input; pair with `ActivityFuture::into_typed`.
    pub fn schedule_activity_typed<In: serde::Serialize>(&self, name: impl Into<String>, input: &In) -> ActivityFuture {
        let payload = crate::_typed_codec::Json::encode(input).expect("encode");
        self.schedule_activity(name, payload)
    }

    /// Fan-in over N activity futures. Resolves once every child has a
    /// terminal outcome and yields results in submission order, never
    /// short-circuiting on the first failure.
    pub fn join(&self, futures: Vec<ActivityFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    let mut pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.as_mut().poll(&mut cx)
}

/// Tuple returned by `run_turn` containing the updated history, actions to
/// execute, per-turn logs, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Poll the orchestrator once with the provided history, producing
/// updated history, requested `Action`s, buffered logs, and an optional output.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let (hist, actions, logs, out, _claims) = run_turn_with_claims(history, 0, orchestrator);
    (hist, actions, logs, out)
}

/// Snapshot of correlation IDs claimed by the orchestrator during a single
/// poll turn, plus any determinism violation detected while claiming.
#[derive(Debug, Clone, Default)]
pub struct TurnClaims {
    pub activities: std::collections::HashSet<u64>,
    pub nondeterminism: Option<String>,
}

impl OrchestrationContext {
    pub(crate) fn claims_snapshot(&self) -> TurnClaims {
        let inner = self.inner.lock().unwrap();
        TurnClaims {
            activities: inner.claimed_activity_ids.clone(),
            nondeterminism: inner.nondeterminism.clone(),
        }
    }
}

/// Same as `run_turn` but threads a caller-supplied turn index for diagnostics
/// and also returns which correlation IDs were claimed during the poll.
pub fn run_turn_with_claims<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>, TurnClaims)
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let mut fut = orchestrator(ctx.clone());
    match poll_once(&mut fut) {
        Poll::Ready(out) => {
            let logs = ctx.take_log_buffer();
            let actions = ctx.take_actions();
            let hist_after = ctx.inner.lock().unwrap().history.clone();
            let claims = ctx.claims_snapshot();
            (hist_after, actions, logs, Some(out), claims)
        }
        Poll::Pending => {
            let actions = ctx.take_actions();
            let hist_after = ctx.inner.lock().unwrap().history.clone();
            let logs = ctx.take_log_buffer();
            let claims = ctx.claims_snapshot();
            (hist_after, actions, logs, None, claims)
        }
    }
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let (hist_after_replay, actions, _logs, output) = run_turn(history, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
        }
    }
}
