use crate::_typed_codec::{Codec, Json};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, StoreError, WorkItem};
use crate::{Event, LogLevel, OrchestrationContext};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod detect;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;

pub use registry::{ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use router::{InstanceRouter, OrchestratorMsg};
pub use status::{InstanceSnapshot, InstanceStatus};

/// Wall-clock milliseconds used for runtime-stamped history timestamps.
/// Never consulted during replay.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Errors from starting a new orchestration instance.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("orchestration not registered: {0}")]
    Unregistered(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from requesting termination of an instance.
#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance already terminal: {0}")]
    InstanceTerminal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Tunables for runtime behavior.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on a single activity execution; elapsed executions are
    /// recorded as `ActivityFailed` with a timeout error. No retries.
    pub activity_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_secs(30),
        }
    }
}

/// In-process runtime that drives orchestration instances, executes
/// activities on a worker pool, and persists history via a `HistoryStore`.
pub struct Runtime {
    router_tx: mpsc::UnboundedSender<OrchestratorMsg>,
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) history_store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<(Vec<Event>, Result<String, String>)>>>>,
    orchestration_registry: OrchestrationRegistry,
    options: RuntimeOptions,
}

fn terminal_outcome(history: &[Event]) -> Option<Result<String, String>> {
    history.iter().rev().find_map(|e| match e {
        Event::OrchestrationCompleted { output, .. } => Some(Ok(output.clone())),
        Event::OrchestrationFailed { error, .. } => Some(Err(error.clone())),
        Event::OrchestrationTerminated { reason, .. } => Some(Err(format!("terminated: {reason}"))),
        _ => None,
    })
}

impl Runtime {
    // Associated constants for runtime behavior
    const COMPLETION_BATCH_LIMIT: usize = 128;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const ORCH_IDLE_DEHYDRATE_MS: u64 = 1000;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(activity_registry: Arc<ActivityRegistry>, orchestration_registry: OrchestrationRegistry) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(history_store, activity_registry, orchestration_registry, RuntimeOptions::default()).await
    }

    /// Start a new runtime with explicit options.
    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let (router_tx, mut router_rx) = mpsc::unbounded_channel::<OrchestratorMsg>();
        let router = Arc::new(InstanceRouter {
            inboxes: Mutex::new(HashMap::new()),
        });
        let mut joins: Vec<JoinHandle<()>> = Vec::new();

        // spawn router forwarding task
        let router_clone = router.clone();
        joins.push(tokio::spawn(async move {
            while let Some(msg) = router_rx.recv().await {
                router_clone.forward(msg).await;
            }
        }));

        let runtime = Arc::new(Self {
            router_tx,
            router,
            joins: Mutex::new(joins),
            instance_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            options,
        });

        // background orchestrator dispatcher
        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        // background work dispatcher (executes activities)
        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(work_handle);

        runtime
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    match item {
                        WorkItem::StartOrchestration {
                            instance,
                            orchestration,
                            input,
                        } => {
                            debug!(instance = %instance, orchestration = %orchestration, "StartOrchestration");
                            if let Err(e) = self.clone().start_orchestration(&instance, &orchestration, input).await {
                                warn!(instance = %instance, error = %e, "queued start rejected");
                            }
                            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        }
                        WorkItem::ActivityCompleted { instance, id, result } => {
                            debug!(instance = %instance, id, "ActivityCompleted");
                            self.orchestrator_deliver_or_rehydrate(&instance, token, {
                                let instance_c = instance.clone();
                                move |t| OrchestratorMsg::ActivityCompleted {
                                    instance: instance_c,
                                    id,
                                    result,
                                    ack_token: Some(t),
                                }
                            })
                            .await;
                        }
                        WorkItem::ActivityFailed { instance, id, error } => {
                            debug!(instance = %instance, id, error = %error, "ActivityFailed");
                            self.orchestrator_deliver_or_rehydrate(&instance, token, {
                                let instance_c = instance.clone();
                                move |t| OrchestratorMsg::ActivityFailed {
                                    instance: instance_c,
                                    id,
                                    error,
                                    ack_token: Some(t),
                                }
                            })
                            .await;
                        }
                        WorkItem::TerminateInstance { instance, reason } => {
                            debug!(instance = %instance, reason = %reason, "TerminateInstance");
                            self.orchestrator_deliver_or_rehydrate(&instance, token, {
                                let instance_c = instance.clone();
                                move |t| OrchestratorMsg::TerminateRequested {
                                    instance: instance_c,
                                    reason,
                                    ack_token: Some(t),
                                }
                            })
                            .await;
                        }
                        // No ActivityExecute should land on the Orchestrator queue
                        other => {
                            error!(?other, "unexpected WorkItem in Orchestrator dispatcher; state corruption");
                            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                }
            }
        })
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await {
                    match item {
                        WorkItem::ActivityExecute {
                            instance,
                            id,
                            name,
                            input,
                        } => {
                            // One task per work unit so independent activities run in parallel
                            let rt = self.clone();
                            let acts = activities.clone();
                            tokio::spawn(async move {
                                rt.execute_activity(acts, instance, id, name, input, token).await;
                            });
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in Worker dispatcher; state corruption");
                            let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                }
            }
        })
    }

    /// Execute one activity under the configured timeout and enqueue its
    /// outcome to the orchestrator queue. The worker item is acked only after
    /// the outcome is enqueued; a crash in between causes redelivery, which
    /// the idempotent history append absorbs.
    async fn execute_activity(
        self: Arc<Self>,
        activities: Arc<ActivityRegistry>,
        instance: String,
        id: u64,
        name: String,
        input: String,
        token: String,
    ) {
        let outcome: Result<String, String> = match activities.get(&name) {
            Some(handler) => match tokio::time::timeout(self.options.activity_timeout, handler.invoke(input)).await {
                Ok(res) => res,
                Err(_) => Err(format!(
                    "timeout: activity '{name}' exceeded {}ms",
                    self.options.activity_timeout.as_millis()
                )),
            },
            None => Err(format!("unregistered:{name}")),
        };
        let wi = match outcome {
            Ok(result) => WorkItem::ActivityCompleted {
                instance: instance.clone(),
                id,
                result,
            },
            Err(error) => WorkItem::ActivityFailed {
                instance: instance.clone(),
                id,
                error,
            },
        };
        // Outcome first, ack second: losing the outcome would hang the
        // instance, so on enqueue failure the worker item is abandoned and
        // the whole execution redelivered.
        if let Err(e) = dispatch::enqueue_with_retry(&self.history_store, QueueKind::Orchestrator, wi).await {
            error!(instance = %instance, id, error = %e, "failed to enqueue activity outcome; abandoning for redelivery");
            let _ = self.history_store.abandon(QueueKind::Worker, &token).await;
            return;
        }
        let _ = self.history_store.ack(QueueKind::Worker, &token).await;
    }

    /// Common handler for orchestrator-queue items that target a specific
    /// instance: forwards to the in-proc router with the ack token, or
    /// rehydrates a dehydrated instance and abandons for redelivery.
    async fn orchestrator_deliver_or_rehydrate<F>(self: &Arc<Self>, instance: &str, token: String, build_msg: F)
    where
        F: FnOnce(String) -> OrchestratorMsg,
    {
        let inbox_registered = self.router.inboxes.lock().await.contains_key(instance);
        if !inbox_registered {
            let hist = self.history_store.read(instance).await;
            // Late messages for a finished instance are acked and dropped,
            // never rehydrated; abandoning them would redeliver forever.
            if hist.iter().any(Event::is_terminal) {
                debug!(instance, "dropping message for terminal instance");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
            let orch_name_opt = hist.iter().find_map(|e| match e {
                Event::OrchestrationStarted { name, .. } => Some(name.clone()),
                _ => None,
            });
            let orch_name = match orch_name_opt {
                Some(n) => n,
                None => {
                    warn!(instance, "dropping message for instance with no start event");
                    let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                    return;
                }
            };
            self.ensure_instance_active(instance, &orch_name).await;
            let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
            tokio::time::sleep(Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
            return;
        }

        // Active: forward with ack token
        let msg = build_msg(token);
        let _ = self.router_tx.send(msg);
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str, orchestration_name: &str) -> bool {
        if self.active_instances.lock().await.contains(instance) {
            return false;
        }
        let inner = self.clone().spawn_instance_to_completion(instance, orchestration_name);
        // Wrap to normalize handle type to JoinHandle<()>
        let wrapper = tokio::spawn(async move {
            let _ = inner.await;
        });
        self.instance_joins.lock().await.push(wrapper);
        true
    }

    async fn start_internal_rx(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
    ) -> Result<oneshot::Receiver<(Vec<Event>, Result<String, String>)>, StartError> {
        if self.orchestration_registry.get(orchestration_name).is_none() {
            return Err(StartError::Unregistered(orchestration_name.to_string()));
        }
        // Ensure instance exists; an existing instance means a duplicate start
        match self.history_store.create_instance(instance).await {
            Ok(()) | Err(StoreError::InstanceExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        // Append start marker if empty
        let hist = self.history_store.read(instance).await;
        if hist.is_empty() {
            self.history_store
                .append(
                    instance,
                    vec![Event::OrchestrationStarted {
                        name: orchestration_name.to_string(),
                        input,
                        at_ms: now_ms(),
                    }],
                )
                .await?;
        } else {
            // At-least-once start delivery: duplicate starts are deduped here
            warn!(instance, "instance already has history; duplicate start accepted (deduped)");
        }
        self.ensure_instance_active(instance, orchestration_name).await;
        // Register a oneshot waiter for the final result
        let (tx, rx) = oneshot::channel::<(Vec<Event>, Result<String, String>)>();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    /// Start an orchestration on an explicit instance id, returning a handle
    /// that resolves to the final history and output.
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<(Vec<Event>, Result<String, String>)>, StartError> {
        let rx = self
            .clone()
            .start_internal_rx(instance, orchestration_name, input.into())
            .await?;
        Ok(tokio::spawn(async move { rx.await.expect("result") }))
    }

    /// Start a typed orchestration; input/output are serialized internally.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, StartError>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(StoreError::Unavailable)?;
        let rx = self.clone().start_internal_rx(instance, orchestration_name, payload).await?;
        Ok(tokio::spawn(async move {
            let (hist, res_s) = rx.await.expect("result");
            let res_t: Result<Out, String> = match res_s {
                Ok(s) => Json::decode::<Out>(&s),
                Err(e) => Err(e),
            };
            (hist, res_t)
        }))
    }

    /// Start an orchestration on a freshly allocated instance id and return
    /// the id. The instance runs in the background; poll with `get_instance`
    /// or `wait_for_orchestration`.
    pub async fn start_new(self: &Arc<Self>, orchestration_name: &str, input: impl Into<String>) -> Result<String, StartError> {
        let instance = format!("wf-{}", uuid::Uuid::new_v4());
        let _handle = self.clone().start_orchestration(&instance, orchestration_name, input).await?;
        info!(instance = %instance, orchestration = orchestration_name, "started new instance");
        Ok(instance)
    }

    /// Request termination of a running instance. Refuses if the instance is
    /// already terminal; otherwise the orchestrator loop appends
    /// `OrchestrationTerminated` before resuming the routine, so no further
    /// work is scheduled.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), TerminateError> {
        let snap = self
            .get_instance(instance)
            .await
            .ok_or_else(|| TerminateError::NotFound(instance.to_string()))?;
        if snap.status.is_terminal() {
            return Err(TerminateError::InstanceTerminal(instance.to_string()));
        }
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await?;
        Ok(())
    }

    /// Internal: apply pure decisions by dispatching work to the worker queue.
    async fn apply_decisions(
        self: &Arc<Self>,
        instance: &str,
        history: &[Event],
        decisions: Vec<replay::Decision>,
    ) -> Result<(), StoreError> {
        debug!(instance, ?decisions, "apply_decisions");
        for d in decisions {
            match d {
                replay::Decision::CallActivity { id, name, input } => {
                    dispatch::dispatch_call_activity(self, instance, history, id, name, input).await?;
                }
            }
        }
        Ok(())
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], out: &Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), out.clone()));
            }
        }
    }

    /// Append a terminal failure, reflect it locally, and wake waiters.
    async fn fail_instance(&self, instance: &str, history: &mut Vec<Event>, err: String) {
        let term = Event::OrchestrationFailed {
            error: err.clone(),
            at_ms: now_ms(),
        };
        if let Err(e) = self.history_store.append(instance, vec![term.clone()]).await {
            error!(instance, error=%e, "failed to append OrchestrationFailed");
        }
        history.push(term);
        self.notify_waiters(instance, history, &Err(err)).await;
        self.router.unregister(instance).await;
    }

    fn flush_logs(&self, instance: &str, turn_index: u64, progressed: bool, logs: Vec<(LogLevel, String)>) {
        // Pure replay turns stay silent; only progress turns flush the buffer
        if !progressed {
            return;
        }
        for (lvl, msg) in logs {
            match lvl {
                LogLevel::Debug => debug!(instance, turn_index, "{msg}"),
                LogLevel::Info => info!(instance, turn_index, "{msg}"),
                LogLevel::Warn => warn!(instance, turn_index, "{msg}"),
                LogLevel::Error => error!(instance, turn_index, "{msg}"),
            }
        }
    }

    /// Run a single instance to completion by orchestration name, returning
    /// its final history and output.
    pub async fn run_instance_to_completion(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
    ) -> (Vec<Event>, Result<String, String>) {
        // Ensure instance not already active in this runtime
        {
            let mut act = self.active_instances.lock().await;
            if !act.insert(instance.to_string()) {
                return (Vec::new(), Err("already_active".into()));
            }
        }
        // Ensure removal of active flag even if the task panics
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                let rt = self.rt.clone();
                let inst = self.inst.clone();
                // Drop can't be async; spawn the removal
                let _ = tokio::spawn(async move {
                    rt.active_instances.lock().await.remove(&inst);
                });
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };

        let mut history: Vec<Event> = self.history_store.read(instance).await;

        // Crash window between terminal append and waiter notification
        if let Some(out) = terminal_outcome(&history) {
            self.notify_waiters(instance, &history, &out).await;
            return (history, out);
        }

        let mut comp_rx = self.router.register(instance).await;

        // Re-dispatch scheduled-but-unresolved activities from history
        completions::rehydrate_pending(instance, &history, &self.history_store).await;

        let current_input: String = history
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::OrchestrationStarted { input, .. } => Some(input.clone()),
                _ => None,
            })
            .unwrap_or_default();

        // If orchestration not registered, fail gracefully and exit
        let orchestration_handler = match self.orchestration_registry.get(orchestration_name) {
            Some(h) => h,
            None => {
                let err = format!("unregistered:{orchestration_name}");
                self.fail_instance(instance, &mut history, err.clone()).await;
                return (history, Err(err));
            }
        };

        let mut turn_index: u64 = 0;
        // Completions appended in the previous iteration, validated against
        // the ids the current code actually awaits
        let mut last_appended: Vec<u64> = Vec::new();
        loop {
            let baseline_len = history.len();
            use replay::ReplayEngine as _;
            let engine = replay::DefaultReplayEngine::new();
            let (hist_after, decisions, logs, out_opt, mut claims) = engine.replay(
                history,
                turn_index,
                orchestration_handler.clone(),
                current_input.clone(),
            );
            self.flush_logs(instance, turn_index, !decisions.is_empty() || out_opt.is_some(), logs);

            // A claim-time mismatch against recorded history is fatal and
            // non-retryable; only the terminal failure is persisted, never
            // the diverging schedules.
            if let Some(detail) = claims.nondeterminism.take() {
                let err = format!("orchestration corrupt: {detail}");
                history = hist_after;
                self.fail_instance(instance, &mut history, err.clone()).await;
                return (history, Err(err));
            }
            if let Some(detail) =
                detect::detect_frontier_nondeterminism(&hist_after[..baseline_len], &hist_after[baseline_len..], &claims)
            {
                let err = format!("orchestration corrupt: {detail}");
                history = hist_after;
                self.fail_instance(instance, &mut history, err.clone()).await;
                return (history, Err(err));
            }
            history = hist_after;
            if !last_appended.is_empty() {
                if let Some(detail) = detect::detect_await_mismatch(&last_appended, &claims) {
                    let err = format!("orchestration corrupt: {detail}");
                    self.fail_instance(instance, &mut history, err.clone()).await;
                    return (history, Err(err));
                }
                last_appended.clear();
            }

            if let Some(out) = out_opt {
                // Persist any deltas produced during this final turn
                if history.len() > baseline_len {
                    let deltas = history[baseline_len..].to_vec();
                    if let Err(e) = self.history_store.append(instance, deltas).await {
                        warn!(instance, turn_index, error=%e, "failed to append final turn events; aborting pass");
                        let err = format!("history append failed: {e}");
                        self.notify_waiters(instance, &history, &Err(err.clone())).await;
                        self.router.unregister(instance).await;
                        return (history, Err(err));
                    }
                }
                // Persist terminal event based on result
                let term = match &out {
                    Ok(s) => Event::OrchestrationCompleted {
                        output: s.clone(),
                        at_ms: now_ms(),
                    },
                    Err(e) => Event::OrchestrationFailed {
                        error: e.clone(),
                        at_ms: now_ms(),
                    },
                };
                if let Err(e) = self.history_store.append(instance, vec![term.clone()]).await {
                    warn!(instance, turn_index, error=%e, "failed to append terminal event; aborting pass");
                    let err = format!("history append failed: {e}");
                    self.notify_waiters(instance, &history, &Err(err.clone())).await;
                    self.router.unregister(instance).await;
                    return (history, Err(err));
                }
                history.push(term);
                self.notify_waiters(instance, &history, &out).await;
                self.router.unregister(instance).await;
                return (history, out);
            }

            // Persist deltas incrementally to avoid duplicates
            let mut persisted_len = baseline_len;
            let mut appended_any = false;
            if history.len() > persisted_len {
                let new_events = history[persisted_len..].to_vec();
                if let Err(e) = self.history_store.append(instance, new_events).await {
                    warn!(instance, turn_index, error=%e, "failed to append scheduled events; aborting pass");
                    let err = format!("history append failed: {e}");
                    self.notify_waiters(instance, &history, &Err(err.clone())).await;
                    self.router.unregister(instance).await;
                    return (history, Err(err));
                }
                appended_any = true;
                persisted_len = history.len();
            }

            if let Err(e) = self.apply_decisions(instance, &history, decisions).await {
                warn!(instance, turn_index, error=%e, "failed to dispatch work; aborting pass");
                let err = format!("work dispatch failed: {e}");
                self.notify_waiters(instance, &history, &Err(err.clone())).await;
                self.router.unregister(instance).await;
                return (history, Err(err));
            }

            // Receive at least one completion, or dehydrate on idle timeout
            let len_before_completions = history.len();
            let first_opt = tokio::time::timeout(Duration::from_millis(Self::ORCH_IDLE_DEHYDRATE_MS), comp_rx.recv()).await;
            let first = match first_opt {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    self.router.unregister(instance).await;
                    return (history, Ok(String::new()));
                }
                Err(_timeout) => {
                    // Dehydrate only if no outstanding result waiters
                    let has_waiters = self.result_waiters.lock().await.contains_key(instance);
                    if has_waiters {
                        tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                        continue;
                    } else {
                        self.router.unregister(instance).await;
                        return (history, Ok(String::new()));
                    }
                }
            };
            let mut ack_tokens_persist_after: Vec<String> = Vec::new();
            let mut ack_tokens_immediate: Vec<String> = Vec::new();
            if let (Some(t), changed) = completions::append_completion(&mut history, first) {
                if changed {
                    ack_tokens_persist_after.push(t);
                } else {
                    ack_tokens_immediate.push(t);
                }
            }
            for _ in 0..Self::COMPLETION_BATCH_LIMIT {
                match comp_rx.try_recv() {
                    Ok(msg) => {
                        if let (Some(t), changed) = completions::append_completion(&mut history, msg) {
                            if changed {
                                ack_tokens_persist_after.push(t);
                            } else {
                                ack_tokens_immediate.push(t);
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            // Ack immediately for messages that resulted in no history change (duplicates)
            for t in ack_tokens_immediate.drain(..) {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }

            // Persist events appended during completion handling, then ack
            if history.len() > persisted_len {
                let new_events = history[persisted_len..].to_vec();
                if let Err(e) = self.history_store.append(instance, new_events).await {
                    warn!(instance, turn_index, error=%e, "failed to append completions; aborting pass");
                    let err = format!("history append failed: {e}");
                    self.notify_waiters(instance, &history, &Err(err.clone())).await;
                    self.router.unregister(instance).await;
                    return (history, Err(err));
                }
                appended_any = true;
            }
            for t in ack_tokens_persist_after.drain(..) {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }

            // Record which completions were appended in this iteration to validate on the next turn
            detect::collect_last_appended(&history, len_before_completions, &mut last_appended);
            if !last_appended.is_empty() {
                if let Some(detail) =
                    detect::detect_unmatched_completion(&history[..len_before_completions], &last_appended)
                {
                    let err = format!("orchestration corrupt: {detail}");
                    self.fail_instance(instance, &mut history, err.clone()).await;
                    return (history, Err(err));
                }
            }

            // Termination is checked before the routine resumes: a terminate
            // appended in this batch ends the instance without another turn.
            if let Some(reason) = history[len_before_completions..].iter().find_map(|e| match e {
                Event::OrchestrationTerminated { reason, .. } => Some(reason.clone()),
                _ => None,
            }) {
                info!(instance, reason = %reason, "instance terminated");
                let out = Err(format!("terminated: {reason}"));
                self.notify_waiters(instance, &history, &out).await;
                self.router.unregister(instance).await;
                return (history, out);
            }

            if appended_any {
                turn_index = turn_index.saturating_add(1);
            }
        }
    }

    /// Spawn an instance and return a handle that resolves to its history
    /// and output when complete.
    pub fn spawn_instance_to_completion(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
    ) -> JoinHandle<(Vec<Event>, Result<String, String>)> {
        let this_for_task = self.clone();
        let inst = instance.to_string();
        let orch_name = orchestration_name.to_string();
        tokio::spawn(async move { this_for_task.run_instance_to_completion(&inst, &orch_name).await })
    }

    /// Wait until the orchestration reaches a terminal state
    /// (Completed/Failed/Terminated) or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<InstanceStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        // quick path
        let st = self.get_orchestration_status(instance).await;
        if st.is_terminal() {
            return Ok(st);
        }
        // poll with backoff
        let mut delay_ms: u64 = 5;
        while std::time::Instant::now() < deadline {
            let st = self.get_orchestration_status(instance).await;
            if st.is_terminal() {
                return Ok(st);
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(100);
        }
        Err(WaitError::Timeout)
    }

    /// Typed variant: returns Ok(Ok<T>) on Completed with decoded output,
    /// Ok(Err(String)) on Failed or Terminated.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            InstanceStatus::Completed { output } => match Json::decode::<Out>(&output) {
                Ok(v) => Ok(Ok(v)),
                Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
            },
            InstanceStatus::Failed { error } => Ok(Err(error)),
            InstanceStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            _ => unreachable!("wait_for_orchestration returns only terminal or timeout"),
        }
    }

    /// Abort background tasks. Channels are dropped with the runtime.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    /// Await completion of all outstanding spawned orchestration instances.
    pub async fn drain_instances(self: Arc<Self>) {
        let mut joins = self.instance_joins.lock().await;
        while let Some(j) = joins.pop() {
            let _ = j.await;
        }
    }
}
