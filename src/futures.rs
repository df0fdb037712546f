use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

/// Terminal outcome of a single scheduled activity.
pub type ActivityOutcome = Result<String, String>;

/// A pending activity call correlated to an `ActivityScheduled` history event.
///
/// Each future claims the next unclaimed scheduling event in history order on
/// its first poll. If the recorded event's name or input differ from this
/// call's, the recorded code path has diverged from the running code and the
/// poll flags a determinism violation instead of resolving. If no recorded
/// event remains, the call is new: a fresh correlation id is allocated, the
/// scheduling event is appended, and a `CallActivity` action is recorded for
/// the runtime to dispatch.
pub struct ActivityFuture {
    name: String,
    input: String,
    claimed_id: Cell<Option<u64>>,
    ctx: OrchestrationContext,
}

impl ActivityFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self {
            name,
            input,
            claimed_id: Cell::new(None),
            ctx,
        }
    }

    /// Await the result decoded to a typed value.
    pub async fn into_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        use crate::_typed_codec::Codec;
        let s = self.await?;
        crate::_typed_codec::Json::decode::<Out>(&s)
    }
}

impl Future for ActivityFuture {
    type Output = ActivityOutcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();

        // Once a violation is flagged the turn is doomed; stop making claims.
        if inner.nondeterminism.is_some() {
            return Poll::Pending;
        }

        // Step 1: claim the next unclaimed scheduling event, or record a new one.
        if this.claimed_id.get().is_none() {
            let mut found: Option<(u64, String, String)> = None;
            for event in &inner.history {
                if let Event::ActivityScheduled { id, name, input } = event {
                    if !inner.claimed_activity_ids.contains(id) {
                        found = Some((*id, name.clone(), input.clone()));
                        break;
                    }
                }
            }
            let id = match found {
                Some((id, ref n, ref inp)) if n == &this.name && inp == &this.input => id,
                Some((_, n, inp)) => {
                    inner.nondeterminism = Some(format!(
                        "schedule order mismatch: history has ActivityScheduled('{n}','{inp}') but code called schedule_activity('{}','{}')",
                        this.name, this.input
                    ));
                    return Poll::Pending;
                }
                None => {
                    // Not in history: first execution of this call
                    let new_id = inner.next_id();
                    inner.history.push(Event::ActivityScheduled {
                        id: new_id,
                        name: this.name.clone(),
                        input: this.input.clone(),
                    });
                    inner.record_action(Action::CallActivity {
                        id: new_id,
                        name: this.name.clone(),
                        input: this.input.clone(),
                    });
                    new_id
                }
            };
            inner.claimed_activity_ids.insert(id);
            this.claimed_id.set(Some(id));
        }

        let our_id = this.claimed_id.get().unwrap();

        // Step 2: bind the result from history by correlation id.
        for event in &inner.history {
            match event {
                Event::ActivityCompleted { id, result } if *id == our_id => {
                    return Poll::Ready(Ok(result.clone()));
                }
                Event::ActivityFailed { id, error } if *id == our_id => {
                    return Poll::Ready(Err(error.clone()));
                }
                _ => {}
            }
        }
        Poll::Pending
    }
}

/// Fan-in over a batch of activity futures.
///
/// Polls every child on each poll so that all scheduling claims happen in
/// submission order before the turn suspends. Resolves only when every child
/// has a terminal outcome, yielding one `Result` per child in submission
/// order; a failed child never short-circuits its siblings.
pub struct JoinFuture {
    children: Vec<ActivityFuture>,
    results: Vec<Option<ActivityOutcome>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<ActivityFuture>) -> Self {
        let results = (0..children.len()).map(|_| None).collect();
        Self { children, results }
    }
}

impl Future for JoinFuture {
    type Output = Vec<ActivityOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;
        for (idx, child) in this.children.iter_mut().enumerate() {
            if this.results[idx].is_some() {
                continue;
            }
            match Pin::new(child).poll(cx) {
                Poll::Ready(out) => this.results[idx] = Some(out),
                Poll::Pending => all_done = false,
            }
        }
        if all_done {
            Poll::Ready(this.results.iter_mut().map(|r| r.take().unwrap()).collect())
        } else {
            Poll::Pending
        }
    }
}
