//! Chaining and joining pending results
//!
//! These sit on top of the single-callback contract of `PendingResult`: they
//! use internal completion hooks, so the user callback slot of the inputs
//! stays free.

use crate::dispatcher::{panic_message, ExecutionContext};
use crate::pending::PendingResult;
use crate::status::{Status, StatusCode};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

/// Run a user closure, turning a panic into an `INTERNAL` status
fn guarded<R>(what: &str, f: impl FnOnce() -> R) -> Result<R, Status> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        let reason = panic_message(panic.as_ref());
        error!("{} panicked: {}", what, reason);
        Status::internal(format!("{} panicked: {}", what, reason))
    })
}

impl<T> PendingResult<T>
where
    T: Clone + Send + 'static,
{
    /// Transform a successful value; failures and cancellation pass through
    ///
    /// # Example
    /// ```
    /// use conduit_core_pending::PendingResult;
    ///
    /// let raw = PendingResult::<Vec<u8>>::new();
    /// let len = raw.map(|bytes| bytes.len());
    /// raw.set_result(vec![1, 2, 3]).unwrap();
    /// assert_eq!(len.wait(), Ok(3));
    /// ```
    pub fn map<U, F>(&self, f: F) -> PendingResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mapped = PendingResult::new();
        let target = mapped.clone();
        self.observe(move |outcome| match outcome {
            Some(Ok(value)) => {
                let value = value.clone();
                let _ = target.complete(guarded("map", move || f(value)));
            }
            Some(Err(status)) => {
                let _ = target.set_failure(status.clone());
            }
            None => {
                target.cancel();
            }
        });
        mapped
    }

    /// Chain a follow-up operation that itself returns a pending result
    pub fn and_then<U, F>(&self, f: F) -> PendingResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> PendingResult<U> + Send + 'static,
    {
        let chained = PendingResult::new();
        let target = chained.clone();
        self.observe(move |outcome| match outcome {
            Some(Ok(value)) => {
                let value = value.clone();
                let next = match guarded("and_then", move || f(value)) {
                    Ok(next) => next,
                    Err(status) => {
                        let _ = target.set_failure(status);
                        return;
                    }
                };
                next.observe(move |inner| match inner {
                    Some(result) => {
                        let _ = target.complete(result.clone());
                    }
                    None => {
                        target.cancel();
                    }
                });
            }
            Some(Err(status)) => {
                let _ = target.set_failure(status.clone());
            }
            None => {
                target.cancel();
            }
        });
        chained
    }

    /// Run `f` on `context` and resolve with what it returns
    ///
    /// A panic resolves the result with `INTERNAL`. If the context no longer
    /// accepts work, the result fails with the dispatch error's status.
    ///
    /// # Example
    /// ```
    /// use conduit_core_pending::{ExecutionContext, PendingResult};
    ///
    /// let sum = PendingResult::spawn_on(ExecutionContext::Immediate, || Ok(2 + 2));
    /// assert_eq!(sum.wait(), Ok(4));
    /// ```
    pub fn spawn_on<F>(context: ExecutionContext, f: F) -> PendingResult<T>
    where
        F: FnOnce() -> Result<T, Status> + Send + 'static,
    {
        let result = PendingResult::new();
        let target = result.clone();
        let job = move || {
            let outcome = guarded("spawned task", f).and_then(|outcome| outcome);
            let _ = target.complete(outcome);
        };
        match context {
            ExecutionContext::Immediate => job(),
            ExecutionContext::Dispatcher(dispatcher) => {
                if let Err(err) = dispatcher.dispatch(job) {
                    let _ = result.set_failure(err.into());
                }
            }
        }
        result
    }

    /// A result that mirrors this one but fails with `TIMEOUT` if it has not
    /// finished within `timeout`
    ///
    /// This result itself is left alone when the timer fires.
    pub fn with_timeout(&self, timeout: Duration) -> PendingResult<T> {
        let bounded = PendingResult::new();
        let target = bounded.clone();
        self.observe(move |outcome| match outcome {
            // The timer may have failed it already
            Some(_) if target.is_done() => {}
            Some(result) => {
                let _ = target.complete(result.clone());
            }
            None => {
                target.cancel();
            }
        });
        if bounded.is_done() {
            return bounded;
        }

        let source = self.clone();
        let target = bounded.clone();
        let timer = thread::Builder::new()
            .name(format!("pending-timeout-{}", self.id()))
            .spawn(move || {
                if source.wait_timeout(timeout).is_err() && !source.is_done() {
                    let _ = target.set_failure(Status::timeout());
                }
            });
        if let Err(err) = timer {
            warn!("Could not start timeout timer for #{}: {}", self.id(), err);
        }
        bounded
    }
}

struct JoinState<T> {
    slots: Vec<Option<Result<T, Status>>>,
    cancelled: bool,
    remaining: usize,
}

fn join<T, R, F>(inputs: Vec<PendingResult<T>>, finish: F) -> PendingResult<R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
    F: Fn(&PendingResult<R>, Vec<Result<T, Status>>, bool) + Send + Sync + 'static,
{
    let joined = PendingResult::new();
    if inputs.is_empty() {
        finish(&joined, Vec::new(), false);
        return joined;
    }

    let state = Arc::new(Mutex::new(JoinState {
        slots: vec![None; inputs.len()],
        cancelled: false,
        remaining: inputs.len(),
    }));
    let finish = Arc::new(finish);

    for (index, input) in inputs.iter().enumerate() {
        let state = state.clone();
        let finish = finish.clone();
        let target = joined.clone();
        input.observe(move |outcome| {
            let done = {
                let mut state = state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match outcome {
                    Some(result) => state.slots[index] = Some(result.clone()),
                    None => {
                        state.cancelled = true;
                        state.slots[index] = Some(Err(Status::cancelled()));
                    }
                }
                state.remaining -= 1;
                if state.remaining == 0 {
                    let slots = std::mem::take(&mut state.slots);
                    Some((slots, state.cancelled))
                } else {
                    None
                }
            };

            if let Some((slots, cancelled)) = done {
                let results = slots
                    .into_iter()
                    .map(|slot| slot.unwrap_or_else(|| Err(Status::internal("join slot empty"))))
                    .collect();
                finish(&target, results, cancelled);
            }
        });
    }

    joined
}

/// Complete once every input finished
///
/// Succeeds with the values in input order when all inputs succeed. If any
/// failed, fails with the last failure's code and a message naming how many
/// failed. Otherwise, if any was cancelled, the joined result is cancelled.
///
/// # Example
/// ```
/// use conduit_core_pending::{when_all, PendingResult};
///
/// let a = PendingResult::new();
/// let b = PendingResult::new();
/// let both = when_all(vec![a.clone(), b.clone()]);
/// b.set_result(2).unwrap();
/// a.set_result(1).unwrap();
/// assert_eq!(both.wait(), Ok(vec![1, 2]));
/// ```
pub fn when_all<T>(inputs: Vec<PendingResult<T>>) -> PendingResult<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let total = inputs.len();
    join(inputs, move |target, results, cancelled| {
        let mut values = Vec::with_capacity(results.len());
        let mut failed = 0;
        let mut last_failure: Option<Status> = None;

        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(status) if status.code() == StatusCode::Cancelled && cancelled => {}
                Err(status) => {
                    failed += 1;
                    last_failure = Some(status);
                }
            }
        }

        if let Some(status) = last_failure {
            let message = format!(
                "{} out of {} underlying results failed: {}",
                failed, total, status
            );
            let _ = target.set_failure(Status::new(status.code(), Some(message)));
        } else if cancelled {
            target.cancel();
        } else {
            let _ = target.set_result(values);
        }
    })
}

/// Complete once every input finished, reporting each outcome
///
/// Never fails; cancelled inputs appear as `Cancelled` statuses.
pub fn when_all_settled<T>(inputs: Vec<PendingResult<T>>) -> PendingResult<Vec<Result<T, Status>>>
where
    T: Clone + Send + 'static,
{
    join(inputs, |target, results, _| {
        let _ = target.set_result(results);
    })
}
