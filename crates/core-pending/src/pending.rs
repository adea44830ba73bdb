//! Single-assignment result slot with blocking wait, timeout, cancellation
//! and callback registration
//!
//! A `PendingResult` is handed out as soon as a call is scheduled and is
//! completed exactly once by whoever ends up executing the call. Callers can:
//! - block a thread on it (`wait`, `wait_timeout`)
//! - await it from async code (`wait_async`, or `.await` directly)
//! - register one callback that runs on a chosen `ExecutionContext`
//! - cancel it, which only stops delivery; the remote side is not interrupted

use crate::dispatcher::ExecutionContext;
use crate::error::CompletionError;
use crate::status::Status;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Externally visible lifecycle of a pending result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// No outcome yet
    Pending,
    /// Completed with a value or a failure status
    Resolved,
    /// Cancelled by the caller before it resolved
    Cancelled,
}

type Callback<T> = Box<dyn FnOnce(Result<T, Status>) + Send + 'static>;
/// `None` means the result was cancelled
type Observer<T> = Box<dyn FnOnce(Option<&Result<T, Status>>) + Send + 'static>;

enum Progress<T> {
    Pending,
    Resolved(Result<T, Status>),
    Cancelled,
}

struct Slot<T> {
    progress: Progress<T>,
    callback: Option<(Callback<T>, ExecutionContext)>,
    /// Internal hooks used by combinators; unlike the user callback they also
    /// fire on cancellation.
    observers: Vec<Observer<T>>,
}

struct Shared<T> {
    id: u64,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    notify: Notify,
}

/// Handle to a single-assignment asynchronous result
///
/// Clones share the same slot.
///
/// # Example
/// ```
/// use conduit_core_pending::{PendingResult, Status};
/// use std::time::Duration;
///
/// let result = PendingResult::<u32>::new();
/// let producer = result.clone();
///
/// std::thread::spawn(move || {
///     producer.set_result(42).unwrap();
/// });
///
/// assert_eq!(result.wait_timeout(Duration::from_secs(5)), Ok(42));
/// // A second completion is rejected and changes nothing
/// assert!(result.set_failure(Status::cancelled()).is_err());
/// assert_eq!(result.wait(), Ok(42));
/// ```
pub struct PendingResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PendingResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> PendingResult<T>
where
    T: Clone + Send + 'static,
{
    /// Create an unresolved result with no waiters
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                slot: Mutex::new(Slot {
                    progress: Progress::Pending,
                    callback: None,
                    observers: Vec::new(),
                }),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// An already successful result
    pub fn for_result(value: T) -> Self {
        let result = Self::new();
        let _ = result.set_result(value);
        result
    }

    /// An already failed result
    pub fn for_failure(status: Status) -> Self {
        let result = Self::new();
        let _ = result.set_failure(status);
        result
    }

    /// An already cancelled result
    pub fn for_cancelled() -> Self {
        let result = Self::new();
        result.cancel();
        result
    }

    /// Process-unique identifier, used in log lines
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store the outcome, wake every waiter and dispatch the callback
    ///
    /// Valid only while pending. A second completion is rejected with
    /// `CompletionError::AlreadyCompleted` and leaves the first outcome in
    /// place.
    pub fn complete(&self, outcome: Result<T, Status>) -> Result<(), CompletionError> {
        let (callback, observers) = {
            let mut slot = self.lock();
            match slot.progress {
                Progress::Resolved(_) => {
                    error!(
                        "Pending result #{} completed twice; keeping the first outcome",
                        self.shared.id
                    );
                    return Err(CompletionError::AlreadyCompleted);
                }
                Progress::Cancelled => {
                    debug!(
                        "Pending result #{} was cancelled; discarding outcome",
                        self.shared.id
                    );
                    return Err(CompletionError::Cancelled);
                }
                Progress::Pending => {}
            }
            slot.progress = Progress::Resolved(outcome.clone());
            (slot.callback.take(), std::mem::take(&mut slot.observers))
        };

        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();

        for observer in observers {
            observer(Some(&outcome));
        }
        if let Some((callback, context)) = callback {
            context.execute(move || callback(outcome));
        }
        Ok(())
    }

    pub fn set_result(&self, value: T) -> Result<(), CompletionError> {
        self.complete(Ok(value))
    }

    pub fn set_failure(&self, status: Status) -> Result<(), CompletionError> {
        self.complete(Err(status))
    }

    /// Block the calling thread until the result resolves or is cancelled
    pub fn wait(&self) -> Result<T, Status> {
        let mut slot = self.lock();
        loop {
            if let Some(outcome) = Self::peek(&slot) {
                return outcome;
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block for at most `timeout`
    ///
    /// On expiry returns `Err(Status::timeout())`. The result itself is left
    /// untouched, so a later wait still sees the real outcome.
    /// A timeout too large to represent as a deadline waits without one.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, Status> {
        let mut slot = self.lock();
        if let Some(outcome) = Self::peek(&slot) {
            return outcome;
        }
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            drop(slot);
            return self.wait();
        };
        loop {
            if let Some(outcome) = Self::peek(&slot) {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Status::timeout());
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot = guard;
        }
    }

    /// Await the outcome without blocking a runtime thread
    pub async fn wait_async(&self) -> Result<T, Status> {
        loop {
            let notified = self.shared.notify.notified();
            let mut notified = std::pin::pin!(notified);
            // Register before checking so a completion in between is not missed
            notified.as_mut().enable();

            if let Some(outcome) = self.try_result() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Register the completion callback
    ///
    /// Runs right away on `context` if the result is already resolved. A
    /// second registration replaces the first. Cancelled results never call
    /// back.
    pub fn on_complete<F>(&self, callback: F, context: ExecutionContext)
    where
        F: FnOnce(Result<T, Status>) + Send + 'static,
    {
        let mut slot = self.lock();
        match &slot.progress {
            Progress::Resolved(outcome) => {
                let outcome = outcome.clone();
                drop(slot);
                context.execute(move || callback(outcome));
            }
            Progress::Cancelled => {
                debug!(
                    "Pending result #{} is cancelled; callback not registered",
                    self.shared.id
                );
            }
            Progress::Pending => {
                if slot.callback.is_some() {
                    debug!(
                        "Pending result #{} already had a callback; replacing it",
                        self.shared.id
                    );
                }
                let replaced = slot.callback.replace((Box::new(callback), context));
                drop(slot);
                drop(replaced);
            }
        }
    }

    /// Cancel delivery if still pending
    ///
    /// Returns true when this call moved the result to cancelled. Waiters wake
    /// with a `Cancelled` status; the registered callback is discarded.
    pub fn cancel(&self) -> bool {
        let (dropped_callback, observers) = {
            let mut slot = self.lock();
            if !matches!(slot.progress, Progress::Pending) {
                return false;
            }
            slot.progress = Progress::Cancelled;
            (slot.callback.take(), std::mem::take(&mut slot.observers))
        };
        drop(dropped_callback);

        debug!("Pending result #{} cancelled", self.shared.id);
        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();

        for observer in observers {
            observer(None);
        }
        true
    }

    /// Non-blocking peek at the outcome
    pub fn try_result(&self) -> Option<Result<T, Status>> {
        let slot = self.lock();
        Self::peek(&slot)
    }

    pub fn state(&self) -> PendingState {
        match self.lock().progress {
            Progress::Pending => PendingState::Pending,
            Progress::Resolved(_) => PendingState::Resolved,
            Progress::Cancelled => PendingState::Cancelled,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state() != PendingState::Pending
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == PendingState::Cancelled
    }

    /// Status of the outcome, `None` while pending
    pub fn status(&self) -> Option<Status> {
        self.try_result().map(|outcome| match outcome {
            Ok(_) => Status::success(),
            Err(status) => status,
        })
    }

    /// Attach an internal completion hook that also fires on cancellation
    pub(crate) fn observe<F>(&self, observer: F)
    where
        F: FnOnce(Option<&Result<T, Status>>) + Send + 'static,
    {
        let mut slot = self.lock();
        match &slot.progress {
            Progress::Pending => slot.observers.push(Box::new(observer)),
            Progress::Resolved(outcome) => {
                let outcome = outcome.clone();
                drop(slot);
                observer(Some(&outcome));
            }
            Progress::Cancelled => {
                drop(slot);
                observer(None);
            }
        }
    }

    fn peek(slot: &Slot<T>) -> Option<Result<T, Status>> {
        match &slot.progress {
            Progress::Pending => None,
            Progress::Resolved(outcome) => Some(outcome.clone()),
            Progress::Cancelled => Some(Err(Status::cancelled())),
        }
    }
}

impl<T> Default for PendingResult<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PendingResult<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> IntoFuture for PendingResult<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, Status>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<T, Status>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait_async().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::status::StatusCode;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_new_is_pending() {
        let result = PendingResult::<u8>::new();
        assert_eq!(result.state(), PendingState::Pending);
        assert!(result.try_result().is_none());
        assert!(result.status().is_none());
    }

    #[test]
    fn test_second_completion_is_rejected() {
        let result = PendingResult::new();
        result.set_result("first".to_string()).unwrap();

        let second = result.set_result("second".to_string());
        assert_eq!(second, Err(CompletionError::AlreadyCompleted));
        let third = result.set_failure(Status::internal("late"));
        assert_eq!(third, Err(CompletionError::AlreadyCompleted));

        assert_eq!(result.wait(), Ok("first".to_string()));
    }

    #[test]
    fn test_wait_timeout_does_not_consume() {
        let result = PendingResult::<u32>::new();
        let producer = result.clone();

        let timed_out = result.wait_timeout(Duration::from_millis(10));
        assert_eq!(timed_out.unwrap_err().code(), StatusCode::Timeout);
        assert_eq!(result.state(), PendingState::Pending);

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.set_result(7).unwrap();
        });

        assert_eq!(result.wait_timeout(Duration::from_secs(5)), Ok(7));
        assert_eq!(result.wait(), Ok(7));
    }

    #[test]
    fn test_unbounded_timeout_never_overflows() {
        let resolved = PendingResult::for_result(1u32);
        assert_eq!(resolved.wait_timeout(Duration::MAX), Ok(1));

        let result = PendingResult::<u32>::new();
        let producer = result.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.set_result(2).unwrap();
        });
        assert_eq!(result.wait_timeout(Duration::MAX), Ok(2));
    }

    #[test]
    fn test_all_blocked_waiters_wake() {
        let result = PendingResult::<u32>::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let r = result.clone();
                thread::spawn(move || r.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        result.set_result(3).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(3));
        }
    }

    #[test]
    fn test_callback_after_resolution_runs_immediately() {
        let result = PendingResult::for_result(5u32);
        let (tx, rx) = mpsc::channel();
        result.on_complete(move |r| tx.send(r).unwrap(), ExecutionContext::Immediate);
        assert_eq!(rx.try_recv().unwrap(), Ok(5));
    }

    #[test]
    fn test_callback_registered_before_resolution() {
        let result = PendingResult::<u32>::new();
        let (tx, rx) = mpsc::channel();
        result.on_complete(move |r| tx.send(r).unwrap(), ExecutionContext::Immediate);
        assert!(rx.try_recv().is_err());

        result.set_failure(Status::disconnected("link lost")).unwrap();
        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.unwrap_err().code(), StatusCode::Disconnected);
    }

    #[test]
    fn test_second_callback_replaces_first() {
        let result = PendingResult::<u32>::new();
        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        result.on_complete(move |_| first.send("first").unwrap(), ExecutionContext::Immediate);
        result.on_complete(move |_| tx.send("second").unwrap(), ExecutionContext::Immediate);

        result.set_result(1).unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["second"]);
    }

    #[test]
    fn test_callback_delivered_at_most_once() {
        let result = PendingResult::<u32>::new();
        let (tx, rx) = mpsc::channel();
        result.on_complete(move |r| tx.send(r).unwrap(), ExecutionContext::Immediate);

        result.set_result(1).unwrap();
        let _ = result.set_result(2);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_cancel_suppresses_callback_and_wakes_waiters() {
        let result = PendingResult::<u32>::new();
        let (tx, rx) = mpsc::channel();
        result.on_complete(move |r| tx.send(r).unwrap(), ExecutionContext::Immediate);

        let waiter = {
            let r = result.clone();
            thread::spawn(move || r.wait())
        };
        thread::sleep(Duration::from_millis(20));

        assert!(result.cancel());
        assert!(!result.cancel());
        assert_eq!(
            waiter.join().unwrap().unwrap_err().code(),
            StatusCode::Cancelled
        );

        assert_eq!(result.set_result(9), Err(CompletionError::Cancelled));
        assert!(rx.try_recv().is_err());
        assert!(result.is_cancelled());
    }

    #[test]
    fn test_cancel_after_resolution_is_noop() {
        let result = PendingResult::for_result(1u8);
        assert!(!result.cancel());
        assert_eq!(result.state(), PendingState::Resolved);
    }

    #[test]
    fn test_callback_on_cancelled_is_dropped() {
        let result = PendingResult::<u8>::for_cancelled();
        let (tx, rx) = mpsc::channel();
        result.on_complete(move |r| tx.send(r).unwrap(), ExecutionContext::Immediate);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_callback_runs_on_dispatcher_thread() {
        let dispatcher = Dispatcher::spawn("pending-callback").unwrap();
        let result = PendingResult::<u8>::new();
        let (tx, rx) = mpsc::channel();

        result.on_complete(
            move |_| tx.send(thread::current().name().map(str::to_string)).unwrap(),
            ExecutionContext::Dispatcher(dispatcher.clone()),
        );
        result.set_result(1).unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("pending-callback"));
        dispatcher.shutdown();
    }

    #[test]
    fn test_ready_made_results() {
        assert_eq!(PendingResult::for_result(1u8).status(), Some(Status::success()));
        assert_eq!(
            PendingResult::<u8>::for_failure(Status::timeout()).status(),
            Some(Status::timeout())
        );
        assert_eq!(
            PendingResult::<u8>::for_cancelled().state(),
            PendingState::Cancelled
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let a = PendingResult::<u8>::new();
        let b = PendingResult::<u8>::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[tokio::test]
    async fn test_wait_async_resolves_from_other_thread() {
        let result = PendingResult::<u32>::new();
        let producer = result.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.set_result(11).unwrap();
        });

        assert_eq!(result.wait_async().await, Ok(11));
    }

    #[tokio::test]
    async fn test_into_future() {
        let result = PendingResult::<u32>::new();
        let producer = result.clone();
        tokio::spawn(async move {
            producer.set_result(12).unwrap();
        });

        assert_eq!(result.await, Ok(12));
    }

    #[tokio::test]
    async fn test_wait_async_sees_cancellation() {
        let result = PendingResult::<u32>::new();
        let canceller = result.clone();
        tokio::spawn(async move {
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), result.wait_async())
            .await
            .unwrap();
        assert_eq!(outcome.unwrap_err().code(), StatusCode::Cancelled);
    }
}
