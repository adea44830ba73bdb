//! Ordered callback delivery on execution contexts
//!
//! Results become available on arbitrary threads (transport reader threads,
//! connection event threads). User callbacks must instead run on the context
//! the caller picked, in the order they were submitted to that context.
//!
//! Each `Dispatcher` is a single-consumer FIFO queue. The consumer is either a
//! dedicated worker thread (`Dispatcher::spawn`) or a run-loop owned by some
//! other thread (`Dispatcher::run_loop`), which is how UI-affine contexts are
//! modelled: the UI thread drains its `RunLoop` whenever it gets a chance.
//!
//! Delivery order is submission order. Two results that resolve B-then-A have
//! their callbacks run B-then-A, regardless of the order the calls were made.

use crate::error::DispatchError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, warn};

/// A unit of work submitted to a context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

struct DispatcherInner {
    name: String,
    sender: Sender<Message>,
    accepting: AtomicBool,
    /// Held across the accepting check and the send, so no job can be
    /// queued behind the shutdown marker
    gate: Mutex<()>,
    dispatched: AtomicU64,
    executed: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: OnceLock<ThreadId>,
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            // Worker may already be gone if its run-loop was dropped
            let _ = self.sender.send(Message::Shutdown);
        }
    }
}

/// Handle to a single-consumer FIFO execution context
///
/// Cloning is cheap; all clones feed the same queue. The worker stops once
/// `shutdown()` is called or the last handle is dropped, after draining the
/// jobs already queued.
///
/// # Example
/// ```
/// use conduit_core_pending::Dispatcher;
/// use std::sync::mpsc;
///
/// let dispatcher = Dispatcher::spawn("callbacks").unwrap();
/// let (tx, rx) = mpsc::channel();
/// for i in 0..3 {
///     let tx = tx.clone();
///     dispatcher.dispatch(move || tx.send(i).unwrap()).unwrap();
/// }
/// let order: Vec<i32> = rx.iter().take(3).collect();
/// assert_eq!(order, vec![0, 1, 2]);
/// dispatcher.shutdown();
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    fn with_channel(name: &str) -> (Self, Receiver<Message>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                name: name.to_string(),
                sender,
                accepting: AtomicBool::new(true),
                gate: Mutex::new(()),
                dispatched: AtomicU64::new(0),
                executed: Arc::new(AtomicU64::new(0)),
                worker: Mutex::new(None),
                worker_thread: OnceLock::new(),
            }),
        };
        (dispatcher, receiver)
    }

    /// Start a dispatcher backed by a dedicated, named worker thread
    pub fn spawn(name: &str) -> Result<Self, DispatchError> {
        let (dispatcher, receiver) = Self::with_channel(name);
        let executed = dispatcher.inner.executed.clone();
        let worker_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("Dispatcher '{}' worker started", worker_name);
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Run(job) => {
                            run_guarded(&worker_name, job);
                            executed.fetch_add(1, Ordering::Relaxed);
                        }
                        Message::Shutdown => break,
                    }
                }
                debug!("Dispatcher '{}' worker stopped", worker_name);
            })
            .map_err(|source| DispatchError::Spawn {
                name: name.to_string(),
                source,
            })?;

        let _ = dispatcher.inner.worker_thread.set(handle.thread().id());
        if let Ok(mut worker) = dispatcher.inner.worker.lock() {
            *worker = Some(handle);
        }

        Ok(dispatcher)
    }

    /// Create a dispatcher drained by whichever thread owns the returned `RunLoop`
    pub fn run_loop(name: &str) -> (Self, RunLoop) {
        let (dispatcher, receiver) = Self::with_channel(name);
        let run_loop = RunLoop {
            name: name.to_string(),
            receiver,
            executed: dispatcher.inner.executed.clone(),
            closed: false,
        };
        (dispatcher, run_loop)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue a job behind everything already submitted to this context
    pub fn dispatch<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let _gate = self.gate();
        if !self.inner.accepting.load(Ordering::SeqCst) {
            warn!("Dropping job submitted to shut down dispatcher '{}'", self.inner.name);
            return Err(DispatchError::ShutDown(self.inner.name.clone()));
        }

        self.inner
            .sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| {
                warn!("Dispatcher '{}' has no consumer left", self.inner.name);
                DispatchError::ShutDown(self.inner.name.clone())
            })?;
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting jobs; queued jobs still run
    ///
    /// Joins the worker thread unless called from the worker itself.
    pub fn shutdown(&self) {
        {
            let _gate = self.gate();
            if self.inner.accepting.swap(false, Ordering::SeqCst) {
                debug!("Shutting down dispatcher '{}'", self.inner.name);
                let _ = self.inner.sender.send(Message::Shutdown);
            }
        }

        if self.is_current() {
            return;
        }

        let handle = self
            .inner
            .worker
            .lock()
            .ok()
            .and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Dispatcher '{}' worker panicked", self.inner.name);
            }
        }
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_shut_down(&self) -> bool {
        !self.inner.accepting.load(Ordering::SeqCst)
    }

    /// True when called on this dispatcher's worker thread
    pub fn is_current(&self) -> bool {
        self.inner.worker_thread.get() == Some(&thread::current().id())
    }

    /// Number of jobs accepted so far
    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Number of jobs run so far (including ones that panicked)
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("dispatched", &self.dispatched())
            .field("executed", &self.executed())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Consumer side of a run-loop dispatcher
///
/// Owned by the thread the context is affine to. Nothing runs until that
/// thread calls `run_pending` or `run_one`.
pub struct RunLoop {
    name: String,
    receiver: Receiver<Message>,
    executed: Arc<AtomicU64>,
    closed: bool,
}

impl RunLoop {
    /// Run every job queued right now without blocking; returns how many ran
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while !self.closed {
            match self.receiver.try_recv() {
                Ok(message) => {
                    if self.handle(message) {
                        ran += 1;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.closed = true,
            }
        }
        ran
    }

    /// Wait up to `timeout` for one job and run it; false if none arrived
    pub fn run_one(&mut self, timeout: Duration) -> bool {
        if self.closed {
            return false;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => self.handle(message),
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                false
            }
        }
    }

    /// True once the dispatcher was shut down and every queued job ran
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn handle(&mut self, message: Message) -> bool {
        match message {
            Message::Run(job) => {
                run_guarded(&self.name, job);
                self.executed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Message::Shutdown => {
                self.closed = true;
                false
            }
        }
    }
}

/// Where a callback runs
#[derive(Clone, Debug, Default)]
pub enum ExecutionContext {
    /// On whichever thread produced the result
    #[default]
    Immediate,
    /// Queued on a dispatcher, in submission order
    Dispatcher(Dispatcher),
}

impl ExecutionContext {
    /// Run `job` on this context
    ///
    /// A job handed to a shut down dispatcher is dropped; the dispatcher has
    /// already logged it.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            ExecutionContext::Immediate => run_guarded("immediate", Box::new(job)),
            ExecutionContext::Dispatcher(dispatcher) => {
                let _ = dispatcher.dispatch(job);
            }
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, ExecutionContext::Immediate)
    }
}

impl From<Dispatcher> for ExecutionContext {
    fn from(dispatcher: Dispatcher) -> Self {
        ExecutionContext::Dispatcher(dispatcher)
    }
}

fn run_guarded(context: &str, job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        let reason = panic_message(panic.as_ref());
        error!("Callback panicked on context '{}': {}", context, reason);
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
