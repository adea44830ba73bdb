//! ClientFacade: the object API surfaces schedule calls through
//!
//! A façade holds a reference to a shared [`Connection`] and a FIFO queue of
//! deferred calls. Scheduling never blocks: the caller gets a
//! [`PendingResult`] immediately, the façade makes sure the connection is
//! coming up, and queued calls run in order once it is.

use crate::connection::{Connection, ConnectionEvent, ConnectionState, ListenerId};
use crate::error::{CallError, ConnectError};
use crate::registry::{ApiIdentity, ApiOptions, HostContext, ProviderRegistry};
use bytes::Bytes;
use conduit_core_pending::{panic_message, ExecutionContext, PendingResult, Status};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A call waiting for the connection, with its result slot
trait Deferred: Send {
    fn execute(self: Box<Self>, connection: &Arc<Connection>);
    fn abandon(self: Box<Self>, status: Status);
}

struct QueuedCall<T, F> {
    call: F,
    result: PendingResult<T>,
}

impl<T, F> Deferred for QueuedCall<T, F>
where
    T: Clone + Send + 'static,
    F: FnOnce(&Arc<Connection>, PendingResult<T>) -> Result<(), CallError> + Send + 'static,
{
    fn execute(self: Box<Self>, connection: &Arc<Connection>) {
        let QueuedCall { call, result } = *self;
        let handle = result.clone();
        let status = match catch_unwind(AssertUnwindSafe(move || call(connection, handle))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => {
                debug!("Call #{} on {} failed: {}", result.id(), connection.key(), err);
                Status::from(err)
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!("Call #{} on {} panicked: {}", result.id(), connection.key(), reason);
                Status::internal(format!("call panicked: {}", reason))
            }
        };
        if !result.is_done() {
            let _ = result.set_failure(status);
        }
    }

    fn abandon(self: Box<Self>, status: Status) {
        let _ = self.result.set_failure(status);
    }
}

#[derive(Default)]
struct CallQueue {
    calls: VecDeque<Box<dyn Deferred>>,
    draining: bool,
    released: bool,
}

struct FacadeInner {
    registry: ProviderRegistry,
    connection: Arc<Connection>,
    queue: Mutex<CallQueue>,
    listener: Mutex<Option<ListenerId>>,
    /// Caller callbacks registered through this façade
    callbacks: Mutex<Vec<ListenerId>>,
}

impl FacadeInner {
    fn queue(&self) -> MutexGuard<'_, CallQueue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn callbacks(&self) -> MutexGuard<'_, Vec<ListenerId>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_status(&self) -> Status {
        Status::cancelled()
            .with_message(format!("connection to {} was shut down", self.connection.key()))
    }

    /// Run queued calls in order while the connection stays up
    ///
    /// Only one thread drains at a time. Calls run without the queue lock
    /// held, so they may schedule further calls on this façade.
    fn drain(&self) {
        loop {
            {
                let mut queue = self.queue();
                if queue.draining {
                    return;
                }
                queue.draining = true;
            }

            while self.connection.is_connected() {
                let next = self.queue().calls.pop_front();
                match next {
                    Some(call) => call.execute(&self.connection),
                    None => break,
                }
            }

            let more = {
                let mut queue = self.queue();
                queue.draining = false;
                !queue.calls.is_empty()
            };
            // A call may have been queued after the last pop but before the
            // flag was cleared
            if !more || !self.connection.is_connected() {
                return;
            }
        }
    }

    fn fail_queued(&self, status: &Status) {
        let calls: Vec<Box<dyn Deferred>> = self.queue().calls.drain(..).collect();
        if calls.is_empty() {
            return;
        }
        warn!(
            "Failing {} queued call(s) on {}: {}",
            calls.len(),
            self.connection.key(),
            status
        );
        for call in calls {
            call.abandon(status.clone());
        }
    }

    fn on_event(&self, event: &ConnectionEvent) {
        if let ConnectionEvent::Connected = event {
            self.drain();
            return;
        }

        // Events are delivered asynchronously; a newer attempt may already be
        // under way and will settle the queue itself
        match self.connection.state() {
            ConnectionState::Connected => {
                self.drain();
                return;
            }
            ConnectionState::Connecting => {
                debug!(
                    "Ignoring {:?} on {}: a new attempt is in progress",
                    event,
                    self.connection.key()
                );
                return;
            }
            _ => {}
        }

        let status = match event {
            ConnectionEvent::Failed(status) | ConnectionEvent::Suspended(status) => status.clone(),
            ConnectionEvent::Disconnected => Status::cancelled()
                .with_message(format!("connection to {} was closed", self.connection.key())),
            ConnectionEvent::Connected => return,
        };
        self.fail_queued(&status);
    }

    fn release(&self) {
        let calls: Vec<Box<dyn Deferred>> = {
            let mut queue = self.queue();
            if queue.released {
                return;
            }
            queue.released = true;
            queue.calls.drain(..).collect()
        };

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(id) = listener {
            self.connection.unsubscribe(id);
        }
        let callbacks: Vec<ListenerId> = self.callbacks().drain(..).collect();
        for id in callbacks {
            self.connection.unsubscribe(id);
        }

        let status = Status::cancelled().with_message("client was released");
        for call in calls {
            call.abandon(status.clone());
        }
        debug!("Releasing façade for {}", self.connection.key());
        self.registry.release(&self.connection);
    }
}

/// Caller-facing handle that queues calls against a shared connection
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use conduit_connect::{
///     ApiIdentity, ApiOptions, ClientFacade, HostContext, LoopbackTransport, ProviderRegistry,
/// };
/// use std::sync::Arc;
///
/// let registry = ProviderRegistry::new();
/// let provider = Arc::new(LoopbackTransport::echo("echo"));
/// registry.register(ApiIdentity::new("echo"), provider.factory());
///
/// let client = ClientFacade::new(
///     &registry,
///     ApiIdentity::new("echo"),
///     ApiOptions::new(),
///     HostContext::new("app"),
/// )
/// .unwrap();
///
/// let length = client.schedule(|connection, result| {
///     let reply = connection.send(Bytes::from_static(b"hello")).wait()?;
///     let _ = result.set_result(reply.len());
///     Ok(())
/// });
/// assert_eq!(length.wait(), Ok(5));
/// ```
pub struct ClientFacade {
    inner: Arc<FacadeInner>,
}

impl ClientFacade {
    /// Acquire the shared connection for this key and subscribe to it
    ///
    /// Does not connect; the first scheduled call does.
    pub fn new(
        registry: &ProviderRegistry,
        api: ApiIdentity,
        options: ApiOptions,
        host: HostContext,
    ) -> Result<Self, ConnectError> {
        let connection = registry.acquire(&api, &options, &host)?;
        let inner = Arc::new(FacadeInner {
            registry: registry.clone(),
            connection,
            queue: Mutex::new(CallQueue::default()),
            listener: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
        });

        let weak: Weak<FacadeInner> = Arc::downgrade(&inner);
        let id = inner.connection.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        });
        *inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id);

        Ok(Self { inner })
    }

    /// Queue `call` and return its result handle right away
    ///
    /// The call runs exactly once with the live connection and its own result
    /// to resolve: synchronously when the connection is already up and nothing
    /// is queued ahead of it, otherwise after earlier calls once connected.
    /// If the connection cannot be established, the result fails with the
    /// connection's failure status instead, or with `CANCELLED` once the
    /// owning registry has shut down. Returning `Err` or panicking resolves
    /// the result with that failure.
    pub fn schedule<T, F>(&self, call: F) -> PendingResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&Arc<Connection>, PendingResult<T>) -> Result<(), CallError> + Send + 'static,
    {
        let result = PendingResult::new();
        {
            let mut queue = self.inner.queue();
            if queue.released {
                drop(queue);
                let _ = result
                    .set_failure(Status::cancelled().with_message("client was released"));
                return result;
            }
            queue.calls.push_back(Box::new(QueuedCall {
                call,
                result: result.clone(),
            }));
        }

        // A close racing this check fails the queue through its event
        if self.inner.connection.is_closed() {
            self.inner.fail_queued(&self.inner.closed_status());
            return result;
        }

        match self.inner.connection.state() {
            ConnectionState::Connected => self.inner.drain(),
            ConnectionState::Connecting => {}
            state => {
                debug!(
                    "Call #{} queued on {} while {}; connecting",
                    result.id(),
                    self.inner.connection.key(),
                    state
                );
                self.inner.connection.connect();
            }
        }
        result
    }

    /// Schedule a plain request/reply exchange
    pub fn send(&self, payload: Bytes) -> PendingResult<Bytes> {
        self.schedule(move |connection, result| {
            connection.send(payload).on_complete(
                move |reply| {
                    let _ = result.complete(reply);
                },
                ExecutionContext::Immediate,
            );
            Ok(())
        })
    }

    /// Start connecting without scheduling anything
    pub fn connect(&self) {
        self.inner.connection.connect();
    }

    /// Connect and block until the attempt settles or `timeout` elapses
    ///
    /// Returns `SUCCESS` once connected. Must not be called from the context
    /// connection events are delivered on.
    pub fn blocking_connect(&self, timeout: Duration) -> Status {
        if self.is_connected() {
            return Status::success();
        }
        if self.inner.connection.is_closed() {
            return self.inner.closed_status();
        }
        let waiter = self.inner.connection.when_connected();
        self.inner.connection.connect();
        match waiter.wait_timeout(timeout) {
            Ok(()) => Status::success(),
            Err(status) => {
                if !waiter.is_done() {
                    waiter.cancel();
                }
                info!(
                    "Blocking connect to {} ended with {}",
                    self.inner.connection.key(),
                    status
                );
                status
            }
        }
    }

    /// Disconnect the shared connection
    ///
    /// Every façade on the connection sees it: queued and in-flight calls
    /// fail with `CANCELLED`. The next scheduled call connects again.
    pub fn disconnect(&self) {
        info!("Disconnecting {}", self.inner.connection.key());
        self.inner.connection.disconnect();
    }

    /// Drop the current link, if any, and start a fresh bind
    pub fn reconnect(&self) {
        debug!("Reconnecting {}", self.inner.connection.key());
        self.inner.connection.disconnect();
        self.inner.connection.connect();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connection.state() == ConnectionState::Connecting
    }

    /// Call `callback` each time the connection comes up
    pub fn on_connected<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_callback(move |event| {
            if let ConnectionEvent::Connected = event {
                callback();
            }
        })
    }

    /// Call `callback` with the status each time an established link drops
    pub fn on_connection_suspended<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Status) + Send + Sync + 'static,
    {
        self.add_callback(move |event| {
            if let ConnectionEvent::Suspended(status) = event {
                callback(status);
            }
        })
    }

    /// Call `callback` with the status each time a bind attempt fails
    pub fn on_connection_failed<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Status) + Send + Sync + 'static,
    {
        self.add_callback(move |event| {
            if let ConnectionEvent::Failed(status) = event {
                callback(status);
            }
        })
    }

    /// Remove a callback added through this façade
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut callbacks = self.inner.callbacks();
        let Some(index) = callbacks.iter().position(|known| *known == id) else {
            return false;
        };
        callbacks.remove(index);
        self.inner.connection.unsubscribe(id)
    }

    pub fn is_listener_registered(&self, id: ListenerId) -> bool {
        self.inner.callbacks().contains(&id)
    }

    fn add_callback<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks();
        let id = self.inner.connection.subscribe(listener);
        if self.inner.queue().released {
            // Released façades keep no subscriptions
            self.inner.connection.unsubscribe(id);
        } else {
            callbacks.push(id);
        }
        id
    }

    /// Number of calls waiting for the connection
    pub fn queued(&self) -> usize {
        self.inner.queue().calls.len()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.inner.connection
    }

    /// Give the connection back to the registry
    ///
    /// Queued calls fail with `CANCELLED`; later calls are rejected the same
    /// way. Calls already running are not interrupted.
    pub fn release(&self) {
        self.inner.release();
    }
}

impl Drop for ClientFacade {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl fmt::Debug for ClientFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFacade")
            .field("connection", &self.inner.connection.key())
            .field("queued", &self.queued())
            .finish()
    }
}
