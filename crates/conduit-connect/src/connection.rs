//! Connection: lifecycle of one logical link to one provider
//!
//! ```text
//!            connect()              connected()
//!   IDLE ─────────────▶ CONNECTING ─────────────▶ CONNECTED
//!    ▲                     │                          │
//!    │                     │ bind rejected            │ link dropped
//!    │                     ▼                          ▼
//!    │                   FAILED                   SUSPENDED
//!    │                     │   connect()              │ connect()
//!    │                     └──────▶ CONNECTING ◀──────┘
//!    │
//!    └──────────── disconnect() from any state
//! ```
//!
//! A connection never retries on its own. Whoever calls `connect()` next
//! starts a fresh attempt.

use crate::error::TransportError;
use crate::registry::ConnectionKey;
use crate::transport::{CorrelationId, LinkEvents, LinkHandle, Reply, Transport};
use bytes::Bytes;
use conduit_core_pending::{panic_message, ExecutionContext, PendingResult, Status};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected, or explicitly disconnected
    Idle,
    /// A bind attempt is in flight
    Connecting,
    /// The link is up; `send` is allowed
    Connected,
    /// The link dropped while connected
    Suspended,
    /// The last bind attempt was rejected
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Suspended => "SUSPENDED",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// State change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// The link dropped; in-flight operations were failed with this status
    Suspended(Status),
    /// The bind attempt failed with this status
    Failed(Status),
    /// `disconnect()` or `close()` was called
    Disconnected,
}

/// Consistent view of a connection, read under one lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub pending_operations: usize,
    pub last_failure: Option<Status>,
}

/// Subscription handle returned by [`Connection::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync + 'static>;

struct Inner {
    state: ConnectionState,
    handle: Option<LinkHandle>,
    /// Bumped on every connect and disconnect; link events carry the value
    /// current when their bind started.
    generation: u64,
    /// `connected()` fired before `bind` returned the handle
    connected_early: bool,
    pending: VecDeque<(CorrelationId, PendingResult<Bytes>)>,
    /// Replies that beat their `post_message` call back
    early_replies: HashMap<CorrelationId, Reply>,
    posting: usize,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    last_failure: Option<Status>,
    /// Set by `close`; no further bind attempts are made
    closed: bool,
}

/// A single logical link to one provider, shared by every façade using the
/// same [`ConnectionKey`]
///
/// Obtain one through [`ProviderRegistry`](crate::ProviderRegistry); façades
/// only ever touch it through `connect`, `disconnect` and `send`.
pub struct Connection {
    key: ConnectionKey,
    transport: Arc<dyn Transport>,
    context: ExecutionContext,
    inner: Mutex<Inner>,
    me: Weak<Connection>,
}

impl Connection {
    /// Create an idle connection; events are delivered on `context`
    pub fn new(
        key: ConnectionKey,
        transport: Arc<dyn Transport>,
        context: ExecutionContext,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            key,
            transport,
            context,
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                handle: None,
                generation: 0,
                connected_early: false,
                pending: VecDeque::new(),
                early_replies: HashMap::new(),
                posting: 0,
                listeners: Vec::new(),
                next_listener: 1,
                last_failure: None,
                closed: false,
            }),
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.lock();
        ConnectionSnapshot {
            state: inner.state,
            pending_operations: inner.pending.len(),
            last_failure: inner.last_failure.clone(),
        }
    }

    /// Start a bind attempt unless one is in flight or the link is up
    ///
    /// Does nothing once the connection is closed.
    pub fn connect(&self) {
        let (generation, events) = {
            let mut inner = self.lock();
            if inner.closed {
                debug!("Connect to {} ignored: connection is closed", self.key);
                return;
            }
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!("Connect to {} ignored: already {}", self.key, inner.state);
                return;
            }
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            inner.connected_early = false;
            (
                inner.generation,
                LinkEvents::new(self.me.clone(), inner.generation),
            )
        };

        info!("Connecting to {}", self.key);
        match self.transport.bind(events) {
            Ok(handle) => self.on_bind_returned(generation, handle),
            Err(err) => {
                let status = bind_failure(&err);
                let failed = {
                    let mut inner = self.lock();
                    if inner.generation == generation
                        && inner.state == ConnectionState::Connecting
                    {
                        inner.state = ConnectionState::Failed;
                        inner.last_failure = Some(status.clone());
                        true
                    } else {
                        false
                    }
                };
                if failed {
                    warn!("Connection to {} failed: {}", self.key, status);
                    self.emit(ConnectionEvent::Failed(status));
                }
            }
        }
    }

    fn on_bind_returned(&self, generation: u64, handle: LinkHandle) {
        enum Next {
            Wait,
            Connected,
            Stale,
        }

        let next = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                Next::Stale
            } else {
                inner.handle = Some(handle);
                if inner.connected_early {
                    inner.state = ConnectionState::Connected;
                    inner.last_failure = None;
                    Next::Connected
                } else {
                    Next::Wait
                }
            }
        };

        match next {
            Next::Wait => debug!("Bind for {} returned {}; awaiting link", self.key, handle),
            Next::Connected => {
                info!("Connected to {} over {}", self.key, handle);
                self.emit(ConnectionEvent::Connected);
            }
            Next::Stale => {
                debug!("Releasing late {} for {}", handle, self.key);
                self.transport.unbind(handle);
            }
        }
    }

    pub(crate) fn on_link_connected(&self, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                debug!("Ignoring stale connected event for {}", self.key);
                return;
            }
            if inner.handle.is_none() {
                // bind has not returned yet; it finishes the transition
                inner.connected_early = true;
                return;
            }
            inner.state = ConnectionState::Connected;
            inner.last_failure = None;
        }
        info!("Connected to {}", self.key);
        self.emit(ConnectionEvent::Connected);
    }

    pub(crate) fn on_link_disconnected(&self, generation: u64, reason: TransportError) {
        let (event, pending, handle) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!("Ignoring stale disconnect for {}: {}", self.key, reason);
                return;
            }
            match inner.state {
                ConnectionState::Connected => {
                    let status = Status::disconnected(reason.to_string());
                    inner.state = ConnectionState::Suspended;
                    inner.last_failure = Some(status.clone());
                    inner.early_replies.clear();
                    let pending: Vec<_> = inner.pending.drain(..).collect();
                    (ConnectionEvent::Suspended(status), pending, inner.handle.take())
                }
                ConnectionState::Connecting => {
                    let status = bind_failure(&reason);
                    inner.state = ConnectionState::Failed;
                    inner.last_failure = Some(status.clone());
                    (ConnectionEvent::Failed(status), Vec::new(), inner.handle.take())
                }
                _ => {
                    debug!("Ignoring disconnect for {} in state {}", self.key, inner.state);
                    return;
                }
            }
        };

        match &event {
            ConnectionEvent::Suspended(status) => warn!(
                "Link to {} dropped, failing {} in-flight operation(s): {}",
                self.key,
                pending.len(),
                status
            ),
            ConnectionEvent::Failed(status) => {
                warn!("Connection to {} failed: {}", self.key, status)
            }
            _ => {}
        }

        if let ConnectionEvent::Suspended(status) = &event {
            fail_all(pending, status);
        }
        if let Some(handle) = handle {
            self.transport.unbind(handle);
        }
        self.emit(event);
    }

    pub(crate) fn on_link_message(&self, generation: u64, id: CorrelationId, reply: Reply) {
        let waiting = {
            let mut inner = self.lock();
            if inner.generation != generation {
                warn!("Dropping reply {} from a stale link to {}", id, self.key);
                return;
            }
            match inner.pending.iter().position(|(pending_id, _)| *pending_id == id) {
                Some(index) => inner.pending.remove(index).map(|(_, result)| result),
                None if inner.posting > 0 => {
                    inner.early_replies.insert(id, reply);
                    return;
                }
                None => {
                    warn!("Dropping reply for unknown correlation id {} on {}", id, self.key);
                    return;
                }
            }
        };

        if let Some(result) = waiting {
            let _ = result.complete(reply);
        }
    }

    /// Post a request and get a pending result for its reply
    ///
    /// Only valid while connected; otherwise the result is already failed with
    /// `DISCONNECTED`. Queuing until the link is up is the façade's job.
    pub fn send(&self, payload: Bytes) -> PendingResult<Bytes> {
        let (handle, generation) = {
            let mut inner = self.lock();
            match (inner.state, inner.handle) {
                (ConnectionState::Connected, Some(handle)) => {
                    inner.posting += 1;
                    (handle, inner.generation)
                }
                (state, _) => {
                    debug!("Send on {} rejected in state {}", self.key, state);
                    return PendingResult::for_failure(Status::disconnected(format!(
                        "connection to {} is {}",
                        self.key, state
                    )));
                }
            }
        };

        let result = PendingResult::new();
        let posted = self.transport.post_message(handle, payload);

        let outcome = {
            let mut inner = self.lock();
            inner.posting -= 1;
            let outcome = match posted {
                Ok(id) => {
                    if let Some(reply) = inner.early_replies.remove(&id) {
                        Some(reply)
                    } else if inner.generation != generation
                        || inner.state != ConnectionState::Connected
                    {
                        Some(Err(Status::disconnected(format!(
                            "link to {} dropped while posting",
                            self.key
                        ))))
                    } else {
                        inner.pending.push_back((id, result.clone()));
                        None
                    }
                }
                Err(err) => Some(Err(Status::from(&err))),
            };
            if inner.posting == 0 && !inner.early_replies.is_empty() {
                warn!(
                    "Dropping {} unclaimed reply(ies) on {}",
                    inner.early_replies.len(),
                    self.key
                );
                inner.early_replies.clear();
            }
            outcome
        };

        if let Some(reply) = outcome {
            let _ = result.complete(reply);
        }
        result
    }

    /// Release the link and return to idle
    ///
    /// Idempotent. In-flight operations fail with `CANCELLED`; a bind still in
    /// flight is abandoned and its handle released when it shows up.
    pub fn disconnect(&self) {
        if self.release_link() {
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Disconnect for good: later `connect` calls are refused
    ///
    /// Subscribers always get a `Disconnected` event, even if the link was
    /// already idle. Used when the owning host shuts down.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        info!("Closing connection to {}", self.key);
        self.release_link();
        self.emit(ConnectionEvent::Disconnected);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Move to idle, failing in-flight operations; false if already idle
    fn release_link(&self) -> bool {
        let (pending, handle) = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Idle && inner.handle.is_none() {
                debug!("Disconnect of {} ignored: already idle", self.key);
                return false;
            }
            inner.state = ConnectionState::Idle;
            inner.generation += 1;
            inner.connected_early = false;
            inner.early_replies.clear();
            let pending: Vec<_> = inner.pending.drain(..).collect();
            (pending, inner.handle.take())
        };

        info!(
            "Disconnecting from {} ({} in-flight operation(s))",
            self.key,
            pending.len()
        );
        fail_all(
            pending,
            &Status::cancelled().with_message(format!("connection to {} was closed", self.key)),
        );
        if let Some(handle) = handle {
            self.transport.unbind(handle);
        }
        true
    }

    /// Register a listener for state changes
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        Self::add_listener(&mut inner, Arc::new(listener))
    }

    fn add_listener(inner: &mut Inner, listener: Listener) -> ListenerId {
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        id
    }

    /// Remove a listener; false if it was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        inner.listeners.len() != before
    }

    /// One-shot subscription resolved by the next terminal event of the
    /// current attempt
    ///
    /// Already resolved when the connection is up. Does not start a connect.
    pub fn when_connected(&self) -> PendingResult<()> {
        let result = PendingResult::new();
        let mut inner = self.lock();
        if inner.state == ConnectionState::Connected {
            drop(inner);
            let _ = result.set_result(());
            return result;
        }

        let id = ListenerId(inner.next_listener);
        let waiter = result.clone();
        let connection = self.me.clone();
        let listener: Listener = Arc::new(move |event: &ConnectionEvent| {
            if waiter.is_done() {
                return;
            }
            let outcome = match event {
                ConnectionEvent::Connected => Ok(()),
                ConnectionEvent::Failed(status) | ConnectionEvent::Suspended(status) => {
                    Err(status.clone())
                }
                ConnectionEvent::Disconnected => Err(Status::cancelled()
                    .with_message("connection was closed before it came up")),
            };
            let _ = waiter.complete(outcome);
            if let Some(connection) = connection.upgrade() {
                connection.unsubscribe(id);
            }
        });
        Self::add_listener(&mut inner, listener);
        result
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn emit(&self, event: ConnectionEvent) {
        let listeners: Vec<Listener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }

        let key = self.key.to_string();
        self.context.execute(move || {
            for listener in listeners {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                    error!(
                        "Connection listener for {} panicked on {:?}: {}",
                        key,
                        event,
                        panic_message(panic.as_ref())
                    );
                }
            }
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let pending: Vec<_> = inner.pending.drain(..).collect();
        let handle = inner.handle.take();
        fail_all(
            pending,
            &Status::cancelled().with_message("connection was dropped"),
        );
        if let Some(handle) = handle {
            self.transport.unbind(handle);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("state", &snapshot.state)
            .field("pending_operations", &snapshot.pending_operations)
            .finish()
    }
}

/// Status of a bind attempt that ended before the link came up
fn bind_failure(err: &TransportError) -> Status {
    match err {
        TransportError::ProviderNotFound(_) => Status::from(err),
        _ => Status::connection_failed(err.to_string()),
    }
}

fn fail_all(pending: Vec<(CorrelationId, PendingResult<Bytes>)>, status: &Status) {
    for (_, result) in pending {
        let _ = result.set_failure(status.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{BindMode, LoopbackTransport, ReplyMode};
    use crate::registry::{ApiIdentity, ApiOptions, HostContext};
    use conduit_core_pending::StatusCode;
    use std::sync::mpsc;

    fn key() -> ConnectionKey {
        ConnectionKey::new(
            ApiIdentity::new("echo"),
            ApiOptions::new(),
            HostContext::new("test-host"),
        )
    }

    fn connection(transport: &Arc<LoopbackTransport>) -> Arc<Connection> {
        Connection::new(key(), transport.clone(), ExecutionContext::Immediate)
    }

    fn record_events(connection: &Connection) -> mpsc::Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        connection.subscribe(move |event| {
            let _ = tx.lock().unwrap().send(event.clone());
        });
        rx
    }

    #[test]
    fn test_connected_during_bind() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);
        let events = record_events(&connection);

        connection.connect();
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Connected);
    }

    #[test]
    fn test_connect_twice_binds_once() {
        let transport = Arc::new(LoopbackTransport::echo("echo").with_bind_mode(BindMode::Manual));
        let connection = connection(&transport);

        connection.connect();
        connection.connect();
        assert_eq!(transport.bind_count(), 1);
        assert_eq!(connection.state(), ConnectionState::Connecting);

        assert!(transport.accept_bind());
        connection.connect();
        assert_eq!(transport.bind_count(), 1);
        assert!(connection.is_connected());
    }

    #[test]
    fn test_send_requires_connection() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);

        let reply = connection.send(Bytes::from_static(b"ping"));
        assert_eq!(reply.wait().unwrap_err().code(), StatusCode::Disconnected);
        assert!(transport.posted().is_empty());
    }

    #[test]
    fn test_reply_delivered_inside_post_is_claimed() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);
        connection.connect();

        let reply = connection.send(Bytes::from_static(b"ping"));
        assert_eq!(reply.wait(), Ok(Bytes::from_static(b"ping")));
        assert_eq!(connection.snapshot().pending_operations, 0);
    }

    #[test]
    fn test_manual_reply_correlates() {
        let transport =
            Arc::new(LoopbackTransport::echo("echo").with_reply_mode(ReplyMode::Manual));
        let connection = connection(&transport);
        connection.connect();

        let first = connection.send(Bytes::from_static(b"one"));
        let second = connection.send(Bytes::from_static(b"two"));
        assert_eq!(connection.snapshot().pending_operations, 2);

        let ids = transport.held();
        assert!(transport.respond(ids[1]));
        assert_eq!(second.wait(), Ok(Bytes::from_static(b"two")));
        assert!(!first.is_done());

        assert!(transport.respond(ids[0]));
        assert_eq!(first.wait(), Ok(Bytes::from_static(b"one")));
    }

    #[test]
    fn test_link_drop_suspends_and_fails_in_flight() {
        let transport =
            Arc::new(LoopbackTransport::echo("echo").with_reply_mode(ReplyMode::Manual));
        let connection = connection(&transport);
        let events = record_events(&connection);
        connection.connect();
        let _ = events.try_recv();

        let reply = connection.send(Bytes::from_static(b"slow"));
        assert_eq!(transport.drop_links("provider crashed"), 1);

        assert_eq!(reply.wait().unwrap_err().code(), StatusCode::Disconnected);
        let snapshot = connection.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Suspended);
        assert_eq!(snapshot.pending_operations, 0);
        assert_eq!(
            snapshot.last_failure.map(|s| s.code()),
            Some(StatusCode::Disconnected)
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            ConnectionEvent::Suspended(_)
        ));
        assert_eq!(transport.unbind_count(), 1);
    }

    #[test]
    fn test_no_automatic_reconnect() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);
        connection.connect();
        transport.drop_links("gone");

        assert_eq!(connection.state(), ConnectionState::Suspended);
        assert_eq!(transport.bind_count(), 1);

        connection.connect();
        assert!(connection.is_connected());
        assert_eq!(transport.bind_count(), 2);
    }

    #[test]
    fn test_rejected_bind_fails() {
        let transport = Arc::new(LoopbackTransport::echo("echo").with_bind_mode(BindMode::Reject));
        let connection = connection(&transport);
        let events = record_events(&connection);

        connection.connect();
        assert_eq!(connection.state(), ConnectionState::Failed);
        match events.try_recv().unwrap() {
            ConnectionEvent::Failed(status) => {
                assert_eq!(status.code(), StatusCode::ConnectionFailed)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_missing_provider_is_unavailable() {
        let transport =
            Arc::new(LoopbackTransport::echo("echo").with_bind_mode(BindMode::Unavailable));
        let connection = connection(&transport);
        connection.connect();

        let snapshot = connection.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Failed);
        assert_eq!(
            snapshot.last_failure.unwrap().code(),
            StatusCode::ProviderUnavailable
        );
    }

    #[test]
    fn test_disconnect_is_idempotent_and_cancels_in_flight() {
        let transport =
            Arc::new(LoopbackTransport::echo("echo").with_reply_mode(ReplyMode::Manual));
        let connection = connection(&transport);
        connection.connect();
        let reply = connection.send(Bytes::from_static(b"pending"));
        let id = transport.held()[0];

        connection.disconnect();
        connection.disconnect();
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert_eq!(reply.wait().unwrap_err().code(), StatusCode::Cancelled);
        assert_eq!(transport.unbind_count(), 1);

        // The provider answering afterwards changes nothing
        assert!(!transport.respond(id));
        assert_eq!(reply.wait().unwrap_err().code(), StatusCode::Cancelled);
    }

    #[test]
    fn test_disconnect_during_bind_abandons_attempt() {
        let transport = Arc::new(LoopbackTransport::echo("echo").with_bind_mode(BindMode::Manual));
        let connection = connection(&transport);
        connection.connect();
        assert_eq!(transport.active_links(), 1);

        connection.disconnect();
        assert_eq!(transport.active_links(), 0);
        assert!(!transport.accept_bind());
        assert_eq!(connection.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_closed_connection_refuses_to_bind() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);
        let events = record_events(&connection);
        connection.connect();
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Connected);

        connection.close();
        assert!(connection.is_closed());
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Disconnected);

        connection.connect();
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert_eq!(transport.bind_count(), 1);
        assert_eq!(transport.active_links(), 0);

        // A second close is silent
        connection.close();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_close_notifies_even_when_idle() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);
        let events = record_events(&connection);

        connection.close();
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Disconnected);
        assert_eq!(transport.unbind_count(), 0);
    }

    #[test]
    fn test_stale_link_events_are_ignored() {
        let transport = Arc::new(LoopbackTransport::echo("echo").with_bind_mode(BindMode::Manual));
        let connection = connection(&transport);
        connection.connect();
        let stale = LinkEvents::new(Arc::downgrade(&connection), 1);

        connection.disconnect();
        connection.connect();
        stale.connected();
        stale.disconnected(TransportError::LinkClosed("old link".into()));
        assert_eq!(connection.state(), ConnectionState::Connecting);

        assert!(transport.accept_bind());
        assert!(connection.is_connected());
    }

    #[test]
    fn test_when_connected_is_one_shot() {
        let transport = Arc::new(LoopbackTransport::echo("echo").with_bind_mode(BindMode::Manual));
        let connection = connection(&transport);
        let waiter = connection.when_connected();
        assert_eq!(connection.listener_count(), 1);

        connection.connect();
        assert!(!waiter.is_done());
        transport.accept_bind();

        assert_eq!(waiter.wait(), Ok(()));
        assert_eq!(connection.listener_count(), 0);
        assert_eq!(connection.when_connected().try_result(), Some(Ok(())));
    }

    #[test]
    fn test_when_connected_sees_failure() {
        let transport = Arc::new(LoopbackTransport::echo("echo").with_bind_mode(BindMode::Manual));
        let connection = connection(&transport);
        let waiter = connection.when_connected();

        connection.connect();
        transport.reject_bind("user declined");
        assert_eq!(waiter.wait().unwrap_err().code(), StatusCode::ConnectionFailed);
        assert_eq!(connection.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);
        connection.subscribe(|_| panic!("listener bug"));
        let events = record_events(&connection);

        connection.connect();
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Connected);
    }

    #[test]
    fn test_unsubscribe() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);
        let id = connection.subscribe(|_| {});
        assert!(connection.unsubscribe(id));
        assert!(!connection.unsubscribe(id));
    }

    #[test]
    fn test_drop_releases_link() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let connection = connection(&transport);
        connection.connect();
        assert_eq!(transport.active_links(), 1);

        drop(connection);
        assert_eq!(transport.active_links(), 0);
    }
}
