//! In-process loopback transport
//!
//! Answers requests with a handler function instead of talking to another
//! process. Every step a real provider would take asynchronously can be held
//! back and released by hand, which makes it the transport of choice for
//! tests and the CLI demo.

use crate::error::TransportError;
use crate::registry::ConnectionKey;
use crate::transport::{CorrelationId, LinkEvents, LinkHandle, Reply, Transport};
use bytes::Bytes;
use conduit_core_pending::Status;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Produces the reply for one request
pub type Handler = Arc<dyn Fn(&Bytes) -> Reply + Send + Sync + 'static>;

/// How `bind` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    /// The link comes up from inside `bind`
    #[default]
    Immediate,
    /// The link stays pending until `accept_bind` or `reject_bind`
    Manual,
    /// `bind` fails with `BindRejected`
    Reject,
    /// `bind` fails with `ProviderNotFound`
    Unavailable,
}

/// How replies are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// From inside `post_message`, before it returns the correlation id
    #[default]
    Immediate,
    /// From a separate thread after the given delay
    Threaded(Duration),
    /// Held until `respond` or `respond_with`
    Manual,
}

/// A message recorded by the loopback transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub handle: LinkHandle,
    pub id: CorrelationId,
    pub payload: Bytes,
}

#[derive(Default)]
struct LoopbackState {
    /// Links in bind order
    links: BTreeMap<LinkHandle, LinkEvents>,
    /// Links waiting for `accept_bind` / `reject_bind`, oldest first
    pending_binds: Vec<LinkHandle>,
    held: BTreeMap<CorrelationId, (LinkHandle, Bytes)>,
    posted: Vec<PostedMessage>,
    binds: usize,
    unbinds: usize,
}

/// Transport that serves requests in-process
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use conduit_connect::{LoopbackTransport, ReplyMode};
///
/// let transport = LoopbackTransport::new("upper", |request: &Bytes| {
///     Ok(Bytes::from(request.to_ascii_uppercase()))
/// })
/// .with_reply_mode(ReplyMode::Manual);
/// assert_eq!(transport.name(), "upper");
/// ```
pub struct LoopbackTransport {
    name: String,
    handler: Handler,
    bind_mode: Mutex<BindMode>,
    reply_mode: Mutex<ReplyMode>,
    state: Mutex<LoopbackState>,
    next_handle: AtomicU64,
    next_id: AtomicU64,
}

impl LoopbackTransport {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Bytes) -> Reply + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            bind_mode: Mutex::new(BindMode::default()),
            reply_mode: Mutex::new(ReplyMode::default()),
            state: Mutex::new(LoopbackState::default()),
            next_handle: AtomicU64::new(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Replies with the request payload
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, |request: &Bytes| Ok(request.clone()))
    }

    pub fn with_bind_mode(self, mode: BindMode) -> Self {
        self.set_bind_mode(mode);
        self
    }

    pub fn with_reply_mode(self, mode: ReplyMode) -> Self {
        self.set_reply_mode(mode);
        self
    }

    pub fn set_bind_mode(&self, mode: BindMode) {
        *self
            .bind_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = mode;
    }

    pub fn set_reply_mode(&self, mode: ReplyMode) {
        *self
            .reply_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = mode;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A registry factory handing out this transport for every key
    pub fn factory(
        self: &Arc<Self>,
    ) -> impl Fn(&ConnectionKey) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync + 'static
    {
        let transport = self.clone();
        move |key: &ConnectionKey| {
            debug!("Loopback '{}' serving {}", transport.name, key);
            Ok(transport.clone() as Arc<dyn Transport>)
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind_mode(&self) -> BindMode {
        *self
            .bind_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reply_mode(&self) -> ReplyMode {
        *self
            .reply_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bring up the oldest pending bind; false if none is pending
    pub fn accept_bind(&self) -> bool {
        let events = {
            let mut state = self.lock();
            if state.pending_binds.is_empty() {
                return false;
            }
            let handle = state.pending_binds.remove(0);
            state.links.get(&handle).cloned()
        };
        match events {
            Some(events) => {
                events.connected();
                true
            }
            None => false,
        }
    }

    /// Reject the oldest pending bind; false if none is pending
    pub fn reject_bind(&self, reason: &str) -> bool {
        let events = {
            let mut state = self.lock();
            if state.pending_binds.is_empty() {
                return false;
            }
            let handle = state.pending_binds.remove(0);
            state.links.remove(&handle)
        };
        match events {
            Some(events) => {
                events.disconnected(TransportError::BindRejected(reason.to_string()));
                true
            }
            None => false,
        }
    }

    /// Drop every live link as if the provider process died
    ///
    /// Returns how many links were dropped.
    pub fn drop_links(&self, reason: &str) -> usize {
        let dropped: Vec<LinkEvents> = {
            let mut state = self.lock();
            state.pending_binds.clear();
            state.held.clear();
            std::mem::take(&mut state.links).into_values().collect()
        };
        warn!(
            "Loopback '{}' dropping {} link(s): {}",
            self.name,
            dropped.len(),
            reason
        );
        let count = dropped.len();
        for events in dropped {
            events.disconnected(TransportError::LinkClosed(reason.to_string()));
        }
        count
    }

    /// Answer a held request with the handler's reply
    pub fn respond(&self, id: CorrelationId) -> bool {
        let held = self.take_held(id);
        match held {
            Some((events, payload)) => {
                events.message(id, (self.handler)(&payload));
                true
            }
            None => false,
        }
    }

    /// Answer a held request with an explicit reply
    pub fn respond_with(&self, id: CorrelationId, reply: Reply) -> bool {
        match self.take_held(id) {
            Some((events, _)) => {
                events.message(id, reply);
                true
            }
            None => false,
        }
    }

    fn take_held(&self, id: CorrelationId) -> Option<(LinkEvents, Bytes)> {
        let mut state = self.lock();
        let (handle, payload) = state.held.remove(&id)?;
        let events = state.links.get(&handle).cloned()?;
        Some((events, payload))
    }

    /// Correlation ids of held requests, oldest first
    pub fn held(&self) -> Vec<CorrelationId> {
        self.lock().held.keys().copied().collect()
    }

    /// Every message posted so far, in order
    pub fn posted(&self) -> Vec<PostedMessage> {
        self.lock().posted.clone()
    }

    pub fn posted_payloads(&self) -> Vec<Bytes> {
        self.lock()
            .posted
            .iter()
            .map(|message| message.payload.clone())
            .collect()
    }

    pub fn bind_count(&self) -> usize {
        self.lock().binds
    }

    pub fn unbind_count(&self) -> usize {
        self.lock().unbinds
    }

    /// Links bound (pending or up) and not yet released
    pub fn active_links(&self) -> usize {
        self.lock().links.len()
    }
}

impl Transport for LoopbackTransport {
    fn bind(&self, events: LinkEvents) -> Result<LinkHandle, TransportError> {
        let mode = self.bind_mode();
        {
            let mut state = self.lock();
            state.binds += 1;
        }
        match mode {
            BindMode::Reject => {
                return Err(TransportError::BindRejected(format!(
                    "loopback '{}' refused the bind",
                    self.name
                )))
            }
            BindMode::Unavailable => {
                return Err(TransportError::ProviderNotFound(format!(
                    "loopback '{}' is not installed",
                    self.name
                )))
            }
            BindMode::Immediate | BindMode::Manual => {}
        }

        let handle = LinkHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.lock();
            state.links.insert(handle, events.clone());
            if mode == BindMode::Manual {
                state.pending_binds.push(handle);
            }
        }
        debug!("Loopback '{}' bound {}", self.name, handle);

        if mode == BindMode::Immediate {
            events.connected();
        }
        Ok(handle)
    }

    fn unbind(&self, handle: LinkHandle) {
        let mut state = self.lock();
        state.unbinds += 1;
        state.pending_binds.retain(|pending| *pending != handle);
        state.held.retain(|_, (held_handle, _)| *held_handle != handle);
        if state.links.remove(&handle).is_some() {
            debug!("Loopback '{}' unbound {}", self.name, handle);
        }
    }

    fn post_message(
        &self,
        handle: LinkHandle,
        payload: Bytes,
    ) -> Result<CorrelationId, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mode = self.reply_mode();
        let events = {
            let mut state = self.lock();
            let events = state
                .links
                .get(&handle)
                .cloned()
                .ok_or_else(|| TransportError::LinkClosed(format!("{} is not bound", handle)))?;
            state.posted.push(PostedMessage {
                handle,
                id,
                payload: payload.clone(),
            });
            if mode == ReplyMode::Manual {
                state.held.insert(id, (handle, payload.clone()));
            }
            events
        };

        match mode {
            ReplyMode::Immediate => events.message(id, (self.handler)(&payload)),
            ReplyMode::Threaded(delay) => {
                let handler = self.handler.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    events.message(id, handler(&payload));
                });
            }
            ReplyMode::Manual => {}
        }
        Ok(id)
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("name", &self.name)
            .field("bind_mode", &self.bind_mode())
            .field("reply_mode", &self.reply_mode())
            .field("active_links", &self.active_links())
            .finish()
    }
}

/// Handler that fails every request with a provider status
pub fn failing_handler(remote_code: i32, message: &str) -> Handler {
    let message = message.to_string();
    Arc::new(move |_: &Bytes| Err(Status::remote(remote_code, message.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HostContext;

    // LinkEvents need a connection; these exercise the bookkeeping only
    fn orphan_events() -> LinkEvents {
        LinkEvents::new(std::sync::Weak::new(), 1)
    }

    #[test]
    fn test_manual_bind_bookkeeping() {
        let transport = LoopbackTransport::echo("echo").with_bind_mode(BindMode::Manual);
        let handle = transport.bind(orphan_events()).unwrap();
        assert_eq!(transport.active_links(), 1);

        transport.unbind(handle);
        transport.unbind(handle);
        assert_eq!(transport.active_links(), 0);
        assert_eq!(transport.unbind_count(), 2);
        assert!(!transport.accept_bind());
    }

    #[test]
    fn test_post_on_unknown_handle_fails() {
        let transport = LoopbackTransport::echo("echo");
        let err = transport
            .post_message(LinkHandle::new(99), Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, TransportError::LinkClosed(_)));
        assert!(transport.posted().is_empty());
    }

    #[test]
    fn test_posted_log_keeps_order() {
        let transport = LoopbackTransport::echo("echo").with_reply_mode(ReplyMode::Manual);
        let handle = transport.bind(orphan_events()).unwrap();
        for payload in ["a", "b", "c"] {
            transport
                .post_message(handle, Bytes::from(payload))
                .unwrap();
        }
        assert_eq!(
            transport.posted_payloads(),
            vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
        );
        assert_eq!(transport.held().len(), 3);
    }

    #[test]
    fn test_failing_handler() {
        let handler = failing_handler(4, "quota");
        let reply = handler(&Bytes::new());
        assert_eq!(reply.unwrap_err().remote_code(), Some(4));
    }

    #[test]
    fn test_factory_shares_transport() {
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        let factory = transport.factory();
        let key = ConnectionKey::new("echo".into(), Default::default(), HostContext::new("app"));
        assert!(factory(&key).is_ok());
        assert_eq!(Arc::strong_count(&transport), 2);
    }
}
