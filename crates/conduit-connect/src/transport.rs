//! Boundary with the byte-level transport
//!
//! A transport moves opaque payloads between this process and a provider. It
//! knows nothing about pending results, queues or the registry: the
//! [`Connection`](crate::Connection) correlates replies back to callers.

use crate::connection::Connection;
use crate::error::TransportError;
use bytes::Bytes;
use conduit_core_pending::Status;
use std::fmt;
use std::sync::Weak;

/// Identifier a transport assigns to each posted message; echoed on its reply
pub type CorrelationId = u64;

/// Outcome of a remote call as delivered by the transport
pub type Reply = Result<Bytes, Status>;

/// Opaque handle to one bound link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(u64);

impl LinkHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// A way to reach one provider
///
/// Implementations may invoke the [`LinkEvents`] they are given from any
/// thread, including from inside `bind` and `post_message`.
pub trait Transport: Send + Sync {
    /// Start establishing a link
    ///
    /// Returning `Ok` means the attempt is under way; the link is usable once
    /// `events.connected()` fires. An asynchronous rejection is reported through
    /// `events.disconnected(..)`.
    fn bind(&self, events: LinkEvents) -> Result<LinkHandle, TransportError>;

    /// Release a link; unknown or already released handles are ignored
    fn unbind(&self, handle: LinkHandle);

    /// Send one request; its reply arrives later through `events.message(..)`
    fn post_message(&self, handle: LinkHandle, payload: Bytes)
        -> Result<CorrelationId, TransportError>;
}

/// Callbacks a transport uses to report link activity
///
/// Holds a weak reference to its connection plus the bind attempt it belongs
/// to. Events for an attempt the connection already left behind are ignored.
#[derive(Clone)]
pub struct LinkEvents {
    connection: Weak<Connection>,
    generation: u64,
}

impl LinkEvents {
    pub(crate) fn new(connection: Weak<Connection>, generation: u64) -> Self {
        Self {
            connection,
            generation,
        }
    }

    /// The link is established
    pub fn connected(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_link_connected(self.generation);
        }
    }

    /// The link was rejected or dropped
    pub fn disconnected(&self, reason: TransportError) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_link_disconnected(self.generation, reason);
        }
    }

    /// A reply for a previously posted message
    pub fn message(&self, id: CorrelationId, reply: Reply) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_link_message(self.generation, id, reply);
        }
    }

    /// False once the owning connection was dropped
    pub fn is_live(&self) -> bool {
        self.connection.strong_count() > 0
    }
}

impl fmt::Debug for LinkEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEvents")
            .field("generation", &self.generation)
            .field("live", &self.is_live())
            .finish()
    }
}
