//! Conduit Connect: provider connections and deferred-call façades
//!
//! This crate is the engine underneath every Conduit API surface: connect to
//! a provider, run deferred calls against it, resolve their results.
//!
//! # Architecture
//!
//! - **Transport**: narrow boundary to whatever moves bytes to the provider
//!   (`bind`, `unbind`, `post_message`)
//! - **Connection**: lifecycle of one link, request/reply correlation and
//!   state-change events
//! - **ProviderRegistry**: one connection per (API, options, host) key,
//!   shared by reference counting
//! - **ClientFacade**: FIFO queue of deferred calls that drains once the
//!   connection is up and fails cleanly when it cannot come up
//! - **LoopbackTransport**: in-process provider for tests and demos
//!
//! ```text
//! caller ──schedule()──▶ ClientFacade ──▶ Connection ──▶ Transport ──▶ provider
//!    ▲                        │                │
//!    └──── PendingResult ◀────┴── Dispatcher ◀─┘ (events, replies)
//! ```
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use conduit_connect::{
//!     ApiIdentity, ApiOptions, ClientFacade, HostContext, LoopbackTransport, ProviderRegistry,
//! };
//! use std::sync::Arc;
//!
//! let registry = ProviderRegistry::new();
//! let provider = Arc::new(LoopbackTransport::echo("echo"));
//! registry.register(ApiIdentity::new("echo"), provider.factory());
//!
//! let client = ClientFacade::new(
//!     &registry,
//!     ApiIdentity::new("echo"),
//!     ApiOptions::new(),
//!     HostContext::new("app"),
//! )
//! .unwrap();
//!
//! let reply = client.send(Bytes::from_static(b"ping"));
//! assert_eq!(reply.wait(), Ok(Bytes::from_static(b"ping")));
//! registry.shutdown();
//! ```

pub mod connection;
pub mod error;
pub mod facade;
pub mod loopback;
pub mod registry;
pub mod transport;

pub use connection::{
    Connection, ConnectionEvent, ConnectionSnapshot, ConnectionState, ListenerId,
};
pub use error::{CallError, ConnectError, TransportError};
pub use facade::ClientFacade;
pub use loopback::{failing_handler, BindMode, Handler, LoopbackTransport, PostedMessage, ReplyMode};
pub use registry::{
    ApiIdentity, ApiOptions, ConnectionFactory, ConnectionKey, HostContext, ProviderRegistry,
};
pub use transport::{CorrelationId, LinkEvents, LinkHandle, Reply, Transport};

// Types every façade implementation needs alongside the ones above
pub use conduit_core_pending::{ExecutionContext, PendingResult, Status, StatusCode};
