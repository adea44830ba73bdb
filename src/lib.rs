/*!
 * Conduit - client-side connections to out-of-process API providers
 *
 * Façades queue calls while a shared connection comes up, hand back
 * [`PendingResult`] handles right away, and deliver outcomes on a configured
 * execution context. This crate wires the pieces together for one process:
 *
 * - [`ClientConfig`]: TOML configuration with defaults
 * - [`ClientHost`]: owns the provider registry and dispatcher threads
 * - [`logging`]: tracing subscriber setup
 * - [`demo`]: a scripted lifecycle run over the loopback transport
 *
 * ```no_run
 * use bytes::Bytes;
 * use conduit::{ApiOptions, ClientConfig, ClientHost, LoopbackTransport};
 * use std::sync::Arc;
 *
 * let host = ClientHost::new(ClientConfig::default())?;
 * let provider = Arc::new(LoopbackTransport::echo("echo"));
 * host.register("echo", provider.factory());
 *
 * let client = host.client("echo", ApiOptions::new())?;
 * let reply = host.await_result(&client.send(Bytes::from_static(b"hello")))?;
 * assert_eq!(reply, Bytes::from_static(b"hello"));
 * # Ok::<(), conduit::ConduitError>(())
 * ```
 */

pub mod config;
pub mod demo;
pub mod error;
pub mod host;
pub mod logging;

// Re-export commonly used types
pub use config::{ClientConfig, ContextMode, LogLevel};
pub use error::{ConduitError, Result};
pub use host::ClientHost;

pub use conduit_connect::{
    ApiIdentity, ApiOptions, BindMode, ClientFacade, Connection, ConnectionKey,
    ConnectionSnapshot, ConnectionState, HostContext, LoopbackTransport, ProviderRegistry,
    ReplyMode, Transport,
};
pub use conduit_core_pending::{
    when_all, when_all_settled, Dispatcher, ExecutionContext, PendingResult, Status, StatusCode,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
