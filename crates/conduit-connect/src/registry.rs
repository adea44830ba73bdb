//! ProviderRegistry: one connection per (API, options, host) key
//!
//! The registry is an explicit object owned by the host runtime and handed to
//! every façade. Options are compared by value, so independent façades asking
//! for the same API with equal options multiplex one link.

use crate::connection::{Connection, ConnectionSnapshot};
use crate::error::{ConnectError, TransportError};
use crate::transport::Transport;
use conduit_core_pending::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Logical name of a remote capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiIdentity(String);

impl ApiIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApiIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApiIdentity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Caller-supplied options, compared and hashed by value
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiOptions(BTreeMap<String, String>);

impl ApiOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ApiOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

/// The process-side context a connection belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostContext {
    pub name: String,
    /// Tag attributed to calls made from this context, if any
    pub attribution_tag: Option<String>,
}

impl HostContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attribution_tag: None,
        }
    }

    pub fn with_attribution_tag(mut self, tag: impl Into<String>) -> Self {
        self.attribution_tag = Some(tag.into());
        self
    }
}

/// Identity of a shared connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub api: ApiIdentity,
    pub options: ApiOptions,
    pub host: HostContext,
}

impl ConnectionKey {
    pub fn new(api: ApiIdentity, options: ApiOptions, host: HostContext) -> Self {
        Self { api, options, host }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api)?;
        if !self.options.is_empty() {
            write!(f, "[{}]", self.options)?;
        }
        write!(f, "@{}", self.host.name)?;
        if let Some(ref tag) = self.host.attribution_tag {
            write!(f, "#{}", tag)?;
        }
        Ok(())
    }
}

/// Builds the transport for a new connection
///
/// Called with the registry's connection table locked; implementations must
/// not call back into the registry.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, key: &ConnectionKey) -> Result<Arc<dyn Transport>, TransportError>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(&ConnectionKey) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync,
{
    fn create(&self, key: &ConnectionKey) -> Result<Arc<dyn Transport>, TransportError> {
        self(key)
    }
}

struct Entry {
    connection: Arc<Connection>,
    holders: usize,
    /// Handed out by `resolve`; kept until shutdown
    pinned: bool,
}

struct RegistryInner {
    factories: RwLock<HashMap<ApiIdentity, Arc<dyn ConnectionFactory>>>,
    connections: Mutex<HashMap<ConnectionKey, Entry>>,
    event_context: ExecutionContext,
    shut_down: AtomicBool,
}

/// Maps API identities to factories and keeps one connection per key
///
/// Cheap to clone; clones share the same tables.
///
/// # Example
///
/// ```
/// use conduit_connect::{
///     ApiIdentity, ApiOptions, HostContext, LoopbackTransport, ProviderRegistry,
/// };
/// use std::sync::Arc;
///
/// let registry = ProviderRegistry::new();
/// let provider = Arc::new(LoopbackTransport::echo("echo"));
/// registry.register(ApiIdentity::new("echo"), provider.factory());
///
/// let host = HostContext::new("app");
/// let a = registry.resolve(&ApiIdentity::new("echo"), &ApiOptions::new(), &host).unwrap();
/// let b = registry.resolve(&ApiIdentity::new("echo"), &ApiOptions::new(), &host).unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
#[derive(Clone)]
pub struct ProviderRegistry {
    inner: Arc<RegistryInner>,
}

impl ProviderRegistry {
    /// Registry whose connections deliver events on the resolving thread
    pub fn new() -> Self {
        Self::with_event_context(ExecutionContext::Immediate)
    }

    /// Registry whose connections deliver state events on `context`
    pub fn with_event_context(context: ExecutionContext) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                factories: RwLock::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                event_context: context,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn connections_lock(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Entry>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the factory for an API, replacing any previous one
    ///
    /// Existing connections keep the transport they were built with.
    pub fn register<F>(&self, api: ApiIdentity, factory: F)
    where
        F: ConnectionFactory + 'static,
    {
        info!("Registering provider for API '{}'", api);
        let mut factories = self
            .inner
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if factories.insert(api.clone(), Arc::new(factory)).is_some() {
            debug!("Replaced existing provider for API '{}'", api);
        }
    }

    pub fn unregister(&self, api: &ApiIdentity) -> bool {
        self.inner
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(api)
            .is_some()
    }

    pub fn is_registered(&self, api: &ApiIdentity) -> bool {
        self.inner
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(api)
    }

    /// Find or create the connection for a key
    ///
    /// Does not change the holder count; see [`acquire`](Self::acquire).
    /// Since untracked callers may still be using it, a resolved connection
    /// is never disconnected by `release` and lives until `shutdown`.
    pub fn resolve(
        &self,
        api: &ApiIdentity,
        options: &ApiOptions,
        host: &HostContext,
    ) -> Result<Arc<Connection>, ConnectError> {
        self.lookup(api, options, host, false)
    }

    /// Like `resolve`, but counts the caller as a holder of the connection
    pub fn acquire(
        &self,
        api: &ApiIdentity,
        options: &ApiOptions,
        host: &HostContext,
    ) -> Result<Arc<Connection>, ConnectError> {
        self.lookup(api, options, host, true)
    }

    fn lookup(
        &self,
        api: &ApiIdentity,
        options: &ApiOptions,
        host: &HostContext,
        hold: bool,
    ) -> Result<Arc<Connection>, ConnectError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ConnectError::ShutDown);
        }

        let key = ConnectionKey::new(api.clone(), options.clone(), host.clone());
        let mut connections = self.connections_lock();
        if let Some(entry) = connections.get_mut(&key) {
            debug!("Reusing connection for {}", key);
            if hold {
                entry.holders += 1;
            } else {
                entry.pinned = true;
            }
            return Ok(entry.connection.clone());
        }

        let factory = self
            .inner
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(api)
            .cloned()
            .ok_or_else(|| ConnectError::ProviderUnavailable(api.to_string()))?;

        let transport = factory.create(&key).map_err(|source| ConnectError::Factory {
            api: api.to_string(),
            source,
        })?;

        info!("Creating connection for {}", key);
        let connection = Connection::new(key.clone(), transport, self.inner.event_context.clone());
        connections.insert(
            key,
            Entry {
                connection: connection.clone(),
                holders: usize::from(hold),
                pinned: !hold,
            },
        );
        Ok(connection)
    }

    /// Give back a connection obtained with `acquire`
    ///
    /// When the last holder releases, the connection is disconnected and
    /// forgotten. Returns the remaining holder count.
    pub fn release(&self, connection: &Arc<Connection>) -> usize {
        let released = {
            let mut connections = self.connections_lock();
            let Some(entry) = connections.get_mut(connection.key()) else {
                debug!("Release of unknown connection {}", connection.key());
                return 0;
            };
            if !Arc::ptr_eq(&entry.connection, connection) {
                warn!("Release of a stale connection for {}", connection.key());
                return entry.holders;
            }
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders > 0 {
                return entry.holders;
            }
            if entry.pinned {
                debug!("Keeping resolved connection {}", connection.key());
                return 0;
            }
            connections.remove(connection.key())
        };

        if let Some(entry) = released {
            info!("Last holder released {}", entry.connection.key());
            entry.connection.disconnect();
        }
        0
    }

    /// Current holder count for a key
    pub fn holders(&self, key: &ConnectionKey) -> usize {
        self.connections_lock()
            .get(key)
            .map(|entry| entry.holders)
            .unwrap_or(0)
    }

    /// Keys and state snapshots of every live connection
    pub fn connections(&self) -> Vec<(ConnectionKey, ConnectionSnapshot)> {
        let connections: Vec<Arc<Connection>> = self
            .connections_lock()
            .values()
            .map(|entry| entry.connection.clone())
            .collect();
        let mut listing: Vec<_> = connections
            .into_iter()
            .map(|connection| (connection.key().clone(), connection.snapshot()))
            .collect();
        listing.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        listing
    }

    /// Close and forget every connection; later lookups fail
    ///
    /// Closed connections refuse to bind again, so callers still holding
    /// one cannot revive a link the registry no longer tracks.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<Entry> = self.connections_lock().drain().map(|(_, e)| e).collect();
        info!("Shutting down registry ({} connection(s))", entries.len());
        for entry in entries {
            entry.connection.close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("connections", &self.connections_lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;
    use crate::ConnectionState;

    fn registry_with_echo() -> (ProviderRegistry, Arc<LoopbackTransport>) {
        let registry = ProviderRegistry::new();
        let transport = Arc::new(LoopbackTransport::echo("echo"));
        registry.register(ApiIdentity::new("echo"), transport.factory());
        (registry, transport)
    }

    #[test]
    fn test_options_compare_by_value() {
        let a = ApiOptions::new().with("account", "alice").with("scope", "read");
        let b = ApiOptions::new().with("scope", "read").with("account", "alice");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "account=alice,scope=read");
        assert_eq!(a.get("scope"), Some("read"));
    }

    #[test]
    fn test_key_display() {
        let key = ConnectionKey::new(
            ApiIdentity::new("location"),
            ApiOptions::new().with("precise", "true"),
            HostContext::new("maps").with_attribution_tag("nav"),
        );
        assert_eq!(key.to_string(), "location[precise=true]@maps#nav");
    }

    #[test]
    fn test_unknown_api_is_unavailable() {
        let registry = ProviderRegistry::new();
        let err = registry
            .resolve(
                &ApiIdentity::new("missing"),
                &ApiOptions::new(),
                &HostContext::new("app"),
            )
            .unwrap_err();
        assert!(matches!(err, ConnectError::ProviderUnavailable(ref api) if api == "missing"));
    }

    #[test]
    fn test_distinct_keys_get_distinct_connections() {
        let (registry, _) = registry_with_echo();
        let api = ApiIdentity::new("echo");
        let host = HostContext::new("app");

        let plain = registry.resolve(&api, &ApiOptions::new(), &host).unwrap();
        let tuned = registry
            .resolve(&api, &ApiOptions::new().with("mode", "fast"), &host)
            .unwrap();
        let other_host = registry
            .resolve(&api, &ApiOptions::new(), &HostContext::new("widget"))
            .unwrap();

        assert!(!Arc::ptr_eq(&plain, &tuned));
        assert!(!Arc::ptr_eq(&plain, &other_host));
        assert_eq!(registry.connections().len(), 3);
    }

    #[test]
    fn test_factory_error_is_reported() {
        let registry = ProviderRegistry::new();
        registry.register(
            ApiIdentity::new("broken"),
            |_key: &ConnectionKey| -> Result<Arc<dyn Transport>, TransportError> {
                Err(TransportError::ProviderNotFound("not installed".into()))
            },
        );
        let err = registry
            .resolve(
                &ApiIdentity::new("broken"),
                &ApiOptions::new(),
                &HostContext::new("app"),
            )
            .unwrap_err();
        assert!(matches!(err, ConnectError::Factory { .. }));
    }

    #[test]
    fn test_last_release_disconnects() {
        let (registry, transport) = registry_with_echo();
        let api = ApiIdentity::new("echo");
        let host = HostContext::new("app");

        let first = registry.acquire(&api, &ApiOptions::new(), &host).unwrap();
        let second = registry.acquire(&api, &ApiOptions::new(), &host).unwrap();
        assert_eq!(registry.holders(first.key()), 2);
        first.connect();
        assert_eq!(transport.active_links(), 1);

        assert_eq!(registry.release(&first), 1);
        assert!(second.is_connected());

        assert_eq!(registry.release(&second), 0);
        assert_eq!(second.state(), ConnectionState::Idle);
        assert_eq!(transport.active_links(), 0);
        assert!(registry.connections().is_empty());

        // A fresh acquire builds a new connection
        let third = registry.acquire(&api, &ApiOptions::new(), &host).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_release_keeps_resolved_connection() {
        let (registry, transport) = registry_with_echo();
        let api = ApiIdentity::new("echo");
        let host = HostContext::new("app");

        let resolved = registry.resolve(&api, &ApiOptions::new(), &host).unwrap();
        resolved.connect();
        let held = registry.acquire(&api, &ApiOptions::new(), &host).unwrap();
        assert!(Arc::ptr_eq(&resolved, &held));

        assert_eq!(registry.release(&held), 0);
        assert!(resolved.is_connected());
        assert_eq!(transport.active_links(), 1);
        assert_eq!(registry.connections().len(), 1);

        // Still the one connection for the key
        let again = registry.acquire(&api, &ApiOptions::new(), &host).unwrap();
        assert!(Arc::ptr_eq(&resolved, &again));
    }

    #[test]
    fn test_shutdown_disconnects_everything() {
        let (registry, transport) = registry_with_echo();
        let host = HostContext::new("app");
        for mode in ["a", "b"] {
            let connection = registry
                .acquire(
                    &ApiIdentity::new("echo"),
                    &ApiOptions::new().with("mode", mode),
                    &host,
                )
                .unwrap();
            connection.connect();
        }
        assert_eq!(transport.active_links(), 2);

        let kept = registry
            .acquire(&ApiIdentity::new("echo"), &ApiOptions::new().with("mode", "a"), &host)
            .unwrap();
        registry.shutdown();
        assert_eq!(transport.active_links(), 0);
        assert!(registry.is_shut_down());

        // Connections handed out earlier stay down
        assert!(kept.is_closed());
        kept.connect();
        assert_eq!(kept.state(), ConnectionState::Idle);
        assert_eq!(transport.bind_count(), 2);
        assert!(matches!(
            registry.resolve(&ApiIdentity::new("echo"), &ApiOptions::new(), &host),
            Err(ConnectError::ShutDown)
        ));
    }
}
