/*!
 * Client host: owns the registry, dispatchers and façades of one process
 */

use std::sync::atomic::{AtomicBool, Ordering};

use conduit_connect::{
    ApiIdentity, ApiOptions, ClientFacade, ConnectionFactory, ConnectionKey, ConnectionSnapshot,
    HostContext, ProviderRegistry,
};
use conduit_core_pending::{Dispatcher, ExecutionContext, PendingResult};
use tracing::{debug, info};

use crate::config::{ClientConfig, ContextMode};
use crate::error::{ConduitError, Result};

/// Everything a process needs to hand out client façades
///
/// Dropping the host shuts it down: connections are disconnected and the
/// dispatcher threads drain and exit.
pub struct ClientHost {
    config: ClientConfig,
    registry: ProviderRegistry,
    host: HostContext,
    callbacks: Option<Dispatcher>,
    events: Option<Dispatcher>,
    shut_down: AtomicBool,
}

fn spawn_context(mode: ContextMode, name: &str) -> Result<Option<Dispatcher>> {
    match mode {
        ContextMode::Immediate => Ok(None),
        ContextMode::Dispatcher => Ok(Some(Dispatcher::spawn(name)?)),
    }
}

fn context_of(dispatcher: &Option<Dispatcher>) -> ExecutionContext {
    dispatcher
        .clone()
        .map(ExecutionContext::from)
        .unwrap_or_default()
}

impl ClientHost {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let callbacks = spawn_context(config.callback_context, &config.dispatcher_name)?;
        let events = spawn_context(config.event_context, &config.event_dispatcher_name)?;
        let registry = ProviderRegistry::with_event_context(context_of(&events));

        let mut host = HostContext::new(config.host_name.clone());
        if let Some(tag) = &config.attribution_tag {
            host = host.with_attribution_tag(tag.clone());
        }

        info!(
            "Client host '{}' started (callbacks: {:?}, events: {:?})",
            config.host_name, config.callback_context, config.event_context
        );

        Ok(Self {
            config,
            registry,
            host,
            callbacks,
            events,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn host_context(&self) -> &HostContext {
        &self.host
    }

    /// Context configured for result callbacks
    pub fn callback_context(&self) -> ExecutionContext {
        context_of(&self.callbacks)
    }

    /// Make `api` available to façades built by this host
    pub fn register<F>(&self, api: impl Into<ApiIdentity>, factory: F)
    where
        F: ConnectionFactory + 'static,
    {
        self.registry.register(api.into(), factory);
    }

    /// Build a façade for `api`; equal options share one connection
    pub fn client(&self, api: impl Into<ApiIdentity>, options: ApiOptions) -> Result<ClientFacade> {
        if self.is_shut_down() {
            return Err(ConduitError::ShutDown);
        }
        let client = ClientFacade::new(&self.registry, api.into(), options, self.host.clone())?;
        Ok(client)
    }

    /// Block for a result up to the configured default timeout
    ///
    /// A timeout leaves `result` untouched; it can be awaited again.
    pub fn await_result<T>(&self, result: &PendingResult<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        result
            .wait_timeout(self.config.default_timeout())
            .map_err(ConduitError::Call)
    }

    /// Live connections with their current state
    pub fn connections(&self) -> Vec<(ConnectionKey, ConnectionSnapshot)> {
        self.registry.connections()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Disconnect every connection and stop the dispatchers
    ///
    /// Callbacks already queued still run before the threads exit.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down client host '{}'", self.config.host_name);
        self.registry.shutdown();
        for dispatcher in [&self.events, &self.callbacks].into_iter().flatten() {
            dispatcher.shutdown();
        }
        info!("Client host '{}' shut down", self.config.host_name);
    }
}

impl Drop for ClientHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}
