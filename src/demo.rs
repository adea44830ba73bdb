/*!
 * Scripted walk-through of the call lifecycle over the loopback transport
 *
 * Calls are queued before the connection exists, the bind is accepted or
 * rejected, replies arrive from another thread, and callbacks land on the
 * host's callback context. Optionally the link is then dropped to show that
 * the next call reconnects on demand.
 */

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_connect::{
    ApiOptions, BindMode, ClientFacade, ConnectionKey, ConnectionSnapshot, ConnectionState,
    LoopbackTransport, ReplyMode,
};
use conduit_core_pending::{when_all_settled, Status};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ConduitError, Result};
use crate::host::ClientHost;

/// API name the demo registers its loopback provider under
pub const DEMO_API: &str = "conduit.demo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoOptions {
    /// Calls queued before the connection comes up
    pub calls: usize,
    /// Delay before the provider answers each call
    pub reply_delay_ms: u64,
    /// Reject the bind instead of accepting it
    pub reject_bind: bool,
    /// After the first round, drop the link and call again
    pub drop_link: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            calls: 3,
            reply_delay_ms: 10,
            reject_bind: false,
            drop_link: false,
        }
    }
}

/// Outcome of one demo call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallOutcome {
    pub call: String,
    pub reply: Option<String>,
    pub status: Status,
}

impl CallOutcome {
    fn new(call: String, outcome: std::result::Result<Bytes, Status>) -> Self {
        match outcome {
            Ok(reply) => Self {
                call,
                reply: Some(String::from_utf8_lossy(&reply).into_owned()),
                status: Status::success(),
            },
            Err(status) => Self {
                call,
                reply: None,
                status,
            },
        }
    }
}

/// What happened when the link was dropped and a call retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconnectReport {
    pub in_flight: CallOutcome,
    pub state_after_drop: ConnectionState,
    pub retry: CallOutcome,
    pub bind_attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemoReport {
    pub connection: ConnectionKey,
    pub queued_before_connect: usize,
    pub posted_order: Vec<String>,
    pub outcomes: Vec<CallOutcome>,
    /// Call names in the order their callbacks ran
    pub callback_order: Vec<String>,
    pub snapshot: ConnectionSnapshot,
    pub bind_attempts: usize,
    pub reconnect: Option<ReconnectReport>,
}

impl DemoReport {
    /// Failed calls across both rounds
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .chain(self.reconnect.iter().map(|reconnect| &reconnect.retry))
            .filter(|outcome| !outcome.status.is_success())
            .count()
    }

    pub fn first_failure(&self) -> Option<&Status> {
        self.outcomes
            .iter()
            .map(|outcome| &outcome.status)
            .find(|status| !status.is_success())
    }
}

fn call_name(index: usize) -> String {
    format!("call-{}", index + 1)
}

/// Run the demo on `host`, registering the loopback provider as [`DEMO_API`]
pub fn run_demo(host: &ClientHost, options: &DemoOptions) -> Result<DemoReport> {
    let transport = Arc::new(
        LoopbackTransport::echo(DEMO_API)
            .with_bind_mode(BindMode::Manual)
            .with_reply_mode(ReplyMode::Threaded(Duration::from_millis(
                options.reply_delay_ms,
            ))),
    );
    host.register(DEMO_API, transport.factory());

    let client = host.client(DEMO_API, ApiOptions::new().with("mode", "demo"))?;
    let connection = client.connection().clone();
    info!("Demo using connection {}", connection.key());

    let names: Vec<String> = (0..options.calls).map(call_name).collect();
    let results: Vec<_> = names
        .iter()
        .map(|name| client.send(Bytes::from(name.clone())))
        .collect();
    let queued_before_connect = client.queued();
    debug!("{} calls queued while connecting", queued_before_connect);

    let (delivered_tx, delivered_rx) = mpsc::channel();
    for (name, result) in names.iter().zip(&results) {
        let tx = delivered_tx.clone();
        let name = name.clone();
        result.on_complete(
            move |_| {
                let _ = tx.send(name);
            },
            host.callback_context(),
        );
    }
    drop(delivered_tx);

    if options.calls > 0 {
        let settled = if options.reject_bind {
            transport.reject_bind("declined by demo")
        } else {
            transport.accept_bind()
        };
        if !settled {
            warn!("No bind attempt was pending for {}", connection.key());
        }
    }

    let outcomes = host.await_result(&when_all_settled(results))?;
    let outcomes: Vec<CallOutcome> = names
        .iter()
        .cloned()
        .zip(outcomes)
        .map(|(name, outcome)| CallOutcome::new(name, outcome))
        .collect();

    let mut callback_order = Vec::with_capacity(options.calls);
    while callback_order.len() < options.calls {
        match delivered_rx.recv_timeout(host.config().default_timeout()) {
            Ok(name) => callback_order.push(name),
            Err(_) => {
                return Err(ConduitError::Call(
                    Status::timeout().with_message("demo callbacks were not delivered"),
                ))
            }
        }
    }

    let posted_order = transport
        .posted_payloads()
        .iter()
        .map(|payload| String::from_utf8_lossy(payload).into_owned())
        .collect();
    let snapshot = connection.snapshot();

    let reconnect = if options.drop_link && connection.is_connected() {
        Some(drop_and_retry(host, &client, &transport)?)
    } else {
        None
    };

    let report = DemoReport {
        connection: connection.key().clone(),
        queued_before_connect,
        posted_order,
        outcomes,
        callback_order,
        snapshot,
        bind_attempts: transport.bind_count(),
        reconnect,
    };
    info!(
        "Demo finished: {} calls, {} failed",
        options.calls,
        report.failures()
    );
    Ok(report)
}

fn drop_and_retry(
    host: &ClientHost,
    client: &ClientFacade,
    transport: &Arc<LoopbackTransport>,
) -> Result<ReconnectReport> {
    transport.set_reply_mode(ReplyMode::Manual);
    let in_flight = client.send(Bytes::from_static(b"in-flight"));
    transport.drop_links("demo dropped the link");
    let in_flight = CallOutcome::new(
        "in-flight".to_string(),
        host.await_result(&in_flight).map_err(|e| e.status()),
    );
    let state_after_drop = client.connection().state();

    transport.set_bind_mode(BindMode::Immediate);
    transport.set_reply_mode(ReplyMode::Immediate);
    let retry = client.send(Bytes::from_static(b"retry"));
    let retry = CallOutcome::new(
        "retry".to_string(),
        host.await_result(&retry).map_err(|e| e.status()),
    );

    Ok(ReconnectReport {
        in_flight,
        state_after_drop,
        retry,
        bind_attempts: transport.bind_count(),
    })
}
