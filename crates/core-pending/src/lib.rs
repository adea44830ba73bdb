//! Conduit Core Pending: results that arrive later, and where they are delivered
//!
//! # Overview
//!
//! Every operation that crosses a process boundary in Conduit hands its caller
//! a [`PendingResult`] right away. This crate holds the pieces that do not know
//! anything about connections or transports:
//!
//! - **Status**: immutable success/failure code with an optional message
//! - **PendingResult**: single-assignment slot with blocking wait, timeout,
//!   async await, cancellation and one completion callback
//! - **Dispatcher**: single-consumer FIFO execution contexts that run callbacks
//!   in submission order, either on a worker thread or a caller-owned run-loop
//! - **Combinators**: `map`, `and_then`, [`when_all`], [`when_all_settled`]
//!
//! # Example
//!
//! ```
//! use conduit_core_pending::{Dispatcher, ExecutionContext, PendingResult, Status};
//! use std::sync::mpsc;
//!
//! let dispatcher = Dispatcher::spawn("callbacks").unwrap();
//! let result = PendingResult::<String>::new();
//! let (tx, rx) = mpsc::channel();
//!
//! result.on_complete(
//!     move |outcome| tx.send(outcome).unwrap(),
//!     ExecutionContext::from(dispatcher.clone()),
//! );
//! result.set_result("pong".to_string()).unwrap();
//!
//! assert_eq!(rx.recv().unwrap(), Ok("pong".to_string()));
//! assert!(result.set_failure(Status::internal("late")).is_err());
//! dispatcher.shutdown();
//! ```

pub mod combinators;
pub mod dispatcher;
pub mod error;
pub mod pending;
pub mod status;

// Re-export main types for convenience
pub use combinators::{when_all, when_all_settled};
pub use dispatcher::{panic_message, Dispatcher, ExecutionContext, Job, RunLoop};
pub use error::{CompletionError, DispatchError};
pub use pending::{PendingResult, PendingState};
pub use status::{Status, StatusCode};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use conduit_core_pending::prelude::*;
/// ```
pub mod prelude {
    pub use super::combinators::{when_all, when_all_settled};
    pub use super::dispatcher::{Dispatcher, ExecutionContext, RunLoop};
    pub use super::error::{CompletionError, DispatchError};
    pub use super::pending::{PendingResult, PendingState};
    pub use super::status::{Status, StatusCode};
}
