//! Runs handlers on the right executor.
//!
//! # Responsibilities
//! - Invoke a handler and follow the flow it returns
//! - Move the exchange to the worker pool and back
//! - Catch errors and panics, mark the exchange abrupt, run the error handler once
//!
//! # Design Decisions
//! - The exchange is moved, never shared; the in-transit flag is set for the
//!   duration of a move so an exchange is never run by two threads at once
//! - Worker dispatch uses the runtime's blocking pool
//! - Suspension and upgrade are returned to the connection driver, which owns the socket

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::error::{DefaultErrorHandler, ErrorHandler, Failure};
use super::{Executor, Flow, Interest, SharedHandler};
use crate::error::ErrorKind;
use crate::exchange::listeners::panic_message;
use crate::exchange::Exchange;
use crate::upgrade::ConnectionOwner;

/// What the connection driver must do after a dispatch run.
pub enum Outcome {
    /// Handlers are done; complete the exchange.
    Done(Box<Exchange>),
    /// Wait for readiness, then run the handler again.
    Suspended(Box<Exchange>, Interest, SharedHandler),
    /// Flush the staged `101` and give the connection to the owner.
    Upgrade(Box<Exchange>, Box<dyn ConnectionOwner>),
    /// The exchange was lost with its worker (runtime shutting down).
    Lost,
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Done(_) => f.write_str("Done"),
            Outcome::Suspended(_, interest, _) => f.debug_tuple("Suspended").field(interest).finish(),
            Outcome::Upgrade(_, _) => f.write_str("Upgrade"),
            Outcome::Lost => f.write_str("Lost"),
        }
    }
}

/// Drives handler flows for one server.
#[derive(Clone)]
pub struct Dispatcher {
    error_handler: Arc<dyn ErrorHandler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(DefaultErrorHandler))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

fn invoke(handler: &SharedHandler, exchange: &mut Exchange) -> std::result::Result<Flow, Failure> {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(exchange))) {
        Ok(Ok(flow)) => Ok(flow),
        Ok(Err(e)) => Err(Failure::Error(e)),
        Err(panic) => Err(Failure::Panic(panic_message(panic.as_ref()))),
    }
}

impl Dispatcher {
    pub fn new(error_handler: Arc<dyn ErrorHandler>) -> Self {
        Self { error_handler }
    }

    /// Run `handler` on the I/O task and follow its flow until the exchange
    /// is done, suspended or upgraded.
    pub async fn run(&self, exchange: Box<Exchange>, handler: SharedHandler) -> Outcome {
        self.run_on(exchange, Executor::Io, handler).await
    }

    async fn run_on(
        &self,
        mut exchange: Box<Exchange>,
        mut executor: Executor,
        mut handler: SharedHandler,
    ) -> Outcome {
        loop {
            let result = match executor {
                Executor::Io => invoke(&handler, &mut exchange),
                Executor::Worker => {
                    exchange.mark_in_transit();
                    let task = Arc::clone(&handler);
                    let joined = tokio::task::spawn_blocking(move || {
                        let mut exchange = exchange;
                        exchange.pick_up();
                        let result = invoke(&task, &mut exchange);
                        exchange.mark_in_transit();
                        (exchange, result)
                    })
                    .await;
                    match joined {
                        Ok((returned, result)) => {
                            exchange = returned;
                            exchange.pick_up();
                            result
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Worker task lost its exchange");
                            return Outcome::Lost;
                        }
                    }
                }
            };

            match result {
                Ok(Flow::Done) | Ok(Flow::Next) => return Outcome::Done(exchange),
                Ok(Flow::Dispatch(next, continuation)) => {
                    tracing::trace!(request_id = %exchange.request_id(), executor = ?next, "Dispatching");
                    if next == Executor::Io && executor == Executor::Io {
                        tokio::task::yield_now().await;
                    }
                    executor = next;
                    handler = continuation;
                }
                Ok(Flow::Suspend(interest, continuation)) => {
                    return Outcome::Suspended(exchange, interest, continuation)
                }
                Ok(Flow::Upgrade(owner)) => {
                    if exchange.has_pending_upgrade() {
                        return Outcome::Upgrade(exchange, owner);
                    }
                    let failure = Failure::Error(ErrorKind::Upgrade.into());
                    self.fail(&mut exchange, failure);
                    return Outcome::Done(exchange);
                }
                Err(failure) => {
                    self.fail(&mut exchange, failure);
                    return Outcome::Done(exchange);
                }
            }
        }
    }

    fn fail(&self, exchange: &mut Exchange, failure: Failure) {
        tracing::warn!(
            request_id = %exchange.request_id(),
            connection_id = %exchange.connection_id(),
            error = %failure,
            "Handler failed"
        );
        exchange.mark_abrupt();
        if !exchange.claim_error_handling() {
            return;
        }
        let handler = &self.error_handler;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.handle_error(exchange, &failure))) {
            tracing::error!(
                request_id = %exchange.request_id(),
                error = %panic_message(panic.as_ref()),
                "Error handler panicked"
            );
        }
    }

    /// Run the error handler for a failure detected outside a handler.
    pub fn report(&self, exchange: &mut Exchange, failure: Failure) {
        self.fail(exchange, failure);
    }
}
