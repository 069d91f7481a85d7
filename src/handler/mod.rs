//! Handler subsystem.
//!
//! # Data Flow
//! ```text
//! connection driver builds an Exchange
//!     → Dispatcher::run(exchange, root handler)
//!     → Handler::handle → Flow
//!         Done / Next        → exchange completes
//!         Dispatch(exec, h)  → h runs on the worker pool or back on the I/O task
//!         Suspend(int, h)    → driver waits for readiness, then runs h
//!         Upgrade(owner)     → connection handed to the protocol owner
//! ```
//!
//! # Design Decisions
//! - One trait, implemented by closures and by composite handlers alike
//! - Handlers never block the I/O task; blocking work is dispatched to a worker
//! - Branching is a handler calling another handler directly

pub mod chain;
pub mod compression;
pub mod dispatch;
pub mod echo;
pub mod error;
pub mod path;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::exchange::Exchange;
use crate::upgrade::ConnectionOwner;

pub use chain::{HandlerChain, HandlerChainBuilder};
pub use compression::CompressionHandler;
pub use dispatch::{Dispatcher, Outcome};
pub use echo::EchoHandler;
pub use error::{DefaultErrorHandler, ErrorHandler, Failure};
pub use path::PathHandler;

/// Processes one step of an exchange.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, exchange: &mut Exchange) -> Result<Flow>;
}

impl<F> Handler for F
where
    F: Fn(&mut Exchange) -> Result<Flow> + Send + Sync + 'static,
{
    fn handle(&self, exchange: &mut Exchange) -> Result<Flow> {
        self(exchange)
    }
}

/// A handler shared between chains, executors and suspended exchanges.
pub type SharedHandler = Arc<dyn Handler>;

/// Wrap a handler for sharing.
pub fn shared(handler: impl Handler) -> SharedHandler {
    Arc::new(handler)
}

/// Where dispatched work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    /// The connection's own task on the I/O runtime.
    Io,
    /// The blocking worker pool.
    Worker,
}

/// Readiness a suspended exchange waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// More request bytes from the peer.
    Readable,
    /// Room in the outbound buffer.
    Writable,
}

/// What a handler wants to happen next.
pub enum Flow {
    /// The exchange is finished; complete it.
    Done,
    /// Continue with the next handler of the enclosing chain.
    Next,
    /// Run the handler on the given executor.
    Dispatch(Executor, SharedHandler),
    /// Run the handler once the connection is ready.
    Suspend(Interest, SharedHandler),
    /// A `101 Switching Protocols` has been staged; hand the connection over.
    Upgrade(Box<dyn ConnectionOwner>),
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Done => f.write_str("Done"),
            Flow::Next => f.write_str("Next"),
            Flow::Dispatch(executor, _) => f.debug_tuple("Dispatch").field(executor).finish(),
            Flow::Suspend(interest, _) => f.debug_tuple("Suspend").field(interest).finish(),
            Flow::Upgrade(_) => f.write_str("Upgrade"),
        }
    }
}
