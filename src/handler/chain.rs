//! Ordered handler chains.
//!
//! A chain runs its handlers in order while they return [`Flow::Next`].
//! When a handler dispatches or suspends, the continuation carries the
//! rest of the chain along so processing picks up where it left off.

use std::sync::Arc;

use super::{Flow, Handler, SharedHandler};
use crate::error::{ErrorKind, Result};
use crate::exchange::Exchange;

/// Handlers run in sequence.
#[derive(Clone)]
pub struct HandlerChain {
    handlers: Arc<[SharedHandler]>,
    start: usize,
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("len", &self.handlers.len())
            .field("start", &self.start)
            .finish()
    }
}

impl HandlerChain {
    pub fn builder() -> HandlerChainBuilder {
        HandlerChainBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.handlers.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tail(&self, start: usize) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            start,
        }
    }
}

impl Handler for HandlerChain {
    fn handle(&self, exchange: &mut Exchange) -> Result<Flow> {
        for index in self.start..self.handlers.len() {
            let flow = self.handlers[index].handle(exchange)?;
            if let Flow::Next = flow {
                continue;
            }
            return Ok(resume_after(flow, self.tail(index + 1)));
        }
        Ok(Flow::Next)
    }
}

/// A continuation handler followed by the remainder of a chain.
struct Resume {
    current: SharedHandler,
    rest: HandlerChain,
}

impl Handler for Resume {
    fn handle(&self, exchange: &mut Exchange) -> Result<Flow> {
        match self.current.handle(exchange)? {
            Flow::Next => self.rest.handle(exchange),
            flow => Ok(resume_after(flow, self.rest.clone())),
        }
    }
}

/// Thread `rest` through a dispatch or suspension so it runs after the continuation.
fn resume_after(flow: Flow, rest: HandlerChain) -> Flow {
    if rest.is_empty() {
        return flow;
    }
    match flow {
        Flow::Dispatch(executor, current) => {
            Flow::Dispatch(executor, Arc::new(Resume { current, rest }))
        }
        Flow::Suspend(interest, current) => {
            Flow::Suspend(interest, Arc::new(Resume { current, rest }))
        }
        other => other,
    }
}

/// Collects handlers for a [`HandlerChain`].
#[derive(Default)]
pub struct HandlerChainBuilder {
    handlers: Vec<SharedHandler>,
}

impl HandlerChainBuilder {
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn shared(mut self, handler: SharedHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Fails with `HandlerCannotBeNull` when no handler was added.
    pub fn build(self) -> Result<HandlerChain> {
        if self.handlers.is_empty() {
            return Err(ErrorKind::HandlerCannotBeNull.into());
        }
        Ok(HandlerChain {
            handlers: self.handlers.into(),
            start: 0,
        })
    }
}
