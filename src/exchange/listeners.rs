//! Completion listeners.
//!
//! Listeners run exactly once, in registration order, after both directions
//! of the exchange are done. A failing (or panicking) listener does not stop
//! the ones after it; failures are gathered into one [`CompletionError`].

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use http::{Method, StatusCode};

use crate::http::request::RequestId;
use crate::net::connection::ConnectionId;

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Listener = Box<dyn FnOnce(&ExchangeSummary) -> Result<(), ListenerError> + Send + 'static>;

/// What a listener is told about the finished exchange.
#[derive(Debug, Clone)]
pub struct ExchangeSummary {
    pub request_id: RequestId,
    pub connection_id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub persistent: bool,
    pub abrupt: bool,
    pub upgraded: bool,
    pub elapsed: Duration,
}

/// One listener that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    /// Registration position, starting at 0.
    pub index: usize,
    pub message: String,
}

/// Aggregate of every listener failure for one exchange.
#[derive(Debug, thiserror::Error)]
#[error("{} of {total} completion listeners failed", failures.len())]
pub struct CompletionError {
    pub total: usize,
    pub failures: Vec<ListenerFailure>,
}

/// Append-only list, drained once.
#[derive(Default)]
pub struct CompletionListeners {
    listeners: Vec<Listener>,
    fired: bool,
}

impl std::fmt::Debug for CompletionListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionListeners")
            .field("pending", &self.listeners.len())
            .field("fired", &self.fired)
            .finish()
    }
}

impl CompletionListeners {
    pub fn push<F>(&mut self, listener: F)
    where
        F: FnOnce(&ExchangeSummary) -> Result<(), ListenerError> + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Run every listener once. Later calls do nothing.
    pub fn fire(&mut self, summary: &ExchangeSummary) -> Result<(), CompletionError> {
        if self.fired {
            return Ok(());
        }
        self.fired = true;

        let listeners = std::mem::take(&mut self.listeners);
        let total = listeners.len();
        let mut failures = Vec::new();
        for (index, listener) in listeners.into_iter().enumerate() {
            let message = match catch_unwind(AssertUnwindSafe(|| listener(summary))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            tracing::warn!(
                request_id = %summary.request_id,
                listener = index,
                error = %message,
                "Completion listener failed"
            );
            failures.push(ListenerFailure { index, message });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CompletionError { total, failures })
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn summary() -> ExchangeSummary {
        ExchangeSummary {
            request_id: RequestId::new(),
            connection_id: ConnectionId::new(),
            peer_addr: None,
            method: Method::GET,
            path: "/".to_string(),
            status: StatusCode::OK,
            persistent: true,
            abrupt: false,
            upgraded: false,
            elapsed: Duration::from_millis(1),
        }
    }

    #[test]
    fn listeners_run_in_order_once_despite_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = CompletionListeners::default();

        let l = Arc::clone(&log);
        listeners.push(move |_| {
            l.lock().unwrap().push("L1");
            Ok(())
        });
        let l = Arc::clone(&log);
        listeners.push(move |_| {
            l.lock().unwrap().push("L2");
            Err("L2 broke".into())
        });
        let l = Arc::clone(&log);
        listeners.push(move |_| {
            l.lock().unwrap().push("L3");
            Ok(())
        });

        let err = listeners.fire(&summary()).unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["L1", "L2", "L3"]);
        assert_eq!(err.total, 3);
        assert_eq!(
            err.failures,
            vec![ListenerFailure {
                index: 1,
                message: "L2 broke".to_string()
            }]
        );

        assert!(listeners.fire(&summary()).is_ok());
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn panicking_listener_is_contained() {
        let ran = Arc::new(Mutex::new(false));
        let mut listeners = CompletionListeners::default();
        listeners.push(|_| panic!("boom"));
        let r = Arc::clone(&ran);
        listeners.push(move |_| {
            *r.lock().unwrap() = true;
            Ok(())
        });

        let err = listeners.fire(&summary()).unwrap_err();
        assert!(*ran.lock().unwrap());
        assert_eq!(err.failures[0].message, "panicked: boom");
    }
}
