//! Minimal prefix routing.

use std::sync::Arc;

use super::{Flow, Handler, SharedHandler};
use crate::error::{ErrorKind, Result};
use crate::exchange::Exchange;

/// Routes to the handler registered for the longest matching path prefix.
///
/// Prefixes match on segment boundaries: `/api` matches `/api` and
/// `/api/users` but not `/apis`.
#[derive(Clone)]
pub struct PathHandler {
    prefixes: Vec<(String, SharedHandler)>,
    fallback: SharedHandler,
}

impl std::fmt::Debug for PathHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefixes: Vec<&str> = self.prefixes.iter().map(|(p, _)| p.as_str()).collect();
        f.debug_struct("PathHandler").field("prefixes", &prefixes).finish()
    }
}

fn normalize(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn matches(prefix: &str, path: &str) -> bool {
    // "/" normalizes to "" and matches everything.
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

impl PathHandler {
    /// Requests matching no prefix go to `fallback`.
    pub fn new(fallback: impl Handler) -> Self {
        Self {
            prefixes: Vec::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Register `handler` under `prefix`, replacing an earlier registration.
    pub fn add_prefix(&mut self, prefix: &str, handler: impl Handler) -> Result<&mut Self> {
        if prefix.is_empty() {
            return Err(ErrorKind::PathMustBeSpecified.into());
        }
        let prefix = normalize(prefix);
        let prefix = if prefix == "/" { String::new() } else { prefix };
        let handler: SharedHandler = Arc::new(handler);
        match self.prefixes.iter_mut().find(|(p, _)| *p == prefix) {
            Some(entry) => entry.1 = handler,
            None => self.prefixes.push((prefix, handler)),
        }
        // Longest first so the first match wins.
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(self)
    }

    fn resolve(&self, path: &str) -> &SharedHandler {
        self.prefixes
            .iter()
            .find(|(prefix, _)| matches(prefix, path))
            .map(|(_, handler)| handler)
            .unwrap_or(&self.fallback)
    }
}

impl Handler for PathHandler {
    fn handle(&self, exchange: &mut Exchange) -> Result<Flow> {
        let handler = Arc::clone(self.resolve(exchange.uri().path()));
        handler.handle(exchange)
    }
}
