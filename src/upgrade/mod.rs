//! Protocol upgrade subsystem.
//!
//! # Data Flow
//! ```text
//! Request with `Connection: upgrade` + `Upgrade: <token>`
//!     → UpgradeHandler asks the UpgradeManager
//!     → acceptor for the token negotiates
//!         accept → 101 staged, chains replaced with Upgraded conduits,
//!                  connection handed to the ConnectionOwner
//!         reject → ordinary HTTP response (rejection status), connection closed
//! ```
//!
//! # Design Decisions
//! - Tokens match case-insensitively; the first requested token with an
//!   acceptor wins
//! - Once upgraded, HTTP handlers never see the connection again

pub mod websocket;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, UPGRADE};
use http::{HeaderMap, StatusCode, Version};

use crate::conduit::ConduitChain;
use crate::error::Result;
use crate::exchange::Exchange;
use crate::handler::{Flow, Handler};
use crate::http::request::RequestHead;

pub use crate::exchange::UpgradedConnection;
pub use websocket::WebSocketAcceptor;

/// Whether an upgraded connection stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    Continue,
    /// Flush what is queued and close the connection.
    Close,
}

/// Takes over a connection after a successful upgrade.
///
/// Callbacks run on the connection's I/O task and must not block.
pub trait ConnectionOwner: Send + 'static {
    /// Called once, right after the `101` has been flushed.
    fn on_open(&mut self, _conn: &mut UpgradedConnection) -> Result<OwnerState> {
        Ok(OwnerState::Continue)
    }

    /// New bytes arrived, or the peer closed its side.
    fn on_readable(&mut self, conn: &mut UpgradedConnection) -> Result<OwnerState>;

    /// Room freed up after a short write.
    fn on_writable(&mut self, _conn: &mut UpgradedConnection) -> Result<OwnerState> {
        Ok(OwnerState::Continue)
    }
}

/// A successful negotiation.
pub struct Acceptance {
    headers: HeaderMap,
    owner: Box<dyn ConnectionOwner>,
}

impl fmt::Debug for Acceptance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptance").field("headers", &self.headers).finish_non_exhaustive()
    }
}

impl Acceptance {
    pub fn new(owner: impl ConnectionOwner) -> Self {
        Self {
            headers: HeaderMap::new(),
            owner: Box::new(owner),
        }
    }

    pub fn boxed(owner: Box<dyn ConnectionOwner>) -> Self {
        Self {
            headers: HeaderMap::new(),
            owner,
        }
    }

    /// Add a header to the `101` response.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_owner(self) -> Box<dyn ConnectionOwner> {
        self.owner
    }

    fn into_parts(self) -> (HeaderMap, Box<dyn ConnectionOwner>) {
        (self.headers, self.owner)
    }
}

/// A refused negotiation, answered as a normal HTTP response.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl Rejection {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// Negotiates one upgrade protocol.
pub trait UpgradeAcceptor: Send + Sync + 'static {
    /// Token this acceptor answers to, as sent back in `Upgrade`.
    fn protocol(&self) -> &str;

    fn negotiate(&self, request: &RequestHead) -> std::result::Result<Acceptance, Rejection>;
}

/// Registry of upgrade acceptors.
#[derive(Default, Clone)]
pub struct UpgradeManager {
    acceptors: Vec<Arc<dyn UpgradeAcceptor>>,
}

impl fmt::Debug for UpgradeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocols: Vec<&str> = self.acceptors.iter().map(|a| a.protocol()).collect();
        f.debug_struct("UpgradeManager").field("protocols", &protocols).finish()
    }
}

/// Result of asking the manager about a request.
#[derive(Debug)]
pub enum Negotiation {
    /// Not an upgrade request, or no acceptor for any requested token.
    NotRequested,
    Accepted { protocol: String, acceptance: Acceptance },
    Rejected(Rejection),
}

impl UpgradeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an acceptor. A later acceptor for the same token replaces the earlier one.
    pub fn register(&mut self, acceptor: impl UpgradeAcceptor) -> &mut Self {
        let protocol = acceptor.protocol().to_string();
        self.acceptors.retain(|a| !a.protocol().eq_ignore_ascii_case(&protocol));
        self.acceptors.push(Arc::new(acceptor));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.acceptors.is_empty()
    }

    /// `Connection: upgrade` plus an `Upgrade` header on an HTTP/1.1 request.
    pub fn is_upgrade_request(request: &RequestHead) -> bool {
        request.version == Version::HTTP_11
            && request.header_has_token(&CONNECTION, "upgrade")
            && request.headers.contains_key(UPGRADE)
    }

    pub fn negotiate(&self, request: &RequestHead) -> Negotiation {
        if !Self::is_upgrade_request(request) {
            return Negotiation::NotRequested;
        }
        let requested = request
            .headers
            .get_all(UPGRADE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim);
        for token in requested {
            let Some(acceptor) = self
                .acceptors
                .iter()
                .find(|a| a.protocol().eq_ignore_ascii_case(token))
            else {
                continue;
            };
            return match acceptor.negotiate(request) {
                Ok(acceptance) => Negotiation::Accepted {
                    protocol: acceptor.protocol().to_string(),
                    acceptance,
                },
                Err(rejection) => Negotiation::Rejected(rejection),
            };
        }
        Negotiation::NotRequested
    }
}

/// Performs upgrades the manager accepts; passes every other request on.
#[derive(Debug, Clone)]
pub struct UpgradeHandler {
    manager: Arc<UpgradeManager>,
}

impl UpgradeHandler {
    pub fn new(manager: UpgradeManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }
}

impl Handler for UpgradeHandler {
    fn handle(&self, exchange: &mut Exchange) -> Result<Flow> {
        match self.manager.negotiate(exchange.request()) {
            Negotiation::NotRequested => Ok(Flow::Next),
            Negotiation::Accepted { protocol, acceptance } => {
                let (headers, owner) = acceptance.into_parts();
                exchange.accept_upgrade(&protocol, headers, ConduitChain::upgraded(protocol.as_str()))?;
                Ok(Flow::Upgrade(owner))
            }
            Negotiation::Rejected(rejection) => {
                tracing::debug!(
                    request_id = %exchange.request_id(),
                    status = rejection.status.as_u16(),
                    reason = %rejection.reason,
                    "Upgrade rejected"
                );
                exchange.close_connection();
                for (name, value) in rejection.headers.iter() {
                    exchange.response_headers_mut().append(name.clone(), value.clone());
                }
                exchange.send(rejection.status, Bytes::from(rejection.reason))?;
                Ok(Flow::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::ConduitKind;
    use crate::exchange::test_support::exchange;
    use crate::BufferPool;

    struct Silent;

    impl ConnectionOwner for Silent {
        fn on_readable(&mut self, _conn: &mut UpgradedConnection) -> Result<OwnerState> {
            Ok(OwnerState::Continue)
        }
    }

    struct Fixed {
        accept: bool,
    }

    impl UpgradeAcceptor for Fixed {
        fn protocol(&self) -> &str {
            "X"
        }

        fn negotiate(&self, _request: &RequestHead) -> std::result::Result<Acceptance, Rejection> {
            if self.accept {
                Ok(Acceptance::new(Silent).with_header(
                    HeaderName::from_static("x-accepted"),
                    HeaderValue::from_static("yes"),
                ))
            } else {
                Err(Rejection::new(StatusCode::UPGRADE_REQUIRED, "no"))
            }
        }
    }

    fn manager(accept: bool) -> UpgradeManager {
        let mut manager = UpgradeManager::new();
        manager.register(Fixed { accept });
        manager
    }

    #[test]
    fn tokens_match_case_insensitively() {
        let pool = BufferPool::new(1024, 8);
        let ex = exchange(&pool, b"GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\nUpgrade: foo, x\r\n\r\n");
        assert!(matches!(
            manager(true).negotiate(ex.request()),
            Negotiation::Accepted { ref protocol, .. } if protocol == "X"
        ));

        let plain = exchange(&pool, b"GET / HTTP/1.1\r\nUpgrade: x\r\n\r\n");
        assert!(matches!(manager(true).negotiate(plain.request()), Negotiation::NotRequested));
    }

    #[test]
    fn acceptance_stages_switching_protocols() {
        let pool = BufferPool::new(1024, 8);
        let mut ex = exchange(&pool, b"GET / HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: X\r\n\r\nafter");
        let flow = UpgradeHandler::new(manager(true)).handle(&mut ex).unwrap();
        assert!(matches!(flow, Flow::Upgrade(_)));
        assert!(ex.has_pending_upgrade());

        let head = ex.wire_mut().take_output();
        assert_eq!(
            &head[..],
            b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: X\r\nx-accepted: yes\r\n\r\n"
        );

        let mut conn = ex.into_upgraded().unwrap();
        assert_eq!(conn.protocol(), "X");
        assert_eq!(conn.chain.source.layers(), vec![ConduitKind::Upgraded, ConduitKind::Raw]);
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).unwrap(), crate::conduit::Read::Data(5));
        assert_eq!(&buf[..5], b"after");
    }

    #[test]
    fn rejection_is_a_normal_response() {
        let pool = BufferPool::new(1024, 8);
        let mut ex = exchange(&pool, b"GET / HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: X\r\n\r\n");
        let flow = UpgradeHandler::new(manager(false)).handle(&mut ex).unwrap();
        assert!(matches!(flow, Flow::Done));
        assert_eq!(ex.status(), StatusCode::UPGRADE_REQUIRED);
        assert!(!ex.is_persistent());
        assert!(!ex.has_pending_upgrade());
    }
}
