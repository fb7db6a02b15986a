//! # Transport Abstraction
//!
//! A minimal, async interface for moving messages between busses.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about headers, references or
//!   values. It moves opaque messages, one in, one out, each delivered whole.
//! - **Token-Addressed**: Every Route registered on a transport gets a token.
//!   Outgoing messages are addressed to the peer's token; incoming messages are
//!   handed to the local Route owning the token they carry.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tracing::trace;
use tracing::warn;

use transpack::BusId;
use transpack::RouteToken;

use crate::route::Route;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// No route is registered under the addressed token.
    UnknownRoute(RouteToken),
    /// The transport was closed locally.
    Closed,
    /// The transport cannot perform this operation.
    Unsupported(&'static str),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::UnknownRoute(token) => write!(f, "No route registered for {}", token),
            Self::Closed => write!(f, "Transport closed"),
            Self::Unsupported(op) => write!(f, "Transport does not support {}", op),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Rendezvous value shared by both ends of a transport.
///
/// Every Route completed over a transport carries its shiboleth. It deters
/// accidental cross-wiring; it is not a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shiboleth(pub u64);

impl Shiboleth {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for Shiboleth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shib-{:016x}", self.0)
    }
}

/// A mechanism to deliver whole messages to the Routes of one peer bus.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Registers a route for inbound delivery and mints its token.
    fn register_route(&self, route: &Route) -> RouteToken;

    /// Stops inbound delivery to the route holding this token.
    fn unregister_route(&self, token: RouteToken);

    /// Sends one message to the peer route addressed by `destination`.
    ///
    /// # Invariants
    /// - The message is delivered whole or not at all.
    /// - Must not interpret the message content.
    async fn send(&self, destination: RouteToken, message: Vec<u8>) -> Result<()>;

    /// The bus on the far side, or `None` when both ends are on this bus.
    fn remote_bus(&self) -> Option<BusId>;

    /// The rendezvous value stamped on this transport.
    fn shiboleth(&self) -> Option<Shiboleth>;

    /// Records which bus is on the far side and the shiboleth both ends agreed on.
    fn bind(&self, remote: BusId, shiboleth: Shiboleth);

    /// Sends a raw handshake packet, outside of any route.
    async fn send_bootstrap(&self, _packet: Vec<u8>) -> Result<()> {
        Err(TransportError::Unsupported("bootstrap"))
    }

    /// Waits for the peer's next raw handshake packet.
    async fn recv_bootstrap(&self) -> Result<Vec<u8>> {
        Err(TransportError::Unsupported("bootstrap"))
    }

    /// Drops every registered route and refuses further traffic.
    fn close(&self);
}

/// Token-to-Route table shared by the transport implementations in this crate.
///
/// Tokens start at 1 and are never reused.
#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<RouteToken, Route>,
    next: AtomicU64,
}

impl RouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, route: &Route) -> RouteToken {
        let token = RouteToken(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.routes.insert(token, route.clone());
        token
    }

    pub fn unregister(&self, token: RouteToken) {
        self.routes.remove(&token);
    }

    pub fn get(&self, token: RouteToken) -> Option<Route> {
        self.routes.get(&token).map(|r| r.clone())
    }

    pub fn clear(&self) {
        self.routes.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Hands an inbound message to the route owning `token`.
    ///
    /// Each message is dispatched on its own task so a slow call never blocks
    /// unrelated traffic on the same transport.
    pub fn deliver(&self, token: RouteToken, message: Vec<u8>) {
        let Some(route) = self.get(token) else {
            warn!(%token, "dropping message for unregistered route");
            return;
        };
        trace!(%token, len = message.len(), "delivering message");
        tokio::spawn(async move {
            route.dispatch(message).await;
        });
    }
}
