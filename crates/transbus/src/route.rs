//! # Routes
//!
//! A Route is a one-directional, addressed path from a local Connection to one
//! specific peer Connection over one Transport.
//!
//! ## Invariants
//!
//! - A route is registered on its transport from birth, so the peer can address
//!   it by token as soon as the token is handed over.
//! - A route gets its destination exactly once, through `OpenRoute`.
//! - A closed route neither sends nor receives.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::trace;

use transpack::BusId;
use transpack::ConnectionId;
use transpack::Encoder;
use transpack::Header;
use transpack::Reference;
use transpack::RouteToken;

use crate::connection::Connection;
use crate::connection::WeakConnection;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::transport::Shiboleth;
use crate::transport::Transport;
use crate::value::Exposed;
use crate::value::Shared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// `supply_endpoint_bus` was called on a route that already has a transport.
    AlreadySupplied,
    /// `complete_route` was called twice.
    AlreadyCompleted,
    /// `complete_route` was called before a transport was supplied.
    NotSupplied,
    /// The route has no destination yet.
    Incomplete(RouteToken),
    Closed(RouteToken),
    /// The connection owning the route is gone.
    ConnectionGone,
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySupplied => write!(f, "Route already has a transport"),
            Self::AlreadyCompleted => write!(f, "Route already completed"),
            Self::NotSupplied => write!(f, "Route completed before a transport was supplied"),
            Self::Incomplete(token) => write!(f, "Route {} has no destination", token),
            Self::Closed(token) => write!(f, "Route {} is closed", token),
            Self::ConnectionGone => write!(f, "Connection owning the route is gone"),
        }
    }
}

impl std::error::Error for RouteError {}

/// Where a completed route sends its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub token: RouteToken,
    pub connection: ConnectionId,
    pub shiboleth: Option<Shiboleth>,
}

struct RouteInner {
    transport: Arc<dyn Transport>,
    token: AtomicU64,
    connection: WeakConnection,
    destination: OnceLock<Destination>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Route(Arc<RouteInner>);

impl Route {
    /// Creates a route for `connection` and registers it on `transport`.
    pub fn new(transport: Arc<dyn Transport>, connection: &Connection) -> Self {
        let route = Self(Arc::new(RouteInner {
            transport,
            token: AtomicU64::new(0),
            connection: connection.downgrade(),
            destination: OnceLock::new(),
            closed: AtomicBool::new(false),
        }));
        let token = route.0.transport.register_route(&route);
        route.0.token.store(token.0, Ordering::Release);
        trace!(connection = %connection.id(), %token, "route registered");
        route
    }

    /// The token the peer addresses this route by.
    pub fn token(&self) -> RouteToken {
        RouteToken(self.0.token.load(Ordering::Acquire))
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.0.transport
    }

    pub fn connection(&self) -> Result<Connection> {
        self.0.connection.upgrade().ok_or(Error::Route(RouteError::ConnectionGone))
    }

    pub fn destination(&self) -> Option<Destination> {
        self.0.destination.get().copied()
    }

    pub fn remote_connection(&self) -> Result<ConnectionId> {
        self.destination()
            .map(|d| d.connection)
            .ok_or(Error::Route(RouteError::Incomplete(self.token())))
    }

    /// The rendezvous value carried since completion.
    pub fn shiboleth(&self) -> Option<Shiboleth> {
        self.destination().and_then(|d| d.shiboleth)
    }

    /// The bus at the far end, falling back to `local` for loopback routes.
    pub fn remote_bus(&self, local: BusId) -> BusId {
        self.0.transport.remote_bus().unwrap_or(local)
    }

    pub fn is_complete(&self) -> bool {
        self.0.destination.get().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Whether both handles name the same route.
    pub fn same(&self, other: &Route) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Points the route at a peer route and makes it the way to reach that
    /// peer's connection.
    pub fn set_destination(&self, token: RouteToken, connection: ConnectionId) -> Result<()> {
        let destination = Destination {
            token,
            connection,
            shiboleth: self.0.transport.shiboleth(),
        };
        self.0
            .destination
            .set(destination)
            .map_err(|_| Error::Route(RouteError::AlreadyCompleted))?;
        let owner = self.connection()?;
        owner.register_route(connection, self.clone());
        debug!(local = %self.token(), remote = %token, peer = %connection, "route completed");
        Ok(())
    }

    /// Starts a message addressed to this route's destination.
    pub fn open_buffer(&self) -> OutBuffer {
        OutBuffer {
            route: self.clone(),
            layers: Vec::new(),
            enc: Encoder::new(),
        }
    }

    /// Sends one whole message to the destination.
    pub async fn send(&self, message: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Route(RouteError::Closed(self.token())));
        }
        let destination = self
            .destination()
            .ok_or(Error::Route(RouteError::Incomplete(self.token())))?;
        self.0.transport.send(destination.token, message).await?;
        Ok(())
    }

    /// Hands an inbound message to the owning connection.
    pub(crate) async fn dispatch(&self, message: Vec<u8>) {
        if self.is_closed() {
            trace!(token = %self.token(), "dropping message for closed route");
            return;
        }
        match self.connection() {
            Ok(connection) => connection.dispatch(self.clone(), message).await,
            Err(_) => trace!(token = %self.token(), "dropping message for dead connection"),
        }
    }

    pub fn close(&self) {
        if !self.0.closed.swap(true, Ordering::AcqRel) {
            self.0.transport.unregister_route(self.token());
            debug!(token = %self.token(), "route closed");
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("token", &self.token())
            .field("destination", &self.destination())
            .finish()
    }
}

/// A transcoding step wrapped around an outgoing message.
#[derive(Clone)]
pub enum Layer {
    /// Run the message through `filter` and ask the receiver to undo it with
    /// its filter `tag`.
    FilterIn { tag: Reference, filter: Shared },
    /// Ask the receiver to run its reply through its filter `remote` and tag the
    /// result with our filter `local`.
    FilterOut { remote: Reference, local: Reference },
}

/// A message under construction. Nothing is sent until `commit`.
pub struct OutBuffer {
    route: Route,
    layers: Vec<Layer>,
    enc: Encoder,
}

impl OutBuffer {
    pub fn encoder(&mut self) -> &mut Encoder {
        &mut self.enc
    }

    /// Adds a layer inside the ones already added.
    pub fn wrap(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Applies the layers, innermost first, and sends the message.
    pub async fn commit(self) -> Result<()> {
        let mut message = self.enc.into_bytes();
        for layer in self.layers.iter().rev() {
            let mut enc = Encoder::new();
            match layer {
                Layer::FilterIn { tag, filter } => {
                    let element = filter
                        .as_filter()
                        .ok_or_else(|| Fault::TypeMismatch("layer object is not a filter".into()))?;
                    let transcoded = element.transcode(&message)?;
                    enc.header(Header::FilterIn);
                    enc.reference(tag);
                    enc.raw(&transcoded);
                }
                Layer::FilterOut { remote, local } => {
                    enc.header(Header::FilterOut);
                    enc.reference(remote);
                    enc.reference(local);
                    enc.raw(&message);
                }
            }
            message = enc.into_bytes();
        }
        self.route.send(message).await
    }
}

enum OpenState {
    Created,
    Supplying,
    Supplied(Route),
    Completed(Route),
}

/// A route under negotiation: `Created → Supplied → Completed`.
///
/// Handed out by service offerings and driven by the bus master, which
/// supplies each end with the other's bus and then completes both.
pub struct OpenRoute {
    connection: Connection,
    state: Mutex<OpenState>,
}

impl OpenRoute {
    pub fn new(connection: Connection) -> Arc<Self> {
        Arc::new(Self {
            connection,
            state: Mutex::new(OpenState::Created),
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, OpenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the route to a transport reaching `bus` and returns its token.
    pub async fn supply_endpoint_bus(&self, bus: BusId) -> Result<RouteToken> {
        {
            let mut state = self.state();
            if !matches!(*state, OpenState::Created) {
                return Err(Error::Route(RouteError::AlreadySupplied));
            }
            *state = OpenState::Supplying;
        }

        let transport = match self.connection.bus() {
            Ok(owner) => owner.resolve_transport(bus).await,
            Err(e) => Err(e),
        };
        let transport = match transport {
            Ok(t) => t,
            Err(e) => {
                *self.state() = OpenState::Created;
                return Err(e);
            }
        };

        let route = Route::new(transport, &self.connection);
        let token = route.token();
        *self.state() = OpenState::Supplied(route);
        Ok(token)
    }

    /// Points the supplied route at the peer's route.
    pub fn complete_route(&self, token: RouteToken, connection: ConnectionId) -> Result<()> {
        let mut state = self.state();
        let route = match &*state {
            OpenState::Created | OpenState::Supplying => return Err(Error::Route(RouteError::NotSupplied)),
            OpenState::Completed(_) => return Err(Error::Route(RouteError::AlreadyCompleted)),
            OpenState::Supplied(route) => route.clone(),
        };
        route.set_destination(token, connection)?;
        *state = OpenState::Completed(route);
        Ok(())
    }

    /// The completed route.
    pub fn route(&self) -> Result<Route> {
        match &*self.state() {
            OpenState::Completed(route) => Ok(route.clone()),
            OpenState::Supplied(route) => Err(Error::Route(RouteError::Incomplete(route.token()))),
            _ => Err(Error::Route(RouteError::NotSupplied)),
        }
    }
}

impl Exposed for OpenRoute {
    fn interface(&self) -> Option<&str> {
        Some(crate::client::OPEN_ROUTE_NAME)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
