//! # Bus
//!
//! One per process (or per test). Owns message-id allocation, the pending-call
//! window, the connections living here and the transports reaching other busses.
//!
//! ## Timeouts
//!
//! Pending calls sit in a window of `window_len` buckets. New calls go in the
//! front bucket. Every `tick` the back bucket is evicted, failing whatever is
//! still in it with `Error::Timeout`, and an empty bucket is pushed at the front.
//! A call therefore expires between `(window_len - 1) * tick` and
//! `window_len * tick` after it was sent, without a timer per call.
//! Rotations missed while the runtime is stalled are delayed, never replayed
//! back to back, so the lower bound holds after a stall too.
//!
//! ## Invariants
//!
//! - A pending call is settled exactly once: by its reply, its error, its
//!   timeout, or shutdown. Whoever removes it from the window settles it.
//! - A reply only settles a call if it arrives on the route the call was sent on.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::warn;

use transpack::BusId;
use transpack::ConnectionId;
use transpack::Decoder;
use transpack::Encoder;
use transpack::MessageId;
use transpack::RouteToken;

use crate::channel::ChannelHub;
use crate::channel::ChannelServer;
use crate::client;
use crate::client::MasterHandle;
use crate::client::OpenTransport;
use crate::connection::Connection;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::loopback::LoopbackTransport;
use crate::master::BusMaster;
use crate::proxy::ServiceProxy;
use crate::route::Layer;
use crate::route::Route;
use crate::transport::Shiboleth;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::value::Shared;

/// Tunables of a bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Buckets in the pending-call window.
    pub window_len: usize,
    /// Time between window rotations.
    pub tick: Duration,
    /// Send `SerializedError` dumps instead of `UnknownError`. Leaks local state.
    pub debug_errors: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            window_len: 5,
            tick: Duration::from_millis(500),
            debug_errors: false,
        }
    }
}

impl BusConfig {
    pub fn with_window_len(mut self, window_len: usize) -> Self {
        self.window_len = window_len.max(1);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_debug_errors(mut self, debug_errors: bool) -> Self {
        self.debug_errors = debug_errors;
        self
    }

    /// Defaults overridden by `TRANSBUS_WINDOW_LEN`, `TRANSBUS_TICK_MS` and
    /// `TRANSBUS_DEBUG_ERRORS`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_var::<usize>("TRANSBUS_WINDOW_LEN") {
            config = config.with_window_len(v);
        }
        if let Some(v) = env_var::<u64>("TRANSBUS_TICK_MS") {
            config = config.with_tick(Duration::from_millis(v));
        }
        if let Some(v) = env_var::<bool>("TRANSBUS_DEBUG_ERRORS") {
            config = config.with_debug_errors(v);
        }
        config
    }

    /// Bounds on how long a call may wait for its reply.
    pub fn timeout_window(&self) -> (Duration, Duration) {
        let n = self.window_len.max(1) as u32;
        (self.tick * (n - 1), self.tick * n)
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparseable bus setting");
            None
        }
    }
}

type Waiter = oneshot::Sender<Result<Vec<u8>>>;

/// Receives the body of a reply, or the error that settled the call.
pub type ReplyReceiver = oneshot::Receiver<Result<Vec<u8>>>;

struct PendingCall {
    waiter: Waiter,
    origin: Route,
}

/// Receives `GENERAL_ERROR` faults sent by peers.
pub type FailureHook = Arc<dyn Fn(&Route, &Fault) + Send + Sync>;

/// Receives local-only failures that were withheld from peers.
pub type LocalHook = Arc<dyn Fn(&Error) + Send + Sync>;

pub(crate) struct BusInner {
    config: BusConfig,
    id: OnceLock<BusId>,
    message_count: AtomicU64,
    window: Mutex<VecDeque<HashMap<MessageId, PendingCall>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    connections: DashMap<ConnectionId, Connection>,
    transports: DashMap<BusId, Arc<dyn Transport>>,
    dialing: DashMap<BusId, Arc<tokio::sync::Mutex<()>>>,
    loopback: Arc<LoopbackTransport>,
    master: OnceLock<MasterHandle>,
    hub: OnceLock<ChannelHub>,
    server: OnceLock<Arc<ChannelServer>>,
    failure_hook: RwLock<FailureHook>,
    local_hook: RwLock<LocalHook>,
    closed: AtomicBool,
}

impl BusInner {
    fn window(&self) -> MutexGuard<'_, VecDeque<HashMap<MessageId, PendingCall>>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evicts the oldest bucket and fails everything still in it.
    fn rotate(&self) {
        let expired = {
            let mut window = self.window();
            let oldest = window.pop_back().unwrap_or_default();
            window.push_front(HashMap::new());
            oldest
        };
        for (id, call) in expired {
            debug!(%id, "pending call timed out");
            let _ = call.waiter.send(Err(Error::Timeout));
        }
    }
}

#[derive(Clone)]
pub struct Bus(Arc<BusInner>);

impl Bus {
    /// Creates a bus and starts its window ticker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: BusConfig) -> Self {
        let window = (0..config.window_len.max(1)).map(|_| HashMap::new()).collect();
        let tick = config.tick.max(Duration::from_millis(1));
        let failure_hook: FailureHook = Arc::new(|route: &Route, fault: &Fault| {
            warn!(route = %route.token(), %fault, "peer reported a general failure");
        });
        let local_hook: LocalHook = Arc::new(|e: &Error| {
            error!(error = %e, "local exception");
        });
        let inner = Arc::new(BusInner {
            config,
            id: OnceLock::new(),
            message_count: AtomicU64::new(0),
            window: Mutex::new(window),
            ticker: Mutex::new(None),
            connections: DashMap::new(),
            transports: DashMap::new(),
            dialing: DashMap::new(),
            loopback: Arc::new(LoopbackTransport::new()),
            master: OnceLock::new(),
            hub: OnceLock::new(),
            server: OnceLock::new(),
            failure_hook: RwLock::new(failure_hook),
            local_hook: RwLock::new(local_hook),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let ticker = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + tick, tick);
            // A stalled runtime must not evict several buckets at once.
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.rotate();
            }
        });
        *inner.ticker.lock().unwrap_or_else(PoisonError::into_inner) = Some(ticker);

        Self(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<BusInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<BusInner>) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    pub fn config(&self) -> &BusConfig {
        &self.0.config
    }

    /// The bus id, once bootstrapped.
    pub fn id(&self) -> Option<BusId> {
        self.0.id.get().copied()
    }

    pub(crate) fn require_id(&self) -> Result<BusId> {
        self.id().ok_or_else(|| Error::Local("bus is not bootstrapped".into()))
    }

    fn set_id(&self, id: BusId) -> Result<()> {
        self.0
            .id
            .set(id)
            .map_err(|_| Error::Local("bus is already bootstrapped".into()))
    }

    pub fn master(&self) -> Result<MasterHandle> {
        self.0
            .master
            .get()
            .cloned()
            .ok_or_else(|| Error::Local("bus has no master".into()))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.0.connections.get(&id).map(|c| c.clone())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.0.connections.iter().map(|c| c.clone()).collect()
    }

    // --- Message ids and the pending window ---

    pub fn next_message_id(&self) -> MessageId {
        MessageId(self.0.message_count.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Registers a pending call that must be answered on `origin`.
    pub fn await_reply(&self, origin: &Route) -> (MessageId, ReplyReceiver) {
        let id = self.next_message_id();
        let (waiter, rx) = oneshot::channel();
        let call = PendingCall { waiter, origin: origin.clone() };
        // `closed` only flips under the window lock.
        let mut window = self.0.window();
        match window.front_mut() {
            Some(bucket) if !self.0.closed.load(Ordering::Acquire) => {
                bucket.insert(id, call);
            }
            _ => {
                let _ = call.waiter.send(Err(Error::Shutdown));
            }
        }
        (id, rx)
    }

    /// Claims the pending call for `id`, newest bucket first.
    ///
    /// # Errors
    /// `UnknownMessageId` if no call is pending under `id`, or if it was sent
    /// on a different route than `origin`. A mismatch leaves the call pending.
    pub fn resolve_reply(&self, id: MessageId, origin: &Route) -> Result<Waiter> {
        let mut window = self.0.window();
        for bucket in window.iter_mut() {
            let Some(call) = bucket.get(&id) else { continue };
            if !call.origin.same(origin) {
                warn!(%id, route = %origin.token(), "reply arrived on the wrong route");
                return Err(Error::Fault(Fault::UnknownMessageId(id)));
            }
            if let Some(call) = bucket.remove(&id) {
                return Ok(call.waiter);
            }
        }
        Err(Error::Fault(Fault::UnknownMessageId(id)))
    }

    /// Drops a pending call that never made it onto the wire.
    pub fn abandon(&self, id: MessageId) {
        let mut window = self.0.window();
        for bucket in window.iter_mut() {
            if bucket.remove(&id).is_some() {
                return;
            }
        }
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.0.window().iter().map(|b| b.len()).sum()
    }

    /// Sends a request on `route` and waits for the body of its reply.
    pub(crate) async fn roundtrip(
        &self,
        route: &Route,
        layers: Vec<Layer>,
        write: impl FnOnce(&mut Encoder, MessageId) -> Result<()>,
    ) -> Result<Vec<u8>> {
        let (id, rx) = self.await_reply(route);
        let mut out = route.open_buffer();
        for layer in layers {
            out.wrap(layer);
        }
        let sent = match write(out.encoder(), id) {
            Ok(()) => out.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.abandon(id);
            return Err(e);
        }
        rx.await.map_err(|_| Error::Shutdown)?
    }

    // --- Hooks ---

    pub fn set_failure_handler(&self, hook: impl Fn(&Route, &Fault) + Send + Sync + 'static) {
        *self.0.failure_hook.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(hook);
    }

    pub fn set_local_exception_handler(&self, hook: impl Fn(&Error) + Send + Sync + 'static) {
        *self.0.local_hook.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(hook);
    }

    pub(crate) fn report_failure(&self, route: &Route, fault: &Fault) {
        let hook = self.0.failure_hook.read().unwrap_or_else(PoisonError::into_inner).clone();
        hook(route, fault);
    }

    pub(crate) fn local_exception(&self, e: &Error) {
        let hook = self.0.local_hook.read().unwrap_or_else(PoisonError::into_inner).clone();
        hook(e);
    }

    // --- Connections and bootstrap ---

    fn adopt_connection(&self, id: ConnectionId) -> Result<Connection> {
        let connection = Connection::new(id, self);
        connection.add_transverse_map(client::client_map()?);
        self.0.connections.insert(id, connection.clone());
        Ok(connection)
    }

    /// Seeds a bus around a master living in this process.
    ///
    /// The bus takes the first id the master hands out, and its first
    /// connection offers the master service.
    pub fn bootstrap_on_local_master(&self, master: Arc<BusMaster>) -> Result<Connection> {
        let id = master.neonate_id();
        let bus_id = BusId(id.0);
        self.set_id(bus_id)?;
        master.attach(bus_id);

        let connection = Connection::new(id, self);
        connection.add_transverse_map(client::master_map(master.clone())?);
        connection.add_transverse_map(client::client_map()?);
        self.0.connections.insert(id, connection.clone());
        let _ = self.0.master.set(MasterHandle::Local(master));
        debug!(bus = %bus_id, "bootstrapped on local master");
        Ok(connection)
    }

    /// Master side of the bootstrap handshake over a brand-new transport.
    ///
    /// Sends `(route token, connection id, master connection id, master bus id,
    /// shiboleth)`, waits for the client's route token, then acknowledges.
    /// Returns the id of the new bus.
    pub async fn await_client(&self, transport: Arc<dyn Transport>) -> Result<BusId> {
        let MasterHandle::Local(master) = self.master()? else {
            return Err(Error::Local("only the master bus accepts bootstrap clients".into()));
        };
        let bus_id = self.require_id()?;
        let master_connection = self
            .connection(ConnectionId(bus_id.0))
            .ok_or_else(|| Error::Local("master connection is gone".into()))?;

        let neonate = master.neonate_id();
        let client_bus = BusId(neonate.0);
        let shiboleth = Shiboleth::random();
        let route = Route::new(transport.clone(), &master_connection);

        let mut enc = Encoder::new();
        enc.id(route.token());
        enc.id(neonate);
        enc.id(master_connection.id());
        enc.id(bus_id);
        enc.serial(shiboleth.0);
        transport.send_bootstrap(enc.into_bytes()).await?;

        let reply = transport.recv_bootstrap().await?;
        let client_token: RouteToken = Decoder::new(&reply).id()?;

        transport.bind(client_bus, shiboleth);
        route.set_destination(client_token, neonate)?;
        self.0.transports.insert(client_bus, transport.clone());
        transport.send_bootstrap(Vec::new()).await?;

        debug!(bus = %bus_id, client = %client_bus, "bootstrapped client");
        Ok(client_bus)
    }

    /// Client side of the bootstrap handshake. Returns the first connection,
    /// already routed to the master.
    pub async fn bootstrap_on_transport(&self, transport: Arc<dyn Transport>) -> Result<Connection> {
        let packet = transport.recv_bootstrap().await?;
        let mut dec = Decoder::new(&packet);
        let master_token: RouteToken = dec.id()?;
        let neonate: ConnectionId = dec.id()?;
        let master_connection: ConnectionId = dec.id()?;
        let master_bus: BusId = dec.id()?;
        let shiboleth = Shiboleth(dec.serial()?);

        self.set_id(BusId(neonate.0))?;
        transport.bind(master_bus, shiboleth);
        let connection = self.adopt_connection(neonate)?;

        let route = Route::new(transport.clone(), &connection);
        route.set_destination(master_token, master_connection)?;

        let mut enc = Encoder::new();
        enc.id(route.token());
        transport.send_bootstrap(enc.into_bytes()).await?;
        // The master acknowledges once its end of the route is complete.
        transport.recv_bootstrap().await?;

        self.0.transports.insert(master_bus, transport);
        let proxy = ServiceProxy::new(route, client::bus_master_interface());
        let _ = self.0.master.set(MasterHandle::Remote(proxy));
        debug!(bus = %neonate, master = %master_bus, "bootstrapped on transport");
        Ok(connection)
    }

    /// Mints a fresh connection on this bus.
    pub async fn new_connection(&self) -> Result<Connection> {
        let id = self.master()?.neonate_id().await?;
        self.adopt_connection(id)
    }

    // --- Transports ---

    fn transport_for(&self, remote: BusId) -> Option<Arc<dyn Transport>> {
        self.0.transports.get(&remote).map(|t| t.clone())
    }

    /// A transport reaching `remote`, negotiating a new one through the master
    /// if none exists. Concurrent requests for the same bus share one attempt.
    pub async fn resolve_transport(&self, remote: BusId) -> Result<Arc<dyn Transport>> {
        let me = self.require_id()?;
        if remote == me {
            let loopback: Arc<dyn Transport> = self.0.loopback.clone();
            return Ok(loopback);
        }
        if let Some(transport) = self.transport_for(remote) {
            return Ok(transport);
        }

        let gate = self.0.dialing.entry(remote).or_default().clone();
        let _held = gate.lock().await;
        if let Some(transport) = self.transport_for(remote) {
            return Ok(transport);
        }

        debug!(bus = %me, %remote, "requesting transport");
        let request: Shared = Arc::new(OpenTransport::new(self));
        self.master()?.request_connection(request, me, remote).await?;
        self.transport_for(remote).ok_or_else(|| {
            Error::Transport(TransportError::ConnectionLost(format!("no transport to {}", remote)))
        })
    }

    /// Records a negotiated transport to `remote`.
    pub(crate) fn adopt_transport(&self, remote: BusId, transport: Arc<dyn Transport>, shiboleth: Shiboleth) {
        transport.bind(remote, shiboleth);
        self.0.transports.insert(remote, transport);
        debug!(bus = ?self.id(), %remote, %shiboleth, "adopted transport");
    }

    /// Makes `hub` available for dialing other busses.
    pub fn attach_hub(&self, hub: &ChannelHub) {
        let _ = self.0.hub.set(hub.clone());
    }

    pub(crate) fn hub(&self) -> Result<ChannelHub> {
        self.0.hub.get().cloned().ok_or_else(|| Error::Local("bus has no hub to dial".into()))
    }

    pub(crate) fn server(&self) -> Result<Arc<ChannelServer>> {
        self.0.server.get().cloned().ok_or_else(|| Error::Local("bus is not serving".into()))
    }

    /// Listens on `hub` and registers this bus with the master as a server.
    /// Returns the dial code.
    pub async fn serve(&self, hub: &ChannelHub) -> Result<String> {
        let id = self.require_id()?;
        self.attach_hub(hub);
        let (code, server) = hub.listen(&id.to_string());
        let _ = self.0.server.set(server);
        self.master()?.register_server(id, &code).await?;
        debug!(bus = %id, %code, "serving");
        Ok(code)
    }

    // --- Lifecycle ---

    /// Stops the ticker, fails every pending call with `Error::Shutdown` and
    /// closes all transports.
    pub fn shutdown(&self) {
        let pending: Vec<PendingCall> = {
            let mut window = self.0.window();
            if self.0.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            window.iter_mut().flat_map(|bucket| bucket.drain().map(|(_, call)| call)).collect()
        };
        if let Some(ticker) = self.0.ticker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            ticker.abort();
        }
        for call in pending {
            let _ = call.waiter.send(Err(Error::Shutdown));
        }
        for transport in self.0.transports.iter() {
            transport.close();
        }
        self.0.transports.clear();
        self.0.loopback.close();
        self.0.connections.clear();
        debug!(bus = ?self.id(), "shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id())
            .field("connections", &self.0.connections.len())
            .field("transports", &self.0.transports.len())
            .finish()
    }
}
