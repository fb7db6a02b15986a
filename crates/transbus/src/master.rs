//! # Bus Master
//!
//! Hands out connection ids, keeps the registry of offered services, and
//! brokers every route and transport between busses.
//!
//! ## Route Rendezvous
//!
//! `connect` supplies each end with the other's bus, which makes each bus
//! resolve a transport to the other, then completes both ends with each
//! other's token and connection id.
//!
//! ## Transport Rendezvous
//!
//! When two busses have no transport yet, both call `request_connection`, each
//! without knowing about the other. The first caller for an (unordered) pair
//! parks on a oneshot; the second mints the shiboleth and wakes it. Both then
//! get the same value, and exactly one of them is told to accept while the
//! other dials.
//!
//! ## Invariants
//!
//! - Connection ids are unique across every bus served by this master.
//! - Both ends of a negotiated transport carry the same shiboleth.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use transpack::BusId;
use transpack::ConnectionId;
use transpack::TransverseId;

use crate::client::OfferingHandle;
use crate::client::OpenRouteHandle;
use crate::client::TransportRequestHandle;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::transport::Shiboleth;

pub struct BusMaster {
    bus: OnceLock<BusId>,
    neonate: AtomicU64,
    offerings: DashMap<String, OfferingHandle>,
    servers: DashMap<BusId, String>,
    waiting: DashMap<(BusId, BusId), oneshot::Sender<Shiboleth>>,
}

impl BusMaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bus: OnceLock::new(),
            neonate: AtomicU64::new(1),
            offerings: DashMap::new(),
            servers: DashMap::new(),
            waiting: DashMap::new(),
        })
    }

    /// Records the bus hosting this master.
    pub fn attach(&self, bus: BusId) {
        if self.bus.set(bus).is_err() {
            warn!(%bus, "bus master is already attached");
        }
    }

    fn bus(&self) -> Result<BusId> {
        self.bus
            .get()
            .copied()
            .ok_or_else(|| Error::Local("bus master is not attached to a bus".into()))
    }

    /// A connection id never handed out before.
    pub fn neonate_id(&self) -> ConnectionId {
        ConnectionId(self.neonate.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `offering` under `name`, replacing any earlier offering.
    pub fn offer(&self, name: &str, offering: OfferingHandle) {
        if self.offerings.insert(name.to_string(), offering).is_some() {
            debug!(name, "replaced service offering");
        } else {
            debug!(name, "service offered");
        }
    }

    /// Asks the offering registered under `name` for a prospective route.
    ///
    /// # Errors
    /// `UnknownTransverseId` naming the service if nothing is offered under it.
    pub async fn discover(&self, name: &str) -> Result<OpenRouteHandle> {
        let offering = self
            .offerings
            .get(name)
            .map(|o| o.clone())
            .ok_or_else(|| Error::Fault(Fault::UnknownTransverseId(TransverseId::from_name(name))))?;
        offering.request().await
    }

    /// Completes two open routes towards each other.
    pub async fn connect(&self, a: OpenRouteHandle, b: OpenRouteHandle) -> Result<()> {
        let master = self.bus()?;
        let (bus_a, bus_b) = (a.bus(master), b.bus(master));
        debug!(%bus_a, %bus_b, "connecting routes");

        // Each side may need a fresh transport, and that needs both sides asking.
        let (token_a, token_b) = tokio::try_join!(a.supply_endpoint_bus(bus_b), b.supply_endpoint_bus(bus_a))?;
        let (conn_a, conn_b) = tokio::try_join!(a.connection_id(), b.connection_id())?;
        tokio::try_join!(a.complete_route(token_b, conn_b), b.complete_route(token_a, conn_a))?;

        debug!(%conn_a, %conn_b, "routes connected");
        Ok(())
    }

    /// Records that `bus` accepts transports dialed at `code`.
    pub fn register_server(&self, bus: BusId, code: &str) {
        self.servers.insert(bus, code.to_string());
        debug!(%bus, code, "registered server");
    }

    pub fn server_code(&self, bus: BusId) -> Option<String> {
        self.servers.get(&bus).map(|c| c.clone())
    }

    /// Waits until the other bus of the pair arrives, and agrees on a shiboleth.
    async fn rendezvous(&self, a: BusId, b: BusId) -> Result<Shiboleth> {
        let key = if a <= b { (a, b) } else { (b, a) };
        loop {
            let rx = match self.waiting.entry(key) {
                Entry::Occupied(e) => {
                    let tx = e.remove();
                    let shiboleth = Shiboleth::random();
                    if tx.send(shiboleth).is_ok() {
                        debug!(%a, %b, %shiboleth, "rendezvous complete");
                        return Ok(shiboleth);
                    }
                    // The first caller gave up; take its place.
                    continue;
                }
                Entry::Vacant(e) => {
                    let (tx, rx) = oneshot::channel();
                    e.insert(tx);
                    rx
                }
            };
            return rx.await.map_err(|_| Error::Shutdown);
        }
    }

    /// Has `me` and `remote` agree on a transport between them.
    ///
    /// The acceptor is `me` if it serves and `remote` either does not serve or
    /// has a higher id. Otherwise `me` dials `remote`'s code.
    ///
    /// # Errors
    /// `NoServer` if neither bus serves.
    pub async fn request_connection(&self, request: TransportRequestHandle, me: BusId, remote: BusId) -> Result<()> {
        let shiboleth = self.rendezvous(me, remote).await?;
        let mine = self.server_code(me);
        let theirs = self.server_code(remote);

        match (mine, theirs) {
            (Some(_), None) => request.accept(remote, shiboleth).await,
            (Some(_), Some(_)) if me < remote => request.accept(remote, shiboleth).await,
            (_, Some(code)) => request.connect(remote, &code, shiboleth).await,
            (None, None) => Err(Error::NoServer { local: me, remote }),
        }
    }
}
