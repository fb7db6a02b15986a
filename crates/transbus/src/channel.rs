//! In-process packet transports.
//!
//! `ChannelTransport` frames each message as `[RouteToken: SerialID][message]`
//! over a pair of unbounded tokio channels. Handshake packets skip the route
//! layer and are marked with `BOOTSTRP`. `ChannelHub` stands in for a dialer:
//! busses listen under `mem://<name>` codes and peers dial those codes.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use transpack::BusId;
use transpack::Decoder;
use transpack::Encoder;
use transpack::RouteToken;

use crate::route::Route;
use crate::transport;
use crate::transport::RouteTable;
use crate::transport::Shiboleth;
use crate::transport::Transport;
use crate::transport::TransportError;

/// Prefix of every handshake packet.
pub const BOOTSTRAP_MARKER: &[u8] = b"BOOTSTRP";

/// Outbound half of a live transport. Dropping it ends both pumps.
struct Link {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    _stop: oneshot::Sender<()>,
}

/// A duplex packet transport over tokio mpsc channels.
///
/// Messages sent on one end are delivered to the routes of the other.
/// Closing either end ends delivery in both directions.
pub struct ChannelTransport {
    link: std::sync::Mutex<Option<Link>>,
    table: Arc<RouteTable>,
    bootstrap: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    binding: OnceLock<(BusId, Shiboleth)>,
    sent: AtomicU64,
}

impl ChannelTransport {
    /// Creates a pair of transports connected to each other and starts their pumps.
    ///
    /// Must be called from within a tokio runtime.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Self::spawn(tx_a, rx_b);
        let b = Self::spawn(tx_b, rx_a);
        (a, b)
    }

    fn spawn(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Arc<Self> {
        let table = RouteTable::new();
        let (boot_tx, boot_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(Self::pump(rx, table.clone(), boot_tx, stop_rx));
        Arc::new(Self {
            link: std::sync::Mutex::new(Some(Link { tx, _stop: stop_tx })),
            table,
            bootstrap: Mutex::new(boot_rx),
            binding: OnceLock::new(),
            sent: AtomicU64::new(0),
        })
    }

    /// Demultiplexes inbound packets until either end closes.
    ///
    /// Dropping `rx` on the way out makes the peer's sends fail, and clearing
    /// the table releases the routes holding this transport.
    async fn pump(
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        table: Arc<RouteTable>,
        bootstrap: mpsc::UnboundedSender<Vec<u8>>,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            let packet = tokio::select! {
                packet = rx.recv() => packet,
                _ = &mut stop => None,
            };
            let Some(packet) = packet else { break };
            if let Some(handshake) = packet.strip_prefix(BOOTSTRAP_MARKER) {
                let _ = bootstrap.send(handshake.to_vec());
                continue;
            }
            let mut dec = Decoder::new(&packet);
            match dec.id::<RouteToken>() {
                Ok(token) => table.deliver(token, dec.rest().to_vec()),
                Err(e) => warn!("dropping unframed packet: {}", e),
            }
        }
        table.clear();
        debug!("channel transport pump stopped");
    }

    /// Number of route messages sent on this end.
    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Number of routes registered on this end.
    pub fn route_count(&self) -> usize {
        self.table.len()
    }

    fn push(&self, packet: Vec<u8>) -> transport::Result<()> {
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(link) = link.as_ref() else {
            return Err(TransportError::Closed);
        };
        link.tx
            .send(packet)
            .map_err(|_| TransportError::ConnectionLost("Channel closed".into()))
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    fn register_route(&self, route: &Route) -> RouteToken {
        self.table.register(route)
    }

    fn unregister_route(&self, token: RouteToken) {
        self.table.unregister(token);
    }

    async fn send(&self, destination: RouteToken, message: Vec<u8>) -> transport::Result<()> {
        let mut enc = Encoder::new();
        enc.id(destination);
        enc.raw(&message);
        self.push(enc.into_bytes())?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remote_bus(&self) -> Option<BusId> {
        self.binding.get().map(|(bus, _)| *bus)
    }

    fn shiboleth(&self) -> Option<Shiboleth> {
        self.binding.get().map(|(_, shib)| *shib)
    }

    fn bind(&self, remote: BusId, shiboleth: Shiboleth) {
        if self.binding.set((remote, shiboleth)).is_err() {
            warn!(%remote, "channel transport already bound");
        }
    }

    async fn send_bootstrap(&self, packet: Vec<u8>) -> transport::Result<()> {
        let mut framed = BOOTSTRAP_MARKER.to_vec();
        framed.extend_from_slice(&packet);
        self.push(framed)
    }

    async fn recv_bootstrap(&self) -> transport::Result<Vec<u8>> {
        let mut rx = self.bootstrap.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| TransportError::ConnectionLost("Channel closed during handshake".into()))
    }

    fn close(&self) {
        self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.table.clear();
    }
}

enum Slot {
    Waiting(oneshot::Sender<Arc<ChannelTransport>>),
    Arrived(Arc<ChannelTransport>),
}

/// Accepting end of a `mem://` code.
///
/// Inbound transports are matched to `accept` calls by shiboleth, in whichever
/// order the two arrive.
#[derive(Default)]
pub struct ChannelServer {
    slots: DashMap<Shiboleth, Slot>,
}

impl ChannelServer {
    /// Waits for the transport dialed with this shiboleth.
    pub async fn accept(&self, shiboleth: Shiboleth) -> transport::Result<Arc<ChannelTransport>> {
        let rx = match self.slots.entry(shiboleth) {
            Entry::Occupied(e) => {
                return match e.remove() {
                    Slot::Arrived(transport) => Ok(transport),
                    Slot::Waiting(_) => Err(TransportError::Io(format!("{} accepted twice", shiboleth))),
                };
            }
            Entry::Vacant(e) => {
                let (tx, rx) = oneshot::channel();
                e.insert(Slot::Waiting(tx));
                rx
            }
        };
        rx.await
            .map_err(|_| TransportError::ConnectionLost("Server dropped pending accept".into()))
    }

    fn arrive(&self, shiboleth: Shiboleth, transport: Arc<ChannelTransport>) -> transport::Result<()> {
        match self.slots.entry(shiboleth) {
            Entry::Occupied(e) => match e.remove() {
                Slot::Waiting(tx) => tx
                    .send(transport)
                    .map_err(|_| TransportError::ConnectionLost("Acceptor went away".into())),
                Slot::Arrived(_) => Err(TransportError::Io(format!("{} dialed twice", shiboleth))),
            },
            Entry::Vacant(e) => {
                e.insert(Slot::Arrived(transport));
                Ok(())
            }
        }
    }
}

/// In-process registry of listening busses.
#[derive(Clone, Default)]
pub struct ChannelHub {
    servers: Arc<DashMap<String, Arc<ChannelServer>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts listening under `mem://<name>` and returns the dial code.
    pub fn listen(&self, name: &str) -> (String, Arc<ChannelServer>) {
        let code = format!("mem://{}", name);
        let server = self
            .servers
            .entry(code.clone())
            .or_insert_with(|| Arc::new(ChannelServer::default()))
            .clone();
        (code, server)
    }

    /// Dials a listening bus, handing it the far end of a fresh transport pair.
    pub fn dial(&self, code: &str, shiboleth: Shiboleth) -> transport::Result<Arc<ChannelTransport>> {
        let server = self
            .servers
            .get(code)
            .map(|s| s.clone())
            .ok_or_else(|| TransportError::ConnectionLost(format!("Nobody listens on {}", code)))?;
        let (near, far) = ChannelTransport::pair();
        server.arrive(shiboleth, far)?;
        Ok(near)
    }
}
