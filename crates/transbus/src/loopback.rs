//! Transport between connections living on the same bus.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use transpack::BusId;
use transpack::RouteToken;

use crate::route::Route;
use crate::transport;
use crate::transport::RouteTable;
use crate::transport::Shiboleth;
use crate::transport::Transport;
use crate::transport::TransportError;

/// Delivers every message back into its own route table.
pub struct LoopbackTransport {
    table: Arc<RouteTable>,
    shiboleth: Shiboleth,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            table: RouteTable::new(),
            shiboleth: Shiboleth::random(),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    fn register_route(&self, route: &Route) -> RouteToken {
        self.table.register(route)
    }

    fn unregister_route(&self, token: RouteToken) {
        self.table.unregister(token);
    }

    async fn send(&self, destination: RouteToken, message: Vec<u8>) -> transport::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.table.get(destination).is_none() {
            return Err(TransportError::UnknownRoute(destination));
        }
        self.table.deliver(destination, message);
        Ok(())
    }

    fn remote_bus(&self) -> Option<BusId> {
        None
    }

    fn shiboleth(&self) -> Option<Shiboleth> {
        Some(self.shiboleth)
    }

    fn bind(&self, _remote: BusId, _shiboleth: Shiboleth) {}

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.table.clear();
    }
}
