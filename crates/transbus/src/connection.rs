//! # Connection
//!
//! Per-endpoint session state, and the dispatcher for every message that
//! arrives on one of its routes.
//!
//! ## Invariants
//!
//! - Sharing the same object twice yields the same `ObjectId`. Identity is the
//!   address of the shared allocation, which the object table keeps alive.
//! - Transverse maps are only ever appended. Lookups go in registration order,
//!   so the first offering to claim a name keeps it.
//! - A failure after a `MessageId` was read is answered with `MESSAGE_ERROR`
//!   for that id. Any other failure is answered with `GENERAL_ERROR`.
//! - Failures while handling a `GENERAL_ERROR` stay local.

use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use transpack::ConnectionId;
use transpack::Decoder;
use transpack::Header;
use transpack::MessageId;
use transpack::ObjectId;
use transpack::Reference;
use transpack::TransverseId;

use crate::bus::Bus;
use crate::bus::BusInner;
use crate::codec;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::exposed::CallContext;
use crate::exposed::TransverseMap;
use crate::proxy::ObjectProxy;
use crate::route::Layer;
use crate::route::Route;
use crate::value::Capability;
use crate::value::ObjectHandle;
use crate::value::Shared;
use crate::value::identity;

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    bus: Weak<BusInner>,
    /// ObjectId → object, for dereferencing.
    objects: DashMap<ObjectId, Shared>,
    /// Object identity → ObjectId, for sharing.
    identities: DashMap<usize, ObjectId>,
    object_count: AtomicU64,
    transverse: RwLock<Vec<TransverseMap>>,
    /// (peer connection, name) → what that peer resolved the name to.
    resolved: DashMap<(ConnectionId, TransverseId), Reference>,
    /// Peer connection → the route that reaches it.
    proxy_tokens: DashMap<ConnectionId, Route>,
}

#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

#[derive(Clone)]
pub struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(Connection)
    }
}

/// What the dispatcher learned about the message so far.
#[derive(Default)]
struct Inbound {
    message_id: Option<MessageId>,
    layers: Vec<Layer>,
    local_only: bool,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, bus: &Bus) -> Self {
        Self(Arc::new(ConnectionInner {
            id,
            bus: bus.downgrade(),
            objects: DashMap::new(),
            identities: DashMap::new(),
            object_count: AtomicU64::new(0),
            transverse: RwLock::new(Vec::new()),
            resolved: DashMap::new(),
            proxy_tokens: DashMap::new(),
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.0.id
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.0))
    }

    pub fn bus(&self) -> Result<Bus> {
        Bus::upgrade(&self.0.bus).ok_or(Error::Shutdown)
    }

    // --- Object identity ---

    /// Shares an object, returning the same reference every time for the same object.
    pub fn share_object(&self, object: &Shared) -> Reference {
        let key = identity(object);
        let id = *self.0.identities.entry(key).or_insert_with(|| {
            let id = ObjectId(self.0.object_count.fetch_add(1, Ordering::Relaxed));
            self.0.objects.insert(id, object.clone());
            trace!(connection = %self.0.id, object = %id, "shared object");
            id
        });
        Reference::new(self.0.id, id)
    }

    /// Dereferences one of our own references.
    ///
    /// # Errors
    /// - `UnknownObjectId` if the object was never shared.
    /// - `TypeMismatch` if it lacks `capability`.
    pub fn resolve_local_reference(&self, reference: Reference, capability: &Capability) -> Result<Shared> {
        if reference.connection != self.0.id {
            let sibling = self.bus().ok().and_then(|bus| bus.connection(reference.connection));
            return match sibling {
                Some(sibling) => sibling.resolve_local_reference(reference, capability),
                None => Err(Error::Fault(Fault::TypeMismatch(format!("{} is not local", reference)))),
            };
        }
        let object = self
            .0
            .objects
            .get(&reference.object)
            .map(|o| o.clone())
            .ok_or(Error::Fault(Fault::UnknownObjectId(reference.object)))?;
        if !capability.satisfied_by(object.as_ref()) {
            return Err(Error::Fault(Fault::TypeMismatch(format!(
                "{} is not a {}",
                reference, capability
            ))));
        }
        Ok(object)
    }

    /// Builds a proxy for a reference owned elsewhere.
    ///
    /// Uses the known route to the owning connection, or else the route the
    /// reference arrived on.
    pub fn resolve_remote_reference(&self, reference: Reference, via: &Route) -> ObjectProxy {
        let route = self.route_to(reference.connection).unwrap_or_else(|| via.clone());
        ObjectProxy::new(route, reference)
    }

    pub fn object_to_reference(&self, object: &ObjectHandle) -> Reference {
        match object {
            ObjectHandle::Local(shared) => self.share_object(shared),
            ObjectHandle::Remote(proxy) => proxy.reference(),
        }
    }

    pub fn reference_to_object(
        &self,
        reference: Reference,
        capability: &Capability,
        via: &Route,
    ) -> Result<ObjectHandle> {
        let on_this_bus = reference.connection == self.0.id
            || self.bus().ok().and_then(|bus| bus.connection(reference.connection)).is_some();
        if on_this_bus {
            Ok(ObjectHandle::Local(self.resolve_local_reference(reference, capability)?))
        } else {
            Ok(ObjectHandle::Remote(self.resolve_remote_reference(reference, via)))
        }
    }

    // --- Transverse names ---

    /// Appends a map of names offered on this connection.
    pub fn add_transverse_map(&self, map: TransverseMap) {
        let mut maps = self.0.transverse.write().unwrap_or_else(PoisonError::into_inner);
        maps.push(map);
    }

    /// First match across the maps, in registration order.
    pub fn lookup_transverse(&self, tid: &TransverseId) -> Option<Shared> {
        let maps = self.0.transverse.read().unwrap_or_else(PoisonError::into_inner);
        maps.iter().find_map(|map| map.get(tid))
    }

    pub(crate) fn transverse_maps(&self) -> Vec<TransverseMap> {
        self.0.transverse.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// What the peer at `remote` resolved `tid` to, if we asked before.
    pub fn cached_reference(&self, remote: ConnectionId, tid: &TransverseId) -> Option<Reference> {
        self.0.resolved.get(&(remote, tid.clone())).map(|r| *r)
    }

    /// Resolves a name on the peer across `route`, asking only once per peer.
    pub async fn resolve_transverse(&self, route: &Route, tid: &TransverseId) -> Result<Reference> {
        let remote = route.remote_connection()?;
        if let Some(reference) = self.cached_reference(remote, tid) {
            return Ok(reference);
        }

        let bus = self.bus()?;
        let body = bus
            .roundtrip(route, Vec::new(), |enc, id| {
                enc.header(Header::Resolve);
                enc.id(id);
                enc.transverse(tid);
                Ok(())
            })
            .await?;
        let reference = Decoder::new(&body).reference()?;

        // Another task may have resolved the same name while we waited.
        let cached = *self.0.resolved.entry((remote, tid.clone())).or_insert(reference);
        trace!(connection = %self.0.id, %tid, reference = %cached, "resolved transverse id");
        Ok(cached)
    }

    // --- Routes ---

    pub fn route_to(&self, connection: ConnectionId) -> Option<Route> {
        self.0.proxy_tokens.get(&connection).map(|r| r.clone())
    }

    pub(crate) fn register_route(&self, connection: ConnectionId, route: Route) {
        self.0.proxy_tokens.insert(connection, route);
    }

    // --- Dispatch ---

    /// Decodes and handles one inbound message.
    pub async fn dispatch(&self, origin: Route, message: Vec<u8>) {
        let mut inbound = Inbound::default();
        let Err(error) = self.handle(&origin, message, &mut inbound).await else {
            return;
        };
        let Ok(bus) = self.bus() else {
            return;
        };
        if inbound.local_only {
            bus.local_exception(&error);
            return;
        }
        self.report(&bus, &origin, inbound, error).await;
    }

    async fn handle(&self, origin: &Route, mut message: Vec<u8>, inbound: &mut Inbound) -> Result<()> {
        loop {
            let mut dec = Decoder::new(&message);
            let header = dec.header()?;
            trace!(connection = %self.0.id, ?header, "dispatching");
            match header {
                Header::FilterIn => {
                    let tag = dec.reference()?;
                    let filter = self.resolve_local_reference(tag, &Capability::Filter)?;
                    let element = filter
                        .as_filter()
                        .ok_or_else(|| Fault::TypeMismatch(format!("{} is not a filter", tag)))?;
                    message = element.transcode(dec.rest())?;
                }
                Header::FilterOut => {
                    let local = dec.reference()?;
                    let remote = dec.reference()?;
                    let filter = self.resolve_local_reference(local, &Capability::Filter)?;
                    inbound.layers.push(Layer::FilterIn { tag: remote, filter });
                    message = dec.rest().to_vec();
                }
                Header::Resolve => return self.receive_resolve(origin, &mut dec, inbound).await,
                Header::Eval => return self.receive_eval(origin, &mut dec, inbound).await,
                Header::Notify => return self.receive_notify(origin, &mut dec).await,
                Header::Reply => return self.receive_reply(origin, &mut dec),
                Header::MessageError => return self.receive_message_error(origin, &mut dec),
                Header::GeneralError => return self.receive_general_error(origin, &mut dec, inbound),
            }
        }
    }

    fn reply_buffer(&self, origin: &Route, inbound: &Inbound) -> crate::route::OutBuffer {
        let mut out = origin.open_buffer();
        for layer in &inbound.layers {
            out.wrap(layer.clone());
        }
        out
    }

    async fn receive_resolve(&self, origin: &Route, dec: &mut Decoder<'_>, inbound: &mut Inbound) -> Result<()> {
        let id: MessageId = dec.id()?;
        inbound.message_id = Some(id);
        let tid = dec.transverse()?;

        let object = self
            .lookup_transverse(&tid)
            .ok_or(Error::Fault(Fault::UnknownTransverseId(tid)))?;
        let reference = self.share_object(&object);

        let mut out = self.reply_buffer(origin, inbound);
        let enc = out.encoder();
        enc.header(Header::Reply);
        enc.id(id);
        enc.reference(&reference);
        out.commit().await
    }

    fn resolve_call(&self, reference: Reference) -> Result<Shared> {
        if reference.connection != self.0.id {
            return Err(Error::Fault(Fault::TypeMismatch(format!("call {} is not local", reference))));
        }
        self.resolve_local_reference(reference, &Capability::Call)
    }

    async fn receive_eval(&self, origin: &Route, dec: &mut Decoder<'_>, inbound: &mut Inbound) -> Result<()> {
        let id: MessageId = dec.id()?;
        inbound.message_id = Some(id);
        let call = self.resolve_call(dec.reference()?)?;
        let exposed = call
            .as_call()
            .ok_or_else(|| Fault::TypeMismatch("not a call".into()))?;

        let args = codec::decode_values(dec, exposed.params(), self, origin)?;
        let ctx = CallContext::new(self.clone(), origin.clone());
        let results = exposed.invoke(ctx, args).await?;

        let mut out = self.reply_buffer(origin, inbound);
        let enc = out.encoder();
        enc.header(Header::Reply);
        enc.id(id);
        codec::encode_values(enc, exposed.results(), &results, self)?;
        out.commit().await
    }

    async fn receive_notify(&self, origin: &Route, dec: &mut Decoder<'_>) -> Result<()> {
        let call = self.resolve_call(dec.reference()?)?;
        let exposed = call
            .as_call()
            .ok_or_else(|| Fault::TypeMismatch("not a call".into()))?;

        let args = codec::decode_values(dec, exposed.params(), self, origin)?;
        let ctx = CallContext::new(self.clone(), origin.clone());
        exposed.invoke(ctx, args).await?;
        Ok(())
    }

    fn receive_reply(&self, origin: &Route, dec: &mut Decoder<'_>) -> Result<()> {
        let id: MessageId = dec.id()?;
        let waiter = self.bus()?.resolve_reply(id, origin)?;
        let _ = waiter.send(Ok(dec.rest().to_vec()));
        Ok(())
    }

    fn receive_message_error(&self, origin: &Route, dec: &mut Decoder<'_>) -> Result<()> {
        let id: MessageId = dec.id()?;
        let waiter = self.bus()?.resolve_reply(id, origin)?;
        // The waiter is already claimed, so it must hear something.
        let fault = Fault::decode(dec).unwrap_or_else(|e| Fault::Decoding(e.to_string()));
        debug!(connection = %self.0.id, %id, %fault, "call failed remotely");
        let _ = waiter.send(Err(Error::Remote(fault)));
        Ok(())
    }

    fn receive_general_error(&self, origin: &Route, dec: &mut Decoder<'_>, inbound: &mut Inbound) -> Result<()> {
        inbound.local_only = true;
        let fault = Fault::decode(dec)?;
        self.bus()?.report_failure(origin, &fault);
        Ok(())
    }

    /// Sends a failure back to the peer, or closes the route if even that fails.
    async fn report(&self, bus: &Bus, origin: &Route, inbound: Inbound, error: Error) {
        if !error.is_transverse() {
            bus.local_exception(&error);
        }
        let fault = error.to_fault(bus.config().debug_errors);
        warn!(connection = %self.0.id, message = ?inbound.message_id, %error, "reporting failure to peer");

        let mut out = self.reply_buffer(origin, &inbound);
        let enc = out.encoder();
        match inbound.message_id {
            Some(id) => {
                enc.header(Header::MessageError);
                enc.id(id);
            }
            None => enc.header(Header::GeneralError),
        }
        let sent = match fault.encode(enc) {
            Ok(()) => out.commit().await,
            Err(e) => Err(Error::Fault(Fault::Encoding(e.to_string()))),
        };

        if let Err(e) = sent {
            origin.close();
            bus.local_exception(&Error::RemoteEndFailure(e.to_string()));
        }
    }
}
