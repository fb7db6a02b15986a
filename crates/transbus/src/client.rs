//! # Bus Client Surface
//!
//! The interfaces every bus speaks to its master and to its peers, and the
//! handles that hide whether the object behind them is local or remote.
//!
//! - `BusMaster` is served by the master connection of the seed bus.
//! - `OpenRoute`, `ServiceOffering` and `OpenTransport` are served by every
//!   connection, so the master can drive negotiations on any bus.
//!
//! A handle is `Local` when the object lives on this bus and `Remote` when it
//! arrived as a reference from elsewhere. Either way the same operation runs;
//! remote handles just go through a proxy call.

use std::any::Any;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Weak;

use transpack::BusId;
use transpack::ConnectionId;
use transpack::RouteToken;

use crate::bus::Bus;
use crate::bus::BusInner;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::exposed::CallContext;
use crate::exposed::TransverseMap;
use crate::exposed::handler;
use crate::master::BusMaster;
use crate::proxy::ObjectProxy;
use crate::proxy::ServiceProxy;
use crate::route::OpenRoute;
use crate::service::Interface;
use crate::service::ServiceImplementation;
use crate::service::ServiceOffering;
use crate::transport::Shiboleth;
use crate::value::Exposed;
use crate::value::ObjectHandle;
use crate::value::Shared;
use crate::value::Type;
use crate::value::Value;
use crate::value::downcast;

pub const BUS_MASTER_NAME: &str = "BusMaster";
pub const OPEN_ROUTE_NAME: &str = "OpenRoute";
pub const SERVICE_OFFERING_NAME: &str = "ServiceOffering";
pub const OPEN_TRANSPORT_NAME: &str = "OpenTransport";

static BUS_MASTER: LazyLock<Arc<Interface>> = LazyLock::new(|| {
    Interface::new(BUS_MASTER_NAME)
        .function("offer", vec![Type::String, Type::object(SERVICE_OFFERING_NAME)], vec![])
        .function("discover", vec![Type::String], vec![Type::object(OPEN_ROUTE_NAME)])
        .function("connect", vec![Type::object(OPEN_ROUTE_NAME), Type::object(OPEN_ROUTE_NAME)], vec![])
        .function("neonateId", vec![], vec![Type::Serial])
        .function("registerServer", vec![Type::Serial, Type::String], vec![])
        .function(
            "requestConnection",
            vec![Type::object(OPEN_TRANSPORT_NAME), Type::Serial, Type::Serial],
            vec![],
        )
        .shared()
});

static OPEN_ROUTE: LazyLock<Arc<Interface>> = LazyLock::new(|| {
    Interface::new(OPEN_ROUTE_NAME)
        .method("supplyEndpointBus", vec![Type::Serial], vec![Type::Serial])
        .method("completeRoute", vec![Type::Serial, Type::Serial], vec![])
        .method("getConnectionId", vec![], vec![Type::Serial])
        .shared()
});

static SERVICE_OFFERING: LazyLock<Arc<Interface>> = LazyLock::new(|| {
    Interface::new(SERVICE_OFFERING_NAME)
        .method("request", vec![], vec![Type::object(OPEN_ROUTE_NAME)])
        .shared()
});

static OPEN_TRANSPORT: LazyLock<Arc<Interface>> = LazyLock::new(|| {
    Interface::new(OPEN_TRANSPORT_NAME)
        .method("accept", vec![Type::Serial, Type::Serial], vec![])
        .method("connect", vec![Type::Serial, Type::String, Type::Serial], vec![])
        .shared()
});

pub fn bus_master_interface() -> Arc<Interface> {
    BUS_MASTER.clone()
}

pub fn open_route_interface() -> Arc<Interface> {
    OPEN_ROUTE.clone()
}

pub fn service_offering_interface() -> Arc<Interface> {
    SERVICE_OFFERING.clone()
}

pub fn open_transport_interface() -> Arc<Interface> {
    OPEN_TRANSPORT.clone()
}

fn arg(args: &[Value], index: usize) -> Result<&Value> {
    args.get(index)
        .ok_or_else(|| Error::Fault(Fault::TypeMismatch(format!("missing argument {}", index))))
}

fn single(mut results: Vec<Value>) -> Result<Value> {
    match results.len() {
        1 => Ok(results.remove(0)),
        n => Err(Error::Fault(Fault::Decoding(format!("expected one result, got {}", n)))),
    }
}

async fn invoke(proxy: &ObjectProxy, interface: &Interface, member: &str, args: Vec<Value>) -> Result<Vec<Value>> {
    proxy.bind(interface.member(member)?).eval(args).await
}

fn split(value: &Value) -> Result<Either<Shared, ObjectProxy>> {
    match value.as_object()? {
        ObjectHandle::Local(shared) => Ok(Either::Local(shared.clone())),
        ObjectHandle::Remote(proxy) => Ok(Either::Remote(proxy.clone())),
    }
}

enum Either<L, R> {
    Local(L),
    Remote(R),
}

fn expect_local<T: Exposed>(shared: &Shared, name: &str) -> Result<Arc<T>> {
    downcast::<T>(shared).ok_or_else(|| Error::Fault(Fault::TypeMismatch(format!("expected {}", name))))
}

/// The bus master, wherever it lives.
#[derive(Clone)]
pub enum MasterHandle {
    Local(Arc<BusMaster>),
    Remote(ServiceProxy),
}

impl MasterHandle {
    pub async fn offer(&self, name: &str, offering: Shared) -> Result<()> {
        match self {
            Self::Local(master) => {
                let offering = OfferingHandle::from_value(&Value::local(offering))?;
                master.offer(name, offering);
                Ok(())
            }
            Self::Remote(proxy) => {
                proxy.call("offer", vec![Value::string(name), Value::local(offering)]).await?;
                Ok(())
            }
        }
    }

    pub async fn discover(&self, name: &str) -> Result<OpenRouteHandle> {
        match self {
            Self::Local(master) => master.discover(name).await,
            Self::Remote(proxy) => {
                let route = single(proxy.call("discover", vec![Value::string(name)]).await?)?;
                OpenRouteHandle::from_value(&route)
            }
        }
    }

    pub async fn connect(&self, a: OpenRouteHandle, b: OpenRouteHandle) -> Result<()> {
        match self {
            Self::Local(master) => master.connect(a, b).await,
            Self::Remote(proxy) => {
                proxy.call("connect", vec![a.to_value(), b.to_value()]).await?;
                Ok(())
            }
        }
    }

    pub async fn neonate_id(&self) -> Result<ConnectionId> {
        match self {
            Self::Local(master) => Ok(master.neonate_id()),
            Self::Remote(proxy) => {
                let id = single(proxy.call("neonateId", vec![]).await?)?;
                Ok(ConnectionId(id.as_serial()?))
            }
        }
    }

    pub async fn register_server(&self, bus: BusId, code: &str) -> Result<()> {
        match self {
            Self::Local(master) => {
                master.register_server(bus, code);
                Ok(())
            }
            Self::Remote(proxy) => {
                proxy
                    .call("registerServer", vec![Value::Serial(bus.0), Value::string(code)])
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn request_connection(&self, request: Shared, me: BusId, remote: BusId) -> Result<()> {
        match self {
            Self::Local(master) => {
                let request = TransportRequestHandle::from_value(&Value::local(request))?;
                master.request_connection(request, me, remote).await
            }
            Self::Remote(proxy) => {
                let args = vec![Value::local(request), Value::Serial(me.0), Value::Serial(remote.0)];
                proxy.call("requestConnection", args).await?;
                Ok(())
            }
        }
    }
}

/// One end of a route under negotiation.
#[derive(Clone)]
pub enum OpenRouteHandle {
    Local(Arc<OpenRoute>),
    Remote(ObjectProxy),
}

impl OpenRouteHandle {
    pub fn from_value(value: &Value) -> Result<Self> {
        match split(value)? {
            Either::Local(shared) => Ok(Self::Local(expect_local(&shared, OPEN_ROUTE_NAME)?)),
            Either::Remote(proxy) => Ok(Self::Remote(proxy)),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Local(open) => Value::local(open.clone()),
            Self::Remote(proxy) => Value::Object(ObjectHandle::Remote(proxy.clone())),
        }
    }

    /// The bus this end lives on, as seen from `local`.
    pub fn bus(&self, local: BusId) -> BusId {
        match self {
            Self::Local(_) => local,
            Self::Remote(proxy) => proxy.route().remote_bus(local),
        }
    }

    pub async fn supply_endpoint_bus(&self, bus: BusId) -> Result<RouteToken> {
        match self {
            Self::Local(open) => open.supply_endpoint_bus(bus).await,
            Self::Remote(proxy) => {
                let args = vec![Value::Serial(bus.0)];
                let token = single(invoke(proxy, &OPEN_ROUTE, "supplyEndpointBus", args).await?)?;
                Ok(RouteToken(token.as_serial()?))
            }
        }
    }

    pub async fn complete_route(&self, token: RouteToken, connection: ConnectionId) -> Result<()> {
        match self {
            Self::Local(open) => open.complete_route(token, connection),
            Self::Remote(proxy) => {
                let args = vec![Value::Serial(token.0), Value::Serial(connection.0)];
                invoke(proxy, &OPEN_ROUTE, "completeRoute", args).await?;
                Ok(())
            }
        }
    }

    pub async fn connection_id(&self) -> Result<ConnectionId> {
        match self {
            Self::Local(open) => Ok(open.connection_id()),
            Self::Remote(proxy) => {
                let id = single(invoke(proxy, &OPEN_ROUTE, "getConnectionId", vec![]).await?)?;
                Ok(ConnectionId(id.as_serial()?))
            }
        }
    }
}

/// A service offering registered with the master.
#[derive(Clone)]
pub enum OfferingHandle {
    Local(Arc<ServiceOffering>),
    Remote(ObjectProxy),
}

impl OfferingHandle {
    pub fn from_value(value: &Value) -> Result<Self> {
        match split(value)? {
            Either::Local(shared) => Ok(Self::Local(expect_local(&shared, SERVICE_OFFERING_NAME)?)),
            Either::Remote(proxy) => Ok(Self::Remote(proxy)),
        }
    }

    pub async fn request(&self) -> Result<OpenRouteHandle> {
        match self {
            Self::Local(offering) => Ok(OpenRouteHandle::Local(offering.request().await?)),
            Self::Remote(proxy) => {
                let route = single(invoke(proxy, &SERVICE_OFFERING, "request", vec![]).await?)?;
                OpenRouteHandle::from_value(&route)
            }
        }
    }
}

/// A bus waiting to be told how to reach another bus.
#[derive(Clone)]
pub enum TransportRequestHandle {
    Local(Arc<OpenTransport>),
    Remote(ObjectProxy),
}

impl TransportRequestHandle {
    pub fn from_value(value: &Value) -> Result<Self> {
        match split(value)? {
            Either::Local(shared) => Ok(Self::Local(expect_local(&shared, OPEN_TRANSPORT_NAME)?)),
            Either::Remote(proxy) => Ok(Self::Remote(proxy)),
        }
    }

    pub async fn accept(&self, remote: BusId, shiboleth: Shiboleth) -> Result<()> {
        match self {
            Self::Local(request) => request.accept(remote, shiboleth).await,
            Self::Remote(proxy) => {
                let args = vec![Value::Serial(remote.0), Value::Serial(shiboleth.0)];
                invoke(proxy, &OPEN_TRANSPORT, "accept", args).await?;
                Ok(())
            }
        }
    }

    pub async fn connect(&self, remote: BusId, code: &str, shiboleth: Shiboleth) -> Result<()> {
        match self {
            Self::Local(request) => request.connect(remote, code, shiboleth),
            Self::Remote(proxy) => {
                let args = vec![Value::Serial(remote.0), Value::string(code), Value::Serial(shiboleth.0)];
                invoke(proxy, &OPEN_TRANSPORT, "connect", args).await?;
                Ok(())
            }
        }
    }
}

/// Lets the master tell a bus to accept or dial a new transport.
pub struct OpenTransport {
    bus: Weak<BusInner>,
}

impl OpenTransport {
    pub fn new(bus: &Bus) -> Self {
        Self { bus: bus.downgrade() }
    }

    fn bus(&self) -> Result<Bus> {
        Bus::upgrade(&self.bus).ok_or(Error::Shutdown)
    }

    /// Waits for `remote` to dial in with `shiboleth`.
    pub async fn accept(&self, remote: BusId, shiboleth: Shiboleth) -> Result<()> {
        let bus = self.bus()?;
        let transport = bus.server()?.accept(shiboleth).await?;
        bus.adopt_transport(remote, transport, shiboleth);
        Ok(())
    }

    /// Dials `remote` at `code`.
    pub fn connect(&self, remote: BusId, code: &str, shiboleth: Shiboleth) -> Result<()> {
        let bus = self.bus()?;
        let transport = bus.hub()?.dial(code, shiboleth)?;
        bus.adopt_transport(remote, transport, shiboleth);
        Ok(())
    }
}

impl Exposed for OpenTransport {
    fn interface(&self) -> Option<&str> {
        Some(OPEN_TRANSPORT_NAME)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

async fn supply_endpoint_bus(_: CallContext, args: Vec<Value>) -> Result<Vec<Value>> {
    let open = arg(&args, 0)?.as_local::<OpenRoute>()?;
    let bus = BusId(arg(&args, 1)?.as_serial()?);
    let token = open.supply_endpoint_bus(bus).await?;
    Ok(vec![Value::Serial(token.0)])
}

async fn complete_route(_: CallContext, args: Vec<Value>) -> Result<Vec<Value>> {
    let open = arg(&args, 0)?.as_local::<OpenRoute>()?;
    let token = RouteToken(arg(&args, 1)?.as_serial()?);
    let connection = ConnectionId(arg(&args, 2)?.as_serial()?);
    open.complete_route(token, connection)?;
    Ok(vec![])
}

async fn get_connection_id(_: CallContext, args: Vec<Value>) -> Result<Vec<Value>> {
    let open = arg(&args, 0)?.as_local::<OpenRoute>()?;
    Ok(vec![Value::Serial(open.connection_id().0)])
}

async fn request_route(_: CallContext, args: Vec<Value>) -> Result<Vec<Value>> {
    let offering = arg(&args, 0)?.as_local::<ServiceOffering>()?;
    let open = offering.request().await?;
    Ok(vec![Value::local(open)])
}

async fn accept_transport(_: CallContext, args: Vec<Value>) -> Result<Vec<Value>> {
    let request = arg(&args, 0)?.as_local::<OpenTransport>()?;
    let remote = BusId(arg(&args, 1)?.as_serial()?);
    let shiboleth = Shiboleth(arg(&args, 2)?.as_serial()?);
    request.accept(remote, shiboleth).await?;
    Ok(vec![])
}

async fn dial_transport(_: CallContext, args: Vec<Value>) -> Result<Vec<Value>> {
    let request = arg(&args, 0)?.as_local::<OpenTransport>()?;
    let remote = BusId(arg(&args, 1)?.as_serial()?);
    let code = arg(&args, 2)?.as_str()?;
    let shiboleth = Shiboleth(arg(&args, 3)?.as_serial()?);
    request.connect(remote, code, shiboleth)?;
    Ok(vec![])
}

/// Names every connection serves so the master can drive it.
pub fn client_map() -> Result<TransverseMap> {
    let open_route = ServiceImplementation::new(open_route_interface())
        .implement("supplyEndpointBus", handler(supply_endpoint_bus))
        .implement("completeRoute", handler(complete_route))
        .implement("getConnectionId", handler(get_connection_id))
        .build()?;
    let offering = ServiceImplementation::new(service_offering_interface())
        .implement("request", handler(request_route))
        .build()?;
    let transport = ServiceImplementation::new(open_transport_interface())
        .implement("accept", handler(accept_transport))
        .implement("connect", handler(dial_transport))
        .build()?;

    let mut map = TransverseMap::new();
    map.merge(open_route.transverse_map().clone());
    map.merge(offering.transverse_map().clone());
    map.merge(transport.transverse_map().clone());
    Ok(map)
}

async fn offer(master: Arc<BusMaster>, args: Vec<Value>) -> Result<Vec<Value>> {
    let name = arg(&args, 0)?.as_str()?;
    let offering = OfferingHandle::from_value(arg(&args, 1)?)?;
    master.offer(name, offering);
    Ok(vec![])
}

async fn discover(master: Arc<BusMaster>, args: Vec<Value>) -> Result<Vec<Value>> {
    let name = arg(&args, 0)?.as_str()?;
    let route = master.discover(name).await?;
    Ok(vec![route.to_value()])
}

async fn connect(master: Arc<BusMaster>, args: Vec<Value>) -> Result<Vec<Value>> {
    let a = OpenRouteHandle::from_value(arg(&args, 0)?)?;
    let b = OpenRouteHandle::from_value(arg(&args, 1)?)?;
    master.connect(a, b).await?;
    Ok(vec![])
}

async fn neonate_id(master: Arc<BusMaster>, _: Vec<Value>) -> Result<Vec<Value>> {
    Ok(vec![Value::Serial(master.neonate_id().0)])
}

async fn register_server(master: Arc<BusMaster>, args: Vec<Value>) -> Result<Vec<Value>> {
    let bus = BusId(arg(&args, 0)?.as_serial()?);
    let code = arg(&args, 1)?.as_str()?;
    master.register_server(bus, code);
    Ok(vec![])
}

async fn request_connection(master: Arc<BusMaster>, args: Vec<Value>) -> Result<Vec<Value>> {
    let transport = TransportRequestHandle::from_value(arg(&args, 0)?)?;
    let me = BusId(arg(&args, 1)?.as_serial()?);
    let remote = BusId(arg(&args, 2)?.as_serial()?);
    master.request_connection(transport, me, remote).await?;
    Ok(vec![])
}

/// Binds one master operation to `master`.
macro_rules! on_master {
    ($master:expr, $op:ident) => {{
        let master = $master.clone();
        handler(move |_, args| $op(master.clone(), args))
    }};
}

/// Names served by the connection hosting `master`.
pub fn master_map(master: Arc<BusMaster>) -> Result<TransverseMap> {
    let service = ServiceImplementation::new(bus_master_interface())
        .implement("offer", on_master!(master, offer))
        .implement("discover", on_master!(master, discover))
        .implement("connect", on_master!(master, connect))
        .implement("neonateId", on_master!(master, neonate_id))
        .implement("registerServer", on_master!(master, register_server))
        .implement("requestConnection", on_master!(master, request_connection))
        .build()?;
    Ok(service.transverse_map().clone())
}
