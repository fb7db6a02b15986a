//! # Remote Call Proxies
//!
//! Client-side stand-ins for objects and services living on another connection.
//!
//! A call goes: resolve the member's TransverseID to a Reference (cached per
//! peer connection), send `EVAL` or `NOTIFY` on the proxy's route, and for
//! `EVAL` wait until the reply, a `MESSAGE_ERROR`, or the window times it out.
//!
//! ## Invariants
//!
//! - Arguments and results are checked against the member's declared types.
//! - A method's receiver travels as its first argument.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use transpack::Decoder;
use transpack::Header;
use transpack::Reference;
use transpack::TransverseId;

use crate::client::OpenRouteHandle;
use crate::codec;
use crate::connection::Connection;
use crate::error::Error;
use crate::error::Result;
use crate::exposed::CallKind;
use crate::route::Layer;
use crate::route::OpenRoute;
use crate::route::Route;
use crate::service::Interface;
use crate::service::Member;
use crate::value::ObjectHandle;
use crate::value::Shared;
use crate::value::Value;

/// A by-reference object owned by another connection.
#[derive(Clone)]
pub struct ObjectProxy {
    route: Route,
    reference: Reference,
}

impl ObjectProxy {
    pub fn new(route: Route, reference: Reference) -> Self {
        Self { route, reference }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn reference(&self) -> Reference {
        self.reference
    }

    /// Binds one of the object's methods.
    pub fn bind(&self, member: &Member) -> BoundCall {
        let receiver = member
            .is_method()
            .then(|| Value::Object(ObjectHandle::Remote(self.clone())));
        BoundCall::new(self.route.clone(), member.clone(), receiver)
    }
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("route", &self.route.token())
            .field("reference", &self.reference)
            .finish()
    }
}

/// A member ready to be invoked across a route.
#[derive(Clone)]
pub struct BoundCall {
    route: Route,
    member: Member,
    receiver: Option<Value>,
    layers: Vec<Layer>,
}

impl BoundCall {
    pub fn new(route: Route, member: Member, receiver: Option<Value>) -> Self {
        Self {
            route,
            member,
            receiver,
            layers: Vec::new(),
        }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    /// Transcodes the call through `local` and has the peer undo it with its filter `remote`.
    pub fn filter_in(mut self, remote: Reference, local: Shared) -> Self {
        self.layers.push(Layer::FilterIn { tag: remote, filter: local });
        self
    }

    /// Has the peer transcode its reply through its filter `remote`, tagged so
    /// that our filter `local` undoes it on arrival.
    pub fn filter_out(mut self, remote: Reference, local: Reference) -> Self {
        self.layers.push(Layer::FilterOut { remote, local });
        self
    }

    fn arguments(&self, args: Vec<Value>) -> Vec<Value> {
        match &self.receiver {
            Some(receiver) => std::iter::once(receiver.clone()).chain(args).collect(),
            None => args,
        }
    }

    async fn target(&self) -> Result<(Connection, TransverseId, Reference)> {
        let connection = self.route.connection()?;
        let tid = self.member.transverse_id().clone();
        let call = connection.resolve_transverse(&self.route, &tid).await?;
        Ok((connection, tid, call))
    }

    /// Evaluates the call and waits for its results.
    pub async fn eval(&self, args: Vec<Value>) -> Result<Vec<Value>> {
        if self.member.kind() != CallKind::Eval {
            return Err(Error::Local(format!("{} is a notification", self.member.transverse_id())));
        }
        let args = self.arguments(args);
        let (connection, tid, call) = self.target().await?;
        let bus = connection.bus()?;
        trace!(%tid, %call, "eval");

        let params = self.member.params();
        let body = bus
            .roundtrip(&self.route, self.layers.clone(), |enc, id| {
                enc.header(Header::Eval);
                enc.id(id);
                enc.reference(&call);
                codec::encode_values(enc, params, &args, &connection)
            })
            .await?;

        let mut dec = Decoder::new(&body);
        codec::decode_values(&mut dec, self.member.results(), &connection, &self.route)
    }

    /// Sends the call without waiting for anything back.
    pub async fn notify(&self, args: Vec<Value>) -> Result<()> {
        let args = self.arguments(args);
        let (connection, tid, call) = self.target().await?;
        trace!(%tid, %call, "notify");

        let mut out = self.route.open_buffer();
        for layer in &self.layers {
            out.wrap(layer.clone());
        }
        let enc = out.encoder();
        enc.header(Header::Notify);
        enc.reference(&call);
        codec::encode_values(enc, self.member.params(), &args, &connection)?;
        out.commit().await
    }
}

/// A completed route to a connection offering a service.
#[derive(Clone)]
pub struct ServiceProxy {
    route: Route,
    interface: Arc<Interface>,
}

impl ServiceProxy {
    pub fn new(route: Route, interface: Arc<Interface>) -> Self {
        Self { route, interface }
    }

    /// Discovers `interface` through the bus master and connects to it from
    /// `connection`.
    pub async fn on(connection: &Connection, interface: Arc<Interface>) -> Result<Self> {
        let master = connection.bus()?.master()?;
        let prospective = master.discover(interface.name()).await?;
        let open = OpenRoute::new(connection.clone());
        master.connect(OpenRouteHandle::Local(open.clone()), prospective).await?;
        Ok(Self::new(open.route()?, interface))
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn interface(&self) -> &Arc<Interface> {
        &self.interface
    }

    pub fn bind(&self, member: &str) -> Result<BoundCall> {
        let member = self.interface.member(member)?;
        Ok(BoundCall::new(self.route.clone(), member.clone(), None))
    }

    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        self.bind(member)?.eval(args).await
    }

    pub async fn notify(&self, member: &str, args: Vec<Value>) -> Result<()> {
        self.bind(member)?.notify(args).await
    }

    /// Wraps an object reference handed out by this service.
    pub fn object(&self, value: &Value) -> Result<ObjectProxy> {
        match value.as_object()? {
            ObjectHandle::Remote(proxy) => Ok(proxy.clone()),
            ObjectHandle::Local(_) => Err(Error::Local("expected a remote object".into())),
        }
    }
}
