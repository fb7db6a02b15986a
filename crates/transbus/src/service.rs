//! # Interfaces and Services
//!
//! An `Interface` is an ordered list of members, each with a positional
//! signature and a TransverseID of the form `<Interface>::<member>`.
//! A `ServiceImplementation` binds a handler to every member and builds the
//! transverse map that gets offered on a connection.
//!
//! ## Invariants
//!
//! - A service is only built once every member has a handler.
//! - A method member takes its receiver as the first parameter, typed as an
//!   object of the interface.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use transpack::TransverseId;

use crate::connection::Connection;
use crate::error::Result;
use crate::exposed::CallKind;
use crate::exposed::ExposedCall;
use crate::exposed::Handler;
use crate::exposed::TransverseMap;
use crate::route::OpenRoute;
use crate::value::Exposed;
use crate::value::Shared;
use crate::value::Type;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// A member was left without a handler.
    NotImplemented(String),
    /// A handler was given for a name the interface does not declare.
    UnknownMember(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotImplemented(name) => write!(f, "Member {} is not implemented", name),
            Self::UnknownMember(name) => write!(f, "No member named {}", name),
        }
    }
}

impl std::error::Error for ServiceError {}

#[derive(Debug, Clone)]
pub struct Member {
    name: String,
    tid: TransverseId,
    params: Vec<Type>,
    results: Vec<Type>,
    kind: CallKind,
    method: bool,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transverse_id(&self) -> &TransverseId {
        &self.tid
    }

    /// Parameters, receiver included for methods.
    pub fn params(&self) -> &[Type] {
        &self.params
    }

    pub fn results(&self) -> &[Type] {
        &self.results
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn is_method(&self) -> bool {
        self.method
    }
}

/// Describes the members of a service or object type.
#[derive(Debug, Clone)]
pub struct Interface {
    name: String,
    members: Vec<Member>,
}

impl Interface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Vec::new(),
        }
    }

    fn push(mut self, name: &str, params: Vec<Type>, results: Vec<Type>, kind: CallKind, method: bool) -> Self {
        let tid = TransverseId::from_name(&format!("{}::{}", self.name, name));
        self.members.push(Member {
            name: name.to_string(),
            tid,
            params,
            results,
            kind,
            method,
        });
        self
    }

    /// A free function of the service.
    pub fn function(self, name: &str, params: Vec<Type>, results: Vec<Type>) -> Self {
        self.push(name, params, results, CallKind::Eval, false)
    }

    /// A method called on an object implementing this interface.
    pub fn method(self, name: &str, params: Vec<Type>, results: Vec<Type>) -> Self {
        let receiver = Type::object(&self.name);
        let params = std::iter::once(receiver).chain(params).collect();
        self.push(name, params, results, CallKind::Eval, true)
    }

    /// A one-way call with no reply.
    pub fn notification(self, name: &str, params: Vec<Type>) -> Self {
        self.push(name, params, Vec::new(), CallKind::Notify, false)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, name: &str) -> std::result::Result<&Member, ServiceError> {
        self.members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ServiceError::UnknownMember(format!("{}::{}", self.name, name)))
    }

    pub fn transverse_id(&self, member: &str) -> std::result::Result<TransverseId, ServiceError> {
        self.member(member).map(|m| m.tid.clone())
    }
}

/// Handlers for every member of an interface.
pub struct ServiceImplementation {
    interface: Arc<Interface>,
    handlers: HashMap<String, Handler>,
}

impl ServiceImplementation {
    pub fn new(interface: Arc<Interface>) -> Self {
        Self {
            interface,
            handlers: HashMap::new(),
        }
    }

    pub fn implement(mut self, member: &str, handler: Handler) -> Self {
        self.handlers.insert(member.to_string(), handler);
        self
    }

    /// Checks the handlers against the interface and builds its transverse map.
    pub fn build(mut self) -> std::result::Result<Service, ServiceError> {
        if let Some(extra) = self.handlers.keys().find(|name| self.interface.member(name).is_err()) {
            return Err(ServiceError::UnknownMember(extra.clone()));
        }
        let mut map = TransverseMap::new();
        for member in self.interface.members() {
            let handler = self
                .handlers
                .remove(member.name())
                .ok_or_else(|| ServiceError::NotImplemented(member.tid.to_string()))?;
            let call = ExposedCall::new(
                member.tid.clone(),
                member.params.clone(),
                member.results.clone(),
                member.kind,
                handler,
            );
            map.insert(member.tid.clone(), Arc::new(call));
        }
        Ok(Service {
            interface: self.interface,
            map,
        })
    }
}

/// A built service, ready to be offered.
#[derive(Clone)]
pub struct Service {
    interface: Arc<Interface>,
    map: TransverseMap,
}

impl Service {
    pub fn interface(&self) -> &Arc<Interface> {
        &self.interface
    }

    pub fn transverse_map(&self) -> &TransverseMap {
        &self.map
    }

    /// Offers the service through the bus master under the interface name.
    ///
    /// With `use_same`, every client is routed to `connection` itself.
    /// Otherwise each client gets a fresh connection serving the same names.
    pub async fn offer_on(&self, connection: &Connection, use_same: bool) -> Result<()> {
        connection.add_transverse_map(self.map.clone());
        let offering: Shared = Arc::new(ServiceOffering::new(connection.clone(), use_same));
        let master = connection.bus()?.master()?;
        master.offer(self.interface.name(), offering).await?;
        debug!(connection = %connection.id(), service = self.interface.name(), "offered service");
        Ok(())
    }
}

/// Hands out prospective routes to an offered service.
pub struct ServiceOffering {
    connection: Connection,
    use_same: bool,
}

impl ServiceOffering {
    pub fn new(connection: Connection, use_same: bool) -> Self {
        Self { connection, use_same }
    }

    /// An open route ending at the serving connection, or at a fresh
    /// connection carrying the same transverse maps.
    pub async fn request(&self) -> Result<Arc<OpenRoute>> {
        if self.use_same {
            return Ok(OpenRoute::new(self.connection.clone()));
        }
        let bus = self.connection.bus()?;
        let fresh = bus.new_connection().await?;
        for map in self.connection.transverse_maps() {
            fresh.add_transverse_map(map);
        }
        Ok(OpenRoute::new(fresh))
    }
}

impl Exposed for ServiceOffering {
    fn interface(&self) -> Option<&str> {
        Some(crate::client::SERVICE_OFFERING_NAME)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
