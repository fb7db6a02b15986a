//! # Value Model
//!
//! The closed set of values an exposed call can accept or return.
//!
//! By-value types (`Int32`, `String`, `Tuple`, ...) never touch a Connection.
//! By-reference values are objects: either shared from this process
//! (`ObjectHandle::Local`) or living elsewhere (`ObjectHandle::Remote`).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use transpack::TransverseId;

use crate::error::Fault;
use crate::exposed::ExposedCall;
use crate::filter::FilterElement;
use crate::proxy::ObjectProxy;

/// What a referenced object must be able to do.
///
/// Checked whenever a Reference is dereferenced locally, so a peer cannot pass
/// a reference to the wrong kind of object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// An exposed call that can be evaluated or notified.
    Call,
    /// A filter element.
    Filter,
    /// An object implementing the named interface.
    Object(String),
    /// Any shared object.
    Any,
}

impl Capability {
    pub fn object(interface: &str) -> Self {
        Self::Object(interface.to_string())
    }

    pub fn satisfied_by(&self, object: &dyn Exposed) -> bool {
        match self {
            Self::Call => object.as_call().is_some(),
            Self::Filter => object.as_filter().is_some(),
            Self::Object(name) => object.interface() == Some(name.as_str()),
            Self::Any => true,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Filter => write!(f, "filter"),
            Self::Object(name) => write!(f, "{}", name),
            Self::Any => write!(f, "object"),
        }
    }
}

/// Declared shape of a parameter or result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Zero bytes on the wire.
    Null,
    Int32,
    String,
    Bytes,
    Serial,
    Transverse,
    Object(Capability),
    Tuple(Vec<Type>),
}

impl Type {
    pub fn object(interface: &str) -> Self {
        Self::Object(Capability::object(interface))
    }
}

/// Anything that can be shared across the bus by reference.
pub trait Exposed: Any + Send + Sync {
    /// Name of the interface this object implements, if any.
    fn interface(&self) -> Option<&str> {
        None
    }

    fn as_call(&self) -> Option<&ExposedCall> {
        None
    }

    fn as_filter(&self) -> Option<&dyn FilterElement> {
        None
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A locally shared object.
pub type Shared = Arc<dyn Exposed>;

/// Recovers the concrete type behind a shared object.
pub fn downcast<T: Exposed>(shared: &Shared) -> Option<Arc<T>> {
    shared.clone().into_any().downcast::<T>().ok()
}

/// Identity of a shared object, stable for as long as it is alive.
pub(crate) fn identity(shared: &Shared) -> usize {
    Arc::as_ptr(shared) as *const () as usize
}

/// An object value: either ours or a proxy for someone else's.
#[derive(Clone)]
pub enum ObjectHandle {
    Local(Shared),
    Remote(ObjectProxy),
}

impl ObjectHandle {
    pub fn local(&self) -> Option<&Shared> {
        match self {
            Self::Local(shared) => Some(shared),
            Self::Remote(_) => None,
        }
    }

    pub fn remote(&self) -> Option<&ObjectProxy> {
        match self {
            Self::Local(_) => None,
            Self::Remote(proxy) => Some(proxy),
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(shared) => write!(f, "Local({:#x})", identity(shared)),
            Self::Remote(proxy) => write!(f, "Remote({})", proxy.reference()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int32(i32),
    String(String),
    Bytes(Vec<u8>),
    Serial(u64),
    Transverse(TransverseId),
    Object(ObjectHandle),
    Tuple(Vec<Value>),
}

fn mismatch(expected: &str, found: &Value) -> Fault {
    Fault::TypeMismatch(format!("expected {}, found {}", expected, found.kind()))
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn local(shared: Shared) -> Self {
        Self::Object(ObjectHandle::Local(shared))
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int32(_) => "int32",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Serial(_) => "serial",
            Self::Transverse(_) => "transverse",
            Self::Object(_) => "object",
            Self::Tuple(_) => "tuple",
        }
    }

    pub fn as_int32(&self) -> Result<i32, Fault> {
        match self {
            Self::Int32(v) => Ok(*v),
            other => Err(mismatch("int32", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, Fault> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(mismatch("string", other)),
        }
    }

    pub fn as_serial(&self) -> Result<u64, Fault> {
        match self {
            Self::Serial(v) => Ok(*v),
            other => Err(mismatch("serial", other)),
        }
    }

    pub fn as_object(&self) -> Result<&ObjectHandle, Fault> {
        match self {
            Self::Object(h) => Ok(h),
            other => Err(mismatch("object", other)),
        }
    }

    /// Downcasts a local object argument, e.g. the receiver of a method.
    pub fn as_local<T: Exposed>(&self) -> Result<Arc<T>, Fault> {
        let shared = self
            .as_object()?
            .local()
            .ok_or_else(|| Fault::TypeMismatch("expected a local object".into()))?;
        downcast::<T>(shared)
            .ok_or_else(|| Fault::TypeMismatch(format!("expected {}", std::any::type_name::<T>())))
    }

    /// Whether this value has the declared shape. Objects are only checked for
    /// being objects; capabilities are enforced where references are dereferenced.
    pub fn conforms_to(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Self::Null, Type::Null)
            | (Self::Int32(_), Type::Int32)
            | (Self::String(_), Type::String)
            | (Self::Bytes(_), Type::Bytes)
            | (Self::Serial(_), Type::Serial)
            | (Self::Transverse(_), Type::Transverse)
            | (Self::Object(_), Type::Object(_)) => true,
            (Self::Tuple(vs), Type::Tuple(ts)) => {
                vs.len() == ts.len() && vs.iter().zip(ts).all(|(v, t)| v.conforms_to(t))
            }
            _ => false,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}
