//! # Error Taxonomy
//!
//! Two kinds of failure live on a bus, and they must never be confused.
//!
//! - **Transverse faults** (`Fault`) are representable on the wire. Each one is
//!   sent as the TransverseID of its constructor followed by the constructor's
//!   arguments, and the receiver rebuilds it from its own table of constructors.
//!   No remote-supplied code or reference is ever executed to materialize one.
//! - **Local errors** (`Error`) stay in this process. Anything that is not a
//!   `Fault` is replaced by `Fault::UnknownError` before it crosses the wire.
//!
//! Timeouts are synthesized locally and only ever surface as `Error::Timeout`.

use std::fmt;

use transpack::BusId;
use transpack::Decoder;
use transpack::Encoder;
use transpack::MessageId;
use transpack::ObjectId;
use transpack::TransverseId;

use crate::route::RouteError;
use crate::service::ServiceError;
use crate::transport::TransportError;

const UNKNOWN_ERROR: &str = "Errors::UnknownError";
const SERIALIZED_ERROR: &str = "Errors::SerializedError";
const UNKNOWN_MESSAGE_ID: &str = "Errors::UnknownMessageIDError";
const UNKNOWN_TRANSVERSE_ID: &str = "Errors::UnknownTransverseIDError";
const UNKNOWN_OBJECT_ID: &str = "Errors::UnknownObjectIDError";
const TYPE_MISMATCH: &str = "Errors::TypeMismatchError";
const DECODING_ERROR: &str = "Errors::DecodingError";
const ENCODING_ERROR: &str = "Errors::EncodingError";
const TRANSMISSION_ERROR: &str = "Errors::TransmissionError";
const ERROR_UNSUPPORTED: &str = "Errors::ErrorUnsupported";
const APPLICATION_ERROR: &str = "Errors::ApplicationError";

/// A wire-representable failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A local failure whose details were withheld from the peer.
    UnknownError,
    /// A local failure dumped as text. Only produced in debug configuration.
    SerializedError(String),
    /// No pending call matches this id on the route it arrived on.
    UnknownMessageId(MessageId),
    /// No transverse map on the connection offers this name.
    UnknownTransverseId(TransverseId),
    /// The connection never shared an object with this id.
    UnknownObjectId(ObjectId),
    /// The referenced object does not have the capability the message needs.
    TypeMismatch(String),
    Decoding(String),
    Encoding(String),
    Transmission(String),
    /// The peer raised a fault whose constructor this side does not know.
    ErrorUnsupported(TransverseId),
    /// Raised on purpose by an exposed call.
    Application(String),
}

impl Fault {
    /// TransverseID of the constructor that rebuilds this fault.
    pub fn transverse_id(&self) -> TransverseId {
        let name = match self {
            Fault::UnknownError => UNKNOWN_ERROR,
            Fault::SerializedError(_) => SERIALIZED_ERROR,
            Fault::UnknownMessageId(_) => UNKNOWN_MESSAGE_ID,
            Fault::UnknownTransverseId(_) => UNKNOWN_TRANSVERSE_ID,
            Fault::UnknownObjectId(_) => UNKNOWN_OBJECT_ID,
            Fault::TypeMismatch(_) => TYPE_MISMATCH,
            Fault::Decoding(_) => DECODING_ERROR,
            Fault::Encoding(_) => ENCODING_ERROR,
            Fault::Transmission(_) => TRANSMISSION_ERROR,
            Fault::ErrorUnsupported(_) => ERROR_UNSUPPORTED,
            Fault::Application(_) => APPLICATION_ERROR,
        };
        TransverseId::from_name(name)
    }

    /// Writes the constructor id followed by the constructor arguments.
    pub fn encode(&self, enc: &mut Encoder) -> transpack::Result<()> {
        enc.transverse(&self.transverse_id());
        match self {
            Fault::UnknownError => {}
            Fault::SerializedError(s)
            | Fault::TypeMismatch(s)
            | Fault::Decoding(s)
            | Fault::Encoding(s)
            | Fault::Transmission(s)
            | Fault::Application(s) => enc.string(s)?,
            Fault::UnknownMessageId(id) => enc.id(*id),
            Fault::UnknownObjectId(id) => enc.id(*id),
            Fault::UnknownTransverseId(tid) | Fault::ErrorUnsupported(tid) => enc.transverse(tid),
        }
        Ok(())
    }

    /// Rebuilds a fault from its constructor id and arguments.
    ///
    /// Unknown constructors become `ErrorUnsupported`; their arguments are left unread.
    pub fn decode(dec: &mut Decoder<'_>) -> transpack::Result<Fault> {
        let tid = dec.transverse()?;
        let Ok(name) = std::str::from_utf8(tid.as_bytes()) else {
            return Ok(Fault::ErrorUnsupported(tid));
        };
        let fault = match name {
            UNKNOWN_ERROR => Fault::UnknownError,
            SERIALIZED_ERROR => Fault::SerializedError(dec.string()?.to_string()),
            UNKNOWN_MESSAGE_ID => Fault::UnknownMessageId(dec.id()?),
            UNKNOWN_TRANSVERSE_ID => Fault::UnknownTransverseId(dec.transverse()?),
            UNKNOWN_OBJECT_ID => Fault::UnknownObjectId(dec.id()?),
            TYPE_MISMATCH => Fault::TypeMismatch(dec.string()?.to_string()),
            DECODING_ERROR => Fault::Decoding(dec.string()?.to_string()),
            ENCODING_ERROR => Fault::Encoding(dec.string()?.to_string()),
            TRANSMISSION_ERROR => Fault::Transmission(dec.string()?.to_string()),
            ERROR_UNSUPPORTED => Fault::ErrorUnsupported(dec.transverse()?),
            APPLICATION_ERROR => Fault::Application(dec.string()?.to_string()),
            _ => Fault::ErrorUnsupported(tid),
        };
        Ok(fault)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownError => write!(f, "Unknown error"),
            Self::SerializedError(s) => write!(f, "Serialized error: {}", s),
            Self::UnknownMessageId(id) => write!(f, "Unknown message id: {}", id),
            Self::UnknownTransverseId(tid) => write!(f, "Unknown transverse id: {}", tid),
            Self::UnknownObjectId(id) => write!(f, "Unknown object id: {}", id),
            Self::TypeMismatch(s) => write!(f, "Type mismatch: {}", s),
            Self::Decoding(s) => write!(f, "Decoding error: {}", s),
            Self::Encoding(s) => write!(f, "Encoding error: {}", s),
            Self::Transmission(s) => write!(f, "Transmission error: {}", s),
            Self::ErrorUnsupported(tid) => write!(f, "Unsupported remote error: {}", tid),
            Self::Application(s) => write!(f, "Application error: {}", s),
        }
    }
}

impl std::error::Error for Fault {}

/// Everything that can go wrong on this side of the bus.
#[derive(Debug, Clone)]
pub enum Error {
    /// A transverse fault raised locally.
    Fault(Fault),
    /// A transverse fault received from a peer.
    Remote(Fault),
    /// No reply arrived within the sliding window.
    Timeout,
    /// The bus was shut down while the operation was pending.
    Shutdown,
    Transport(TransportError),
    Route(RouteError),
    Service(ServiceError),
    /// A failure could not itself be reported; the route was closed.
    RemoteEndFailure(String),
    /// Neither bus can accept a transport from the other.
    NoServer { local: BusId, remote: BusId },
    /// A local-only failure that must never reach the wire.
    Local(String),
}

impl Error {
    /// The fault to put on the wire for this error.
    ///
    /// Transverse faults pass through as-is. Everything else is withheld as
    /// `UnknownError`, or dumped as `SerializedError` when `debug` is set.
    pub fn to_fault(&self, debug: bool) -> Fault {
        match self {
            Self::Fault(f) | Self::Remote(f) => f.clone(),
            other if debug => Fault::SerializedError(other.to_string()),
            _ => Fault::UnknownError,
        }
    }

    /// True when this error carries a transverse fault.
    pub fn is_transverse(&self) -> bool {
        matches!(self, Self::Fault(_) | Self::Remote(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "{}", fault),
            Self::Remote(fault) => write!(f, "Remote failure: {}", fault),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Shutdown => write!(f, "Bus shut down"),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Route(e) => write!(f, "Route error: {}", e),
            Self::Service(e) => write!(f, "Service error: {}", e),
            Self::RemoteEndFailure(msg) => write!(f, "Remote end failure: {}", msg),
            Self::NoServer { local, remote } => {
                write!(f, "Neither {} nor {} accepts transports", local, remote)
            }
            Self::Local(msg) => write!(f, "Local error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fault(f) | Self::Remote(f) => Some(f),
            Self::Transport(e) => Some(e),
            Self::Route(e) => Some(e),
            Self::Service(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Fault> for Error {
    fn from(f: Fault) -> Self {
        Self::Fault(f)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<RouteError> for Error {
    fn from(e: RouteError) -> Self {
        Self::Route(e)
    }
}

impl From<ServiceError> for Error {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

/// Malformed bytes read off the wire.
impl From<transpack::Error> for Error {
    fn from(e: transpack::Error) -> Self {
        Self::Fault(Fault::Decoding(e.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
