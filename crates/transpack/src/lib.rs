//! # Transpack
//!
//! The wire primitives spoken between busses.
//!
//! ## Philosophy
//!
//! - **Closed Set**: Only the handful of primitives the protocol needs. This is not
//!   a general serialization framework; anything richer is built from these.
//! - **Untagged**: Values carry no type tags. Both ends agree on the shape of a
//!   message from its header byte and the declared signature of the call.
//! - **Zero-Copy Reads**: Decoders are bounds-checked views over a borrowed slice.
//!
//! ## Format
//!
//! - **SerialID**: unsigned LEB128. 7 value bits per byte, least significant group
//!   first, high bit set means another byte follows.
//! - **TransverseID / UnicodeString**: raw bytes terminated by `0x00`.
//! - **Int32**: 4 bytes, big-endian.
//! - **Bytes**: `[Len: SerialID][Data: Len]`.
//! - **Reference**: `[ConnectionID: SerialID][ObjectID: SerialID]`.

use std::fmt;


/// Transpack encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Byte does not correspond to a valid message `Header`.
    InvalidHeader(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// SerialID does not fit in 64 bits.
    SerialOverflow,
    /// A null-terminated field ran off the end of the buffer.
    MissingTerminator,
    /// A null-terminated field contains a `0x00` byte.
    InteriorNul,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidHeader(b) => write!(f, "Invalid header byte: {:#04x}", b),
            Error::SerialOverflow => write!(f, "SerialID overflows 64 bits"),
            Error::MissingTerminator => write!(f, "Null-terminated field has no terminator"),
            Error::InteriorNul => write!(f, "Null-terminated field contains a nul byte"),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for Transpack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The first byte of every message, selecting its kind.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Header {
    /// `[MessageID][TransverseID]`
    Resolve = 0x01,
    /// `[Reference][args..]`
    Notify = 0x02,
    /// `[MessageID][Reference][args..]`
    Eval = 0x03,
    /// `[MessageID][payload..]`
    Reply = 0x04,
    /// `[MessageID][TransverseID][ctor args..]`
    MessageError = 0x05,
    /// `[TransverseID][ctor args..]`
    GeneralError = 0x06,
    /// `[Reference][transcoded message..]`
    FilterIn = 0x07,
    /// `[Reference][Reference][message..]`
    FilterOut = 0x08,
}

impl Header {
    /// Returns the Header variant for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Header::Resolve),
            0x02 => Some(Header::Notify),
            0x03 => Some(Header::Eval),
            0x04 => Some(Header::Reply),
            0x05 => Some(Header::MessageError),
            0x06 => Some(Header::GeneralError),
            0x07 => Some(Header::FilterIn),
            0x08 => Some(Header::FilterOut),
            _ => None,
        }
    }
}

/// An identifier carried on the wire as a SerialID.
///
/// All ids share one wire shape; the newtypes only keep them from being mixed up.
pub trait Serial: Copy {
    fn from_serial(v: u64) -> Self;
    fn to_serial(self) -> u64;
}

macro_rules! serial_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl Serial for $name {
            fn from_serial(v: u64) -> Self { Self(v) }
            fn to_serial(self) -> u64 { self.0 }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

serial_id!(
    /// Names a Connection. Minted globally by the bus master.
    ConnectionId, "conn"
);
serial_id!(
    /// Names a shared object within one Connection.
    ObjectId, "obj"
);
serial_id!(
    /// Names a Bus. A bus takes the id of its first connection.
    BusId, "bus"
);
serial_id!(
    /// Transport-local address of a Route.
    RouteToken, "route"
);
serial_id!(
    /// Correlates a request with its reply.
    MessageId, "msg"
);

/// A `(ConnectionID, ObjectID)` pair naming a shareable object across the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
    pub connection: ConnectionId,
    pub object: ObjectId,
}

impl Reference {
    pub fn new(connection: ConnectionId, object: ObjectId) -> Self {
        Self { connection, object }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.object)
    }
}

/// A stable, connection-independent name for a call or interface member,
/// e.g. `"Echo::echo"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransverseId(Vec<u8>);

impl TransverseId {
    /// Builds an id from raw bytes.
    ///
    /// # Errors
    /// `Error::InteriorNul` if the bytes contain the terminator.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.contains(&0) {
            return Err(Error::InteriorNul);
        }
        Ok(Self(bytes))
    }

    /// Builds an id from a name. Anything from the first nul byte on is dropped.
    pub fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Self(bytes[..end].to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TransverseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// An append-only message builder.
///
/// Encoding is infallible except for null-terminated strings, which must not
/// contain the terminator.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Consumes the encoder and returns the bytes written so far.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes a message header byte.
    pub fn header(&mut self, h: Header) {
        self.buf.push(h as u8);
    }

    /// Writes `v` as a SerialID.
    pub fn serial(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Writes any id newtype as a SerialID.
    pub fn id<T: Serial>(&mut self, id: T) {
        self.serial(id.to_serial());
    }

    pub fn reference(&mut self, r: &Reference) {
        self.id(r.connection);
        self.id(r.object);
    }

    pub fn transverse(&mut self, t: &TransverseId) {
        self.buf.extend_from_slice(&t.0);
        self.buf.push(0);
    }

    /// Writes a big-endian Int32.
    pub fn int32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a null-terminated UnicodeString.
    pub fn string(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(Error::InteriorNul);
        }
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// Writes a length-prefixed byte blob.
    pub fn bytes(&mut self, v: &[u8]) {
        self.serial(v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    /// Appends bytes verbatim, e.g. an already-encoded nested message.
    pub fn raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// # Errors
/// All read operations return `Error::UnexpectedEnd` if the buffer is exhausted.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Returns the unread bytes without advancing.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn read_u8(&mut self) -> Result<u8> {
        let (&b, tail) = self.buf.split_first().ok_or(Error::UnexpectedEnd)?;
        self.buf = tail;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() { return Err(Error::UnexpectedEnd); }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_terminated(&mut self) -> Result<&'a [u8]> {
        let end = self.buf.iter().position(|b| *b == 0).ok_or(Error::MissingTerminator)?;
        let body = &self.buf[..end];
        self.buf = &self.buf[end + 1..];
        Ok(body)
    }

    /// Decodes the header byte.
    pub fn header(&mut self) -> Result<Header> {
        let b = self.read_u8()?;
        Header::from_u8(b).ok_or(Error::InvalidHeader(b))
    }

    /// Decodes a SerialID.
    pub fn serial(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let bits = (byte & 0x7f) as u64;
            if shift >= 64 || (shift == 63 && bits > 1) {
                return Err(Error::SerialOverflow);
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Decodes a SerialID into any id newtype.
    pub fn id<T: Serial>(&mut self) -> Result<T> {
        Ok(T::from_serial(self.serial()?))
    }

    pub fn reference(&mut self) -> Result<Reference> {
        let connection = self.id()?;
        let object = self.id()?;
        Ok(Reference { connection, object })
    }

    pub fn transverse(&mut self) -> Result<TransverseId> {
        Ok(TransverseId(self.read_terminated()?.to_vec()))
    }

    /// Decodes a big-endian Int32.
    pub fn int32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decodes a null-terminated UnicodeString.
    pub fn string(&mut self) -> Result<&'a str> {
        let bytes = self.read_terminated()?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a length-prefixed byte blob.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.serial()?;
        let len = usize::try_from(len).map_err(|_| Error::UnexpectedEnd)?;
        self.read_bytes(len)
    }

    /// Reads exactly `n` raw bytes.
    pub fn raw(&mut self, n: usize) -> Result<&'a [u8]> {
        self.read_bytes(n)
    }
}
