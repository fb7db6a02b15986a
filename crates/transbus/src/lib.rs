pub mod bus;
pub mod channel;
pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod exposed;
pub mod filter;
pub mod loopback;
pub mod master;
pub mod proxy;
pub mod route;
pub mod service;
pub mod transport;
pub mod value;

pub use bus::Bus;
pub use bus::BusConfig;
pub use connection::Connection;
pub use error::Error;
pub use error::Fault;
pub use error::Result;
pub use master::BusMaster;
pub use proxy::ObjectProxy;
pub use proxy::ServiceProxy;
pub use service::Interface;
pub use service::ServiceImplementation;
pub use value::Type;
pub use value::Value;

#[cfg(test)]
mod tests;
