//! Connection and transport layer
//!
//! - [`Transport`]: how byte streams are opened (TCP, caller-supplied SRT)
//! - [`Connection`]: protocol setup, writer/reader tasks, session fan-out

pub mod connection;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{
    Connection, ConnectionEvent, ConnectionObserver, ConnectionStats, Inbound, StreamParams,
    WeakConnection,
};
pub use transport::{AsyncReadWrite, BoxedStream, TcpTransport, Transport};
