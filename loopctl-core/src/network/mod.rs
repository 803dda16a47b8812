//! TCP plumbing: the server-side [`Transport`] and the client-side
//! [`Connection`].

pub mod connection;
pub mod transport;

pub use connection::{Connection, ConnectionInfo};
pub use transport::{CloseReason, Inbound, Link, Outbound, Transport, TransportOptions};
