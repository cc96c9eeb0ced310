//! Network Module Implementation
//!
//! Everything between the accepted socket and a request buffer ready for
//! dispatch.
//!
//! # Components
//!
//! - `Connection`: per-client state, status machine, credits, request lists
//!   and the serialization lock
//! - `Transport`: the pluggable byte-stream carrier, TCP being the only one
//! - `VectoredReader`: exact-length scatter-gather reads with the transient
//!   error handling
//! - `SessionHeader`: the 4 byte length prefix of every message
//! - `ConnectionRegistry`: the table of live connections

pub use connection::{
    Connection, ConnectionStats, PendingRequest, RequestGuard, SecurityContext,
};
pub use credits::Credits;
pub use frame::{SessionHeader, SessionMessageType, SESSION_HEADER_SIZE};
pub use registry::ConnectionRegistry;
pub use status::ConnectionStatus;
pub use transport::{TcpTransport, Transport};
pub use vectored::{RecvVectored, TcpReceiver, VectoredReader};

mod connection;
mod credits;
mod frame;
mod registry;
mod status;
mod transport;
mod vectored;

#[cfg(test)]
pub(crate) mod testing;
