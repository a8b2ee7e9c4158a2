pub mod client;
pub mod connection;
pub mod connection_pool;
pub mod metrics;
pub mod protocol;

// Re-export the client surface
pub use client::{Client, ClientError, Item};
pub use connection::{
    Connection, ConnectionError, ConnectionSettings, ConnectionState, ServerAddress,
};
pub use connection_pool::{ConnectionManager, ConnectionPool, PoolError, PooledConnection};
pub use metrics::{AtomicServerMetrics, MetricsSnapshot, ServerMetrics};
pub use protocol::{Opcode, ProtocolError, Request, Response, Status};
