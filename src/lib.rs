#![doc(html_root_url = "https://docs.rs/hawser/latest")]
//! Connection-level socket engine for HTTP/1.x services.
//!
//! `hawser` owns the sockets: dedicated event-loop threads, pooled intake
//! and output buffers, pipelined request framing, and cooperative
//! backpressure. Applications plug in as a [`Service`] returning complete
//! responses; everything byte-shaped stays in the engine.

pub mod config;
pub mod connection;
pub mod event_loop;
mod exchange;
pub mod http;
pub mod input;
pub mod metrics;
pub mod output;
pub mod pool;
pub mod registry;
pub mod server;
pub mod service;

pub use config::{ConfigError, EngineConfig};
pub use connection::{
    active_connection_count,
    control::{EndAction, FlowControl},
};
pub use event_loop::{EventLoop, LoopHandle, PostError};
pub use http::{
    BodyFraming,
    Method,
    ProtocolError,
    Request,
    RequestHead,
    Response,
    Version,
};
pub use input::{InputBuffer, InputError};
pub use metrics::{
    CONNECTIONS_ACTIVE,
    Direction,
    ERRORS_TOTAL,
    EXCHANGES_COMPLETED,
    SOCKET_BYTES,
};
pub use pool::{BufferPool, Lease, PoolConfig, PoolStats};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::{BoundServer, Server, ServerHandle};
pub use service::{Service, ServiceFn, ServiceResponse, service_fn};
