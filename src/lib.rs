//! Envoy external processor for header manipulation.
//!
//! Envoy opens one ext_proc stream per HTTP transaction. For request and
//! response header events the processor reads a JSON directive from the
//! `instructions` header and answers with the matching header mutation;
//! every other event is passed through unchanged.

pub mod config;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod processor;
pub mod server;

pub use config::ServerConfig;
pub use lifecycle::Shutdown;
pub use processor::{Instructions, ProcessingService, StreamProcessor};
pub use server::GrpcServer;
