//! Server subsystem.
//!
//! # Data Flow
//! ```text
//! TCP listener (bound by the caller)
//!     → tls.rs (optional TLS identity)
//!     → grpc.rs (tonic server)
//!         → envoy.service.ext_proc.v3.ExternalProcessor → processor
//!         → grpc.health.v1.Health → health
//! ```

pub mod grpc;
pub mod tls;

pub use grpc::{GrpcServer, ServerError};
