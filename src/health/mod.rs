//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Kubelet / Envoy health check
//!     → grpc.health.v1.Health/Check  → SERVING
//!     → grpc.health.v1.Health/Watch  → UNIMPLEMENTED
//! ```
//!
//! # Design Decisions
//! - No degraded state exists to report, so Check never fails
//! - Independent of the ext_proc streams

pub mod service;

pub use service::HealthService;
