//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     root token cancelled
//!     → gRPC server stops accepting
//!     → every stream's child token fires, streams exit
//! ```
//!
//! # Design Decisions
//! - One root token, one child per task
//! - Cancellation is normal lifecycle, not an error

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
