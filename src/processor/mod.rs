//! Envoy external processing subsystem.
//!
//! # Data Flow
//! ```text
//! Envoy ext_proc filter (one bidirectional stream per HTTP transaction)
//!     → service.rs (gRPC binding, spawns one task per stream)
//!     → stream.rs (event loop: recv → dispatch → send)
//!         RequestHeaders / ResponseHeaders:
//!             → instructions.rs (decode `instructions` header JSON)
//!             → mutation.rs (build HeaderMutation)
//!         Body / Trailers / unknown:
//!             → empty ProcessingResponse (pass-through)
//! ```
//!
//! # Design Decisions
//! - Exactly one response per event, in receive order
//! - Malformed directives fail open: the request continues unmodified
//! - No state is shared between streams

pub mod instructions;
pub mod mutation;
pub mod service;
pub mod stream;

pub use instructions::{Instructions, DIRECTIVE_HEADER};
pub use service::ProcessingService;
pub use stream::{EventKind, StreamError, StreamId, StreamProcessor};
