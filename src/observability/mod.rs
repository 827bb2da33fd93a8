//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Processor, health, server:
//!     → logging.rs (structured log events, one span per stream)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (text or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
