//! Runtime orchestration and lifecycle management.
//!
//! - [`OrderSystem`] - connects the broker, wires the producers and starts the order consumer
//! - [`setup_tracing`] - initializes the tracing/logging infrastructure
//! - [`cancel_on_signal`] - turns Ctrl-C into a graceful shutdown

pub mod order_system;
pub mod signal;
pub mod tracing;

pub use order_system::*;
pub use signal::*;
pub use tracing::*;
