//! Observability utilities.
//!
//! The engine logs through `tracing` macros; binaries install a subscriber
//! with [`init_logging`].

mod logging;

pub use logging::{init_logging, level_for_verbosity, LogFormat};
