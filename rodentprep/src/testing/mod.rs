//! Test support: mock step actions for the engine's unit tests.
//!
//! This module provides mock step actions that record calls, fail on
//! demand, or report outputs they never wrote.

mod mocks;

pub use mocks::{
    materialize_outputs, ConcurrencyGauge, FailingAction, MissingOutputAction, PanickingAction,
    RecordingAction,
};
