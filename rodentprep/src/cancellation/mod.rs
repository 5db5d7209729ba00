//! Cooperative cancellation of a run.
//!
//! Cancelling a run stops admission of new steps; running steps drain.

mod token;

pub use token::CancellationToken;
