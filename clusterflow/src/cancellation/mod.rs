//! Cooperative cancellation for long waits.

mod token;

pub use token::{CancelCallback, CancellationToken};
