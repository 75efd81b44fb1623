//! Cooperative cancellation for pipeline runs.
//!
//! A run owns one [`CancellationToken`]; the scheduler races every stage
//! against it and an operator interrupt trips it. Callbacks registered with
//! [`CancellationToken::on_cancel`] observe the trip.

mod token;

pub use token::{CancelCallback, CancellationToken};
