//! Common functionality for Tally.

#![warn(missing_docs)]

pub mod retry;
pub mod time;

pub use self::retry::{RetryBackoff, RetryConfig};
pub use self::time::UnixTimestamp;
