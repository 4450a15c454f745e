//! Foundational system components for Tally's services.
//!
//! Every long-running component in Tally is a [`Service`]: it owns its state, receives messages
//! through an [`Addr`] and handles them inside a single task. Components never share mutable
//! state through locks across service boundaries, they exchange messages instead.
//!
//! The [`Controller`] propagates process shutdown to all services that hold a
//! [`ShutdownHandle`].

#![warn(missing_docs)]

mod controller;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::service::*;
