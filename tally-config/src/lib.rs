//! Configuration for Tally nodes.
//!
//! The configuration is read from a `config.yml` file in a configuration directory, see
//! [`Config::from_path`]. All sections are optional and fall back to defaults suitable for a
//! standalone node.

#![warn(missing_docs)]

mod config;

pub use self::config::*;
