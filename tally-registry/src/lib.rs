//! Stable identities for services, instances and endpoints.
//!
//! Metrics reference the entity they describe by an [`EntityId`](tally_metrics::EntityId). Ids
//! are minted exactly once per name and [`Scope`] by an [`IdentitySink`] and then cached by the
//! [`IdentityRegistry`]. Producers resolve names through
//! [`IdentityRegistry::get_or_create`], which never waits for the sink: the first observation of
//! a name yields the unknown sentinel while the identity is created in the background by the
//! [`IdentityService`].

#![warn(missing_docs)]

mod identity;
mod registry;
mod service;
mod sink;
mod statsd;

pub use self::identity::*;
pub use self::registry::IdentityRegistry;
pub use self::service::*;
pub use self::sink::*;
