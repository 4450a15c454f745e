use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_common::time::UnixTimestamp;
use tally_metrics::EntityId;

/// The kind of entity an identity is minted for.
///
/// Instances and endpoints belong to a service. Their names are only unique within the owning
/// service, so the service id is part of the scope.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    /// A logical service.
    Service,
    /// A running instance of a service.
    Instance {
        /// The id of the owning service.
        service: EntityId,
    },
    /// An endpoint exposed by a service.
    Endpoint {
        /// The id of the owning service.
        service: EntityId,
    },
}

impl Scope {
    /// Returns the name of this scope for logs and metric tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Instance { .. } => "instance",
            Self::Endpoint { .. } => "endpoint",
        }
    }

    /// Returns the id of the owning service, if this scope has one.
    pub fn service(&self) -> Option<&EntityId> {
        match self {
            Self::Service => None,
            Self::Instance { service } | Self::Endpoint { service } => Some(service),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service() {
            Some(service) => write!(f, "{}@{service}", self.as_str()),
            None => f.write_str(self.as_str()),
        }
    }
}

/// The natural key of an identity: at most one id exists per key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
pub struct IdentityKey {
    /// The human readable name, for example the service name.
    pub name: Arc<str>,
    /// The scope of the name.
    pub scope: Scope,
}

impl IdentityKey {
    /// Creates a new key.
    pub fn new(name: impl Into<Arc<str>>, scope: Scope) -> Self {
        Self {
            name: name.into(),
            scope,
        }
    }

    /// Shorthand for a key in the [`Scope::Service`] scope.
    pub fn service(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, Scope::Service)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// The authoritative record of a minted identity, as stored by the
/// [`IdentitySink`](crate::IdentitySink).
///
/// The id never changes once minted. Only the heartbeat and the properties are updated later.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct IdentityRecord {
    /// The minted id.
    pub id: EntityId,
    /// The key the id was minted for.
    pub key: IdentityKey,
    /// Time at which the identity was created.
    pub registered_at: UnixTimestamp,
    /// Time of the last heartbeat.
    pub last_heartbeat: UnixTimestamp,
    /// Soft mapping fields, for example the language of an instance.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = IdentityKey::new(
            "pod-1",
            Scope::Instance {
                service: EntityId::from("7"),
            },
        );
        assert_eq!(key.to_string(), "instance@7:pod-1");
        assert_eq!(IdentityKey::service("checkout").to_string(), "service:checkout");
    }

    #[test]
    fn test_record_serialization() {
        let record = IdentityRecord {
            id: EntityId::from("3"),
            key: IdentityKey::new(
                "GET /cart",
                Scope::Endpoint {
                    service: EntityId::from("1"),
                },
            ),
            registered_at: UnixTimestamp::from_secs(1709212020),
            last_heartbeat: UnixTimestamp::from_secs(1709212080),
            properties: BTreeMap::new(),
        };

        insta::assert_json_snapshot!(record, @r###"
        {
          "id": "3",
          "key": {
            "name": "GET /cart",
            "scope": {
              "type": "endpoint",
              "service": "1"
            }
          },
          "registered_at": 1709212020,
          "last_heartbeat": 1709212080
        }
        "###);
    }
}
