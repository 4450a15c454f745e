use std::fmt;
use std::sync::Arc;

use tally_common::time::UnixTimestamp;
use tally_metrics::EntityId;
use tally_statsd::metric;
use tally_system::{Addr, Request, Service, ServiceRunner, channel};

use crate::identity::{IdentityKey, Scope};
use crate::service::{
    CreateIdentity, Heartbeat, Identity, IdentityService, SetProperty, SyncIdentities,
};
use crate::sink::IdentitySink;
use crate::statsd::RegistryCounters;

/// Confirmed identities, shared between the registry handles and the [`IdentityService`].
///
/// Only the service writes to the cache.
#[derive(Default)]
pub(crate) struct IdentityCache {
    ids: papaya::HashMap<IdentityKey, EntityId, ahash::RandomState>,
}

impl IdentityCache {
    pub fn get(&self, key: &IdentityKey) -> Option<EntityId> {
        self.ids.pin().get(key).cloned()
    }

    /// Caches a confirmed id. An id that is already cached for the key is never replaced.
    pub fn insert(&self, key: IdentityKey, id: EntityId) {
        if let Err(occupied) = self.ids.pin().try_insert(key, id) {
            if *occupied.current != occupied.not_inserted {
                tally_log::error!(
                    cached = %occupied.current,
                    confirmed = %occupied.not_inserted,
                    "identity sink returned a different id for a cached key"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

impl fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCache")
            .field("identities", &self.len())
            .finish()
    }
}

/// Resolves names of services, instances and endpoints to stable [`EntityId`]s.
///
/// Lookups are served from an in-memory cache. A lookup that misses the cache enqueues a creation
/// request with the [`IdentityService`] and returns [`EntityId::unknown`] for this call. Once the
/// identity sink confirmed the identity, subsequent lookups return the minted id.
///
/// Callers must not persist anything keyed by the unknown sentinel. They retry on their next
/// observation instead.
///
/// The registry is cheap to clone, all clones share the same cache.
#[derive(Clone, Debug)]
pub struct IdentityRegistry {
    cache: Arc<IdentityCache>,
    service: Addr<Identity>,
}

impl IdentityRegistry {
    /// Starts the [`IdentityService`] writing to `sink` and returns a registry handle for it.
    pub fn start<S: IdentitySink>(sink: Arc<S>, runner: &mut ServiceRunner) -> Self {
        let (service, rx) = channel(IdentityService::<S>::name());
        let cache = Arc::new(IdentityCache::default());

        runner.start_with(IdentityService::new(sink, cache.clone()), rx);

        Self { cache, service }
    }

    /// Returns the id for `name` in `scope`, or [`EntityId::unknown`] if it is not known yet.
    ///
    /// On a miss, the identity is created asynchronously.
    pub fn get_or_create(&self, name: impl Into<Arc<str>>, scope: Scope) -> EntityId {
        let key = IdentityKey::new(name, scope);
        if let Some(id) = self.cache.get(&key) {
            return id;
        }

        metric!(
            counter(RegistryCounters::CacheMiss) += 1,
            scope = key.scope.as_str(),
        );
        self.service.send(CreateIdentity {
            key,
            timestamp: UnixTimestamp::now(),
        });

        EntityId::unknown()
    }

    /// Returns the cached id for `name` in `scope` without requesting its creation.
    pub fn get(&self, name: impl Into<Arc<str>>, scope: Scope) -> Option<EntityId> {
        self.cache.get(&IdentityKey::new(name, scope))
    }

    /// Records that the entity with the given id was seen at `timestamp`.
    ///
    /// Heartbeats for the unknown sentinel are ignored.
    pub fn heartbeat(&self, id: &EntityId, timestamp: UnixTimestamp) {
        if id.is_unknown() {
            return;
        }

        self.service.send(Heartbeat {
            id: id.clone(),
            timestamp,
        });
    }

    /// Sets a soft mapping field of the entity with the given id.
    pub fn set_property(&self, id: &EntityId, name: impl Into<String>, value: impl Into<String>) {
        if id.is_unknown() {
            return;
        }

        self.service.send(SetProperty {
            id: id.clone(),
            name: name.into(),
            value: value.into(),
        });
    }

    /// Returns a request that resolves once all previously enqueued operations are processed.
    pub fn sync(&self) -> Request<()> {
        self.service.send(SyncIdentities)
    }

    /// Returns the number of cached identities.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no identity is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::identity::IdentityRecord;
    use crate::sink::{IdentityError, MemoryIdentitySink};

    use super::*;

    /// Fails the first `failures` creations, then delegates to a memory sink.
    #[derive(Debug, Default)]
    struct FlakySink {
        failures: usize,
        attempts: AtomicUsize,
        inner: MemoryIdentitySink,
    }

    impl IdentitySink for FlakySink {
        fn create_if_absent(
            &self,
            key: &IdentityKey,
            timestamp: UnixTimestamp,
        ) -> impl Future<Output = Result<IdentityRecord, IdentityError>> + Send {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let created =
                (attempt >= self.failures).then(|| self.inner.create_if_absent(key, timestamp));

            async move {
                match created {
                    Some(created) => created.await,
                    None => Err(IdentityError::Unavailable("connection refused".to_owned())),
                }
            }
        }

        fn heartbeat(
            &self,
            id: &EntityId,
            timestamp: UnixTimestamp,
        ) -> impl Future<Output = Result<(), IdentityError>> + Send {
            self.inner.heartbeat(id, timestamp)
        }

        fn set_property(
            &self,
            id: &EntityId,
            name: &str,
            value: &str,
        ) -> impl Future<Output = Result<(), IdentityError>> + Send {
            self.inner.set_property(id, name, value)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_sight() {
        tally_test::setup();

        let sink = Arc::new(MemoryIdentitySink::new());
        let registry = IdentityRegistry::start(sink.clone(), &mut ServiceRunner::new());

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("svcA", Scope::Service) })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        registry.sync().await.unwrap();

        assert_eq!(sink.len(), 1);
        let id = registry.get_or_create("svcA", Scope::Service);
        assert!(!id.is_unknown());
        for _ in 0..50 {
            assert_eq!(registry.get_or_create("svcA", Scope::Service), id);
        }
    }

    #[tokio::test]
    async fn test_miss_returns_unknown() {
        tally_test::setup();

        let sink = Arc::new(MemoryIdentitySink::new());
        let registry = IdentityRegistry::start(sink, &mut ServiceRunner::new());

        assert!(registry.get_or_create("checkout", Scope::Service).is_unknown());
        assert_eq!(registry.get("checkout", Scope::Service), None);

        registry.sync().await.unwrap();
        assert_eq!(
            registry.get("checkout", Scope::Service),
            Some(EntityId::from("1"))
        );
    }

    #[tokio::test]
    async fn test_sink_failure_leaves_key_uncached() {
        tally_test::setup();

        let sink = Arc::new(FlakySink {
            failures: 1,
            ..Default::default()
        });
        let registry = IdentityRegistry::start(sink.clone(), &mut ServiceRunner::new());

        registry.get_or_create("checkout", Scope::Service);
        registry.sync().await.unwrap();
        assert!(registry.is_empty());

        // The next observation requests the identity again.
        assert!(registry.get_or_create("checkout", Scope::Service).is_unknown());
        registry.sync().await.unwrap();

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            registry.get("checkout", Scope::Service),
            Some(EntityId::from("1"))
        );
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_id() {
        tally_test::setup();

        let sink = Arc::new(MemoryIdentitySink::new());
        let registry = IdentityRegistry::start(sink.clone(), &mut ServiceRunner::new());

        registry.get_or_create("checkout", Scope::Service);
        registry.sync().await.unwrap();
        let id = registry.get("checkout", Scope::Service).unwrap();

        registry.heartbeat(&id, UnixTimestamp::from_secs(u64::from(u32::MAX)));
        registry.heartbeat(&EntityId::unknown(), UnixTimestamp::from_secs(1));
        registry.set_property(&id, "layer", "http");
        registry.sync().await.unwrap();

        let record = sink.record(&id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(
            record.last_heartbeat,
            UnixTimestamp::from_secs(u64::from(u32::MAX))
        );
        assert_eq!(record.properties["layer"], "http");
        assert_eq!(registry.get("checkout", Scope::Service), Some(id));
    }

    #[tokio::test]
    async fn test_scoped_identities() {
        tally_test::setup();

        let sink = Arc::new(MemoryIdentitySink::new());
        let registry = IdentityRegistry::start(sink, &mut ServiceRunner::new());

        registry.get_or_create("checkout", Scope::Service);
        registry.sync().await.unwrap();
        let service = registry.get("checkout", Scope::Service).unwrap();

        let instance = Scope::Instance {
            service: service.clone(),
        };
        let endpoint = Scope::Endpoint { service };
        registry.get_or_create("checkout", instance.clone());
        registry.get_or_create("checkout", endpoint.clone());
        registry.sync().await.unwrap();

        let instance = registry.get("checkout", instance).unwrap();
        let endpoint = registry.get("checkout", endpoint).unwrap();
        assert_ne!(instance, endpoint);
        assert_eq!(registry.len(), 3);
    }
}
