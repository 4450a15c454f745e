use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tally_common::time::UnixTimestamp;
use tally_log::LogError;
use tally_metrics::EntityId;
use tally_statsd::metric;
use tally_system::{AsyncResponse, FromMessage, Interface, NoResponse, Receiver, Sender, Service};

use crate::identity::IdentityKey;
use crate::registry::IdentityCache;
use crate::sink::{IdentityError, IdentitySink};
use crate::statsd::{RegistryCounters, RegistryTimers};

/// Requests creation of the identity for a key that missed the cache.
#[derive(Debug)]
pub struct CreateIdentity {
    /// The key to mint an id for.
    pub key: IdentityKey,
    /// Time of the observation that missed the cache.
    pub timestamp: UnixTimestamp,
}

/// Forwards liveness of an identity to the sink.
#[derive(Debug)]
pub struct Heartbeat {
    /// The id of the live entity.
    pub id: EntityId,
    /// Time at which the entity was last seen.
    pub timestamp: UnixTimestamp,
}

/// Sets a soft mapping field of an identity.
#[derive(Debug)]
pub struct SetProperty {
    /// The id of the entity.
    pub id: EntityId,
    /// The name of the field.
    pub name: String,
    /// The new value of the field.
    pub value: String,
}

/// Resolves once all previously enqueued requests have been processed.
#[derive(Debug)]
pub struct SyncIdentities;

/// Service interface of the [`IdentityService`].
#[derive(Debug)]
pub enum Identity {
    /// See [`CreateIdentity`].
    Create(CreateIdentity),
    /// See [`Heartbeat`].
    Heartbeat(Heartbeat),
    /// See [`SetProperty`].
    SetProperty(SetProperty),
    /// See [`SyncIdentities`].
    Sync(SyncIdentities, Sender<()>),
}

impl Interface for Identity {}

impl FromMessage<CreateIdentity> for Identity {
    type Response = NoResponse;

    fn from_message(message: CreateIdentity, _: ()) -> Self {
        Self::Create(message)
    }
}

impl FromMessage<Heartbeat> for Identity {
    type Response = NoResponse;

    fn from_message(message: Heartbeat, _: ()) -> Self {
        Self::Heartbeat(message)
    }
}

impl FromMessage<SetProperty> for Identity {
    type Response = NoResponse;

    fn from_message(message: SetProperty, _: ()) -> Self {
        Self::SetProperty(message)
    }
}

impl FromMessage<SyncIdentities> for Identity {
    type Response = AsyncResponse<()>;

    fn from_message(message: SyncIdentities, sender: Sender<()>) -> Self {
        Self::Sync(message, sender)
    }
}

/// The single writer of the identity cache.
///
/// Requests are handled one at a time in the order they were enqueued. Every confirmed identity
/// is taken from the sink's authoritative record, never from the requester.
#[derive(Debug)]
pub struct IdentityService<S> {
    sink: Arc<S>,
    cache: Arc<IdentityCache>,
}

impl<S: IdentitySink> IdentityService<S> {
    pub(crate) fn new(sink: Arc<S>, cache: Arc<IdentityCache>) -> Self {
        Self { sink, cache }
    }

    async fn handle_create(&self, message: CreateIdentity) {
        let CreateIdentity { key, timestamp } = message;

        // Concurrent misses enqueue the same key more than once.
        if self.cache.get(&key).is_some() {
            metric!(counter(RegistryCounters::DuplicateSkipped) += 1);
            return;
        }

        let result = timed("create", self.sink.create_if_absent(&key, timestamp)).await;
        match result {
            Ok(record) => {
                tally_log::debug!(key = %key, id = %record.id, "identity confirmed");
                self.cache.insert(record.key, record.id);
                metric!(
                    counter(RegistryCounters::IdentityCached) += 1,
                    scope = key.scope.as_str(),
                );
            }
            Err(error) => {
                // The key stays uncached, the next observation requests it again.
                tally_log::error!(key = %key, "failed to create identity: {}", LogError(&error));
            }
        }
    }

    async fn handle_heartbeat(&self, message: Heartbeat) {
        let Heartbeat { id, timestamp } = message;
        let result = timed("heartbeat", self.sink.heartbeat(&id, timestamp)).await;
        if let Err(error) = result {
            tally_log::warn!(id = %id, "failed to record heartbeat: {}", LogError(&error));
        }
    }

    async fn handle_set_property(&self, message: SetProperty) {
        let SetProperty { id, name, value } = message;
        let result = timed("set_property", self.sink.set_property(&id, &name, &value)).await;
        if let Err(error) = result {
            tally_log::warn!(
                id = %id,
                property = %name,
                "failed to set identity property: {}",
                LogError(&error)
            );
        }
    }

    async fn handle_message(&self, message: Identity) {
        match message {
            Identity::Create(message) => self.handle_create(message).await,
            Identity::Heartbeat(message) => self.handle_heartbeat(message).await,
            Identity::SetProperty(message) => self.handle_set_property(message).await,
            Identity::Sync(SyncIdentities, sender) => sender.send(()),
        }
    }
}

/// Runs a sink operation and records its duration and failures.
async fn timed<T>(
    operation: &'static str,
    future: impl Future<Output = Result<T, IdentityError>>,
) -> Result<T, IdentityError> {
    let started = Instant::now();
    let result = future.await;

    metric!(
        timer(RegistryTimers::SinkDuration) = started.elapsed(),
        operation = operation,
    );
    if result.is_err() {
        metric!(counter(RegistryCounters::SinkFailed) += 1, operation = operation);
    }

    result
}

impl<S: IdentitySink> Service for IdentityService<S> {
    type Interface = Identity;

    async fn run(self, mut rx: Receiver<Self::Interface>) {
        while let Some(message) = rx.recv().await {
            self.handle_message(message).await;
        }
    }
}
