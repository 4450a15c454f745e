use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tally_common::time::UnixTimestamp;
use tally_metrics::EntityId;

use crate::identity::{IdentityKey, IdentityRecord};

/// An error returned by an [`IdentitySink`].
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// No identity with the given id exists.
    #[error("identity {0} does not exist")]
    NotFound(EntityId),
    /// The backing store could not be reached or failed the operation.
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

/// The authoritative store of identity records.
///
/// The store is the only place where ids are minted. [`create_if_absent`](Self::create_if_absent)
/// must be a conditional insert: concurrent calls for the same key return the same record.
pub trait IdentitySink: Send + Sync + 'static {
    /// Returns the record for `key`, creating it if it does not exist yet.
    fn create_if_absent(
        &self,
        key: &IdentityKey,
        timestamp: UnixTimestamp,
    ) -> impl Future<Output = Result<IdentityRecord, IdentityError>> + Send;

    /// Updates the liveness timestamp of an identity.
    fn heartbeat(
        &self,
        id: &EntityId,
        timestamp: UnixTimestamp,
    ) -> impl Future<Output = Result<(), IdentityError>> + Send;

    /// Sets a soft mapping field of an identity.
    fn set_property(
        &self,
        id: &EntityId,
        name: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), IdentityError>> + Send;
}

#[derive(Debug, Default)]
struct MemoryState {
    by_key: HashMap<IdentityKey, EntityId>,
    records: HashMap<EntityId, IdentityRecord>,
}

/// An in-memory [`IdentitySink`] minting sequential numeric ids.
///
/// Ids start at `1` and are never reused.
#[derive(Debug)]
pub struct MemoryIdentitySink {
    state: Mutex<MemoryState>,
    next_id: AtomicU64,
}

impl MemoryIdentitySink {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the number of records in the store.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns `true` if no identity has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the record with the given id.
    pub fn record(&self, id: &EntityId) -> Option<IdentityRecord> {
        self.state.lock().records.get(id).cloned()
    }

    fn create(&self, key: &IdentityKey, timestamp: UnixTimestamp) -> IdentityRecord {
        let mut state = self.state.lock();

        if let Some(id) = state.by_key.get(key) {
            if let Some(record) = state.records.get(id) {
                return record.clone();
            }
        }

        let id = EntityId::from(self.next_id.fetch_add(1, Ordering::Relaxed).to_string());
        let record = IdentityRecord {
            id: id.clone(),
            key: key.clone(),
            registered_at: timestamp,
            last_heartbeat: timestamp,
            properties: Default::default(),
        };

        state.by_key.insert(key.clone(), id.clone());
        state.records.insert(id, record.clone());
        record
    }

    fn update(
        &self,
        id: &EntityId,
        f: impl FnOnce(&mut IdentityRecord),
    ) -> Result<(), IdentityError> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| IdentityError::NotFound(id.clone()))?;
        f(record);
        Ok(())
    }
}

impl Default for MemoryIdentitySink {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySink for MemoryIdentitySink {
    fn create_if_absent(
        &self,
        key: &IdentityKey,
        timestamp: UnixTimestamp,
    ) -> impl Future<Output = Result<IdentityRecord, IdentityError>> + Send {
        std::future::ready(Ok(self.create(key, timestamp)))
    }

    fn heartbeat(
        &self,
        id: &EntityId,
        timestamp: UnixTimestamp,
    ) -> impl Future<Output = Result<(), IdentityError>> + Send {
        let result = self.update(id, |record| {
            record.last_heartbeat = record.last_heartbeat.max(timestamp);
        });
        std::future::ready(result)
    }

    fn set_property(
        &self,
        id: &EntityId,
        name: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), IdentityError>> + Send {
        let result = self.update(id, |record| {
            record.properties.insert(name.to_owned(), value.to_owned());
        });
        std::future::ready(result)
    }
}
