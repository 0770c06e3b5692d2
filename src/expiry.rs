//! Expiry-ordered index of live instances.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::models::InstanceId;

/// Unix timestamp in nanoseconds.
pub type Timestamp = i64;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Expiry given to instances whose owner asked for removal.
pub const FORCED_EXPIRY: Timestamp = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("instance {0} has no expiry index entry")]
    NotFound(InstanceId),
}

pub fn now_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Bijective timestamp <-> instance map, ordered by timestamp.
///
/// Keys are unique. An insert whose exact timestamp is already taken is moved
/// forward one nanosecond at a time until it lands on a free key; the key
/// actually used is returned and is the instance's effective expiry.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    by_time: BTreeMap<Timestamp, InstanceId>,
    by_instance: HashMap<InstanceId, Timestamp>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `instance_id` due at `timestamp`. An existing entry for the same
    /// instance is dropped first.
    pub fn insert(&mut self, timestamp: Timestamp, instance_id: InstanceId) -> Timestamp {
        self.remove_instance(instance_id);

        let mut key = timestamp;
        while self.by_time.contains_key(&key) {
            key = key.saturating_add(1);
        }
        self.by_time.insert(key, instance_id);
        self.by_instance.insert(instance_id, key);
        key
    }

    pub fn remove_by_timestamp(&mut self, timestamp: Timestamp) -> Option<InstanceId> {
        let instance_id = self.by_time.remove(&timestamp)?;
        self.by_instance.remove(&instance_id);
        Some(instance_id)
    }

    pub fn remove_instance(&mut self, instance_id: InstanceId) -> Option<Timestamp> {
        let timestamp = self.by_instance.remove(&instance_id)?;
        self.by_time.remove(&timestamp);
        Some(timestamp)
    }

    pub fn lookup_timestamp(&self, instance_id: InstanceId) -> Result<Timestamp, IndexError> {
        self.by_instance
            .get(&instance_id)
            .copied()
            .ok_or(IndexError::NotFound(instance_id))
    }

    pub fn peek_min(&self) -> Option<(Timestamp, InstanceId)> {
        self.by_time
            .first_key_value()
            .map(|(timestamp, instance_id)| (*timestamp, *instance_id))
    }

    /// Move `instance_id` from `old` to `new`: remove, then insert.
    pub fn replace(
        &mut self,
        old: Timestamp,
        instance_id: InstanceId,
        new: Timestamp,
    ) -> Result<Timestamp, IndexError> {
        match self.by_time.get(&old) {
            Some(current) if *current == instance_id => {}
            _ => return Err(IndexError::NotFound(instance_id)),
        }
        self.remove_by_timestamp(old);
        Ok(self.insert(new, instance_id))
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }

    /// Entries in ascending expiry order.
    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, InstanceId)> + '_ {
        self.by_time.iter().map(|(timestamp, id)| (*timestamp, *id))
    }
}
