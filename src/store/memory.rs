//! In-process store, for tests and throwaway deployments.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Store, StoreError};
use crate::models::{Challenge, Instance, InstanceId};

#[derive(Debug, Default)]
struct Tables {
    instances: BTreeMap<InstanceId, Instance>,
    challenges: BTreeMap<String, Challenge>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.tables()
            .instances
            .insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        Ok(self.tables().instances.values().cloned().collect())
    }

    async fn count_instances(&self) -> Result<i64, StoreError> {
        Ok(self.tables().instances.len() as i64)
    }

    async fn active_instance_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .tables()
            .instances
            .values()
            .find(|instance| instance.user_id == user_id)
            .cloned())
    }

    async fn set_backend_resource_id(
        &self,
        instance_id: InstanceId,
        resource_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(instance) = self.tables().instances.get_mut(&instance_id) {
            instance.backend_resource_id = resource_id.to_string();
        }
        Ok(())
    }

    async fn set_expiry(&self, instance_id: InstanceId, expiry: i64) -> Result<(), StoreError> {
        if let Some(instance) = self.tables().instances.get_mut(&instance_id) {
            instance.expiry_timestamp = expiry;
        }
        Ok(())
    }

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<(), StoreError> {
        self.tables().instances.remove(&instance_id);
        Ok(())
    }

    async fn upsert_challenge(&self, challenge: &Challenge) -> Result<(), StoreError> {
        self.tables()
            .challenges
            .insert(challenge.challenge_id.clone(), challenge.clone());
        Ok(())
    }

    async fn get_challenge(&self, challenge_id: &str) -> Result<Option<Challenge>, StoreError> {
        Ok(self.tables().challenges.get(challenge_id).cloned())
    }

    async fn find_challenge_by_name(&self, name: &str) -> Result<Option<Challenge>, StoreError> {
        Ok(self
            .tables()
            .challenges
            .values()
            .find(|challenge| challenge.challenge_name == name)
            .cloned())
    }

    async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError> {
        Ok(self.tables().challenges.values().cloned().collect())
    }

    async fn delete_challenge(&self, challenge_id: &str) -> Result<(), StoreError> {
        self.tables().challenges.remove(challenge_id);
        Ok(())
    }
}
