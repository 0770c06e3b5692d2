//! Instance lifecycle engine.
//!
//! All mutable lifecycle state (the expiry index, the per-user map, the live
//! instance table and the set of challenges being removed) sits behind one
//! mutex. The port allocator and the balancer keep their own locks and are
//! only ever locked while the engine lock is held or not at all, never the
//! other way round. No lock is held across an `.await`.
//!
//! Instance phases:
//!
//! ```text
//! Provisioning --(backend returned id)--> Active --(due)--> Reclaiming --> gone
//!      |                                    ^                   |
//!      +--(backend failed)--> gone          +--(delete failed)--+
//! ```

mod challenges;
mod lifecycle;
mod reclaim;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError};
use crate::balancer::Balancer;
use crate::expiry::{ExpiryIndex, Timestamp};
use crate::models::{Challenge, Instance, InstanceId};
use crate::ports::PortAllocator;
use crate::store::Store;
use crate::tasks::TaskQueue;

/// Policy knobs for the lifecycle engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_instances: usize,
    /// Lifetime of a fresh instance, and what an extension resets it to.
    pub instance_duration: Duration,
    /// Extensions are refused while more than this much time is left.
    pub extend_threshold: Duration,
    /// Delay before a failed teardown is attempted again.
    pub reclaim_retry: Duration,
}

impl EngineSettings {
    fn duration_nanos(duration: Duration) -> i64 {
        i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Backend call in flight. `reclaim_pending` is set when the instance
    /// came due (or its challenge was removed) before the call returned.
    Provisioning { reclaim_pending: bool },
    Active,
    /// Popped from the expiry index; teardown in flight.
    Reclaiming,
}

/// Where a challenge is in its removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Unlaunchable; its instances are being reclaimed.
    Draining,
    /// A caller has claimed the row deletion and is running it.
    Deleting,
    /// Row deleted. Kept so launches that read the row earlier are refused.
    Removed,
}

#[derive(Debug)]
struct LiveInstance {
    record: Instance,
    challenge: Arc<Challenge>,
    phase: Phase,
    /// The owner asked for removal; the expiry is already forced.
    removal_requested: bool,
}

impl LiveInstance {
    fn is_leaving(&self) -> bool {
        self.removal_requested
            || matches!(
                self.phase,
                Phase::Reclaiming | Phase::Provisioning { reclaim_pending: true }
            )
    }
}

#[derive(Debug, Default)]
struct Registry {
    index: ExpiryIndex,
    instances: HashMap<InstanceId, LiveInstance>,
    by_user: HashMap<String, InstanceId>,
    /// Challenges being removed or already removed.
    removals: HashMap<String, Removal>,
    next_id: InstanceId,
}

impl Registry {
    /// Drop every trace of `instance_id` from the registry.
    fn forget(&mut self, instance_id: InstanceId) -> Option<LiveInstance> {
        let live = self.instances.remove(&instance_id)?;
        self.index.remove_instance(instance_id);
        if self.by_user.get(&live.record.user_id) == Some(&instance_id) {
            self.by_user.remove(&live.record.user_id);
        }
        Some(live)
    }

    fn has_instances_of(&self, challenge_id: &str) -> bool {
        self.instances
            .values()
            .any(|live| live.record.challenge_id == challenge_id)
    }

    /// True exactly once per removal, when the challenge row may be deleted.
    fn claim_challenge_deletion(&mut self, challenge_id: &str) -> bool {
        if self.has_instances_of(challenge_id) {
            return false;
        }
        match self.removals.get_mut(challenge_id) {
            Some(state @ Removal::Draining) => {
                *state = Removal::Deleting;
                true
            }
            _ => false,
        }
    }

    /// Draining challenges with no instances left, whose row deletion is
    /// due or failed earlier.
    fn drained_challenges(&self) -> Vec<String> {
        self.removals
            .iter()
            .filter(|(id, state)| **state == Removal::Draining && !self.has_instances_of(id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Re-key an instance in the expiry index and mirror the effective key
    /// onto its record.
    fn reschedule(
        &mut self,
        instance_id: InstanceId,
        expiry: Timestamp,
    ) -> Result<Timestamp, crate::expiry::IndexError> {
        let old = self.index.lookup_timestamp(instance_id)?;
        let key = self.index.replace(old, instance_id, expiry)?;
        if let Some(live) = self.instances.get_mut(&instance_id) {
            live.record.expiry_timestamp = key;
        }
        Ok(key)
    }
}

pub struct Engine {
    settings: EngineSettings,
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    ports: PortAllocator,
    balancer: Balancer,
    tasks: TaskQueue,
    registry: Mutex<Registry>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        ports: PortAllocator,
        balancer: Balancer,
        tasks: TaskQueue,
    ) -> Self {
        Self {
            settings,
            store,
            backend,
            ports,
            balancer,
            tasks,
            registry: Mutex::new(Registry {
                next_id: 1,
                ..Registry::default()
            }),
        }
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn live_instances(&self) -> usize {
        self.registry().instances.len()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn duration_nanos(&self) -> i64 {
        EngineSettings::duration_nanos(self.settings.instance_duration)
    }

    /// Never zero, so a deferred entry always lands after the sweep time.
    fn retry_nanos(&self) -> i64 {
        EngineSettings::duration_nanos(self.settings.reclaim_retry).max(1)
    }

    /// Give back what admission reserved for a forgotten instance.
    fn release(&self, live: &LiveInstance) {
        self.ports.release(&live.record.ports_used);
        self.balancer.release(&live.record.backend_endpoint);
    }

    async fn delete_resource(
        &self,
        record: &Instance,
        docker_compose: bool,
    ) -> Result<(), BackendError> {
        if !record.is_provisioned() {
            return Ok(());
        }
        if docker_compose {
            self.backend
                .delete_stack(&record.backend_endpoint, &record.backend_resource_id)
                .await
        } else {
            self.backend
                .delete_container(&record.backend_endpoint, &record.backend_resource_id)
                .await
        }
    }

    /// Persist an expiry change in the background.
    async fn persist_expiry(self: &Arc<Self>, instance_id: InstanceId, expiry: Timestamp) {
        let engine = Arc::clone(self);
        let submitted = self
            .tasks
            .submit("persist expiry", async move {
                if let Err(err) = engine.store.set_expiry(instance_id, expiry).await {
                    error!(instance_id, error = %err, "failed to persist expiry");
                } else {
                    debug!(instance_id, expiry, "expiry persisted");
                }
            })
            .await;
        if let Err(err) = submitted {
            warn!(instance_id, error = %err, "expiry not persisted");
        }
    }

    /// Delete a removed challenge's row once its last instance is gone.
    async fn finish_challenge_removal(&self, challenge_id: &str) {
        let claimed = self.registry().claim_challenge_deletion(challenge_id);
        if !claimed {
            return;
        }
        let next = match self.store.delete_challenge(challenge_id).await {
            Ok(()) => {
                info!(challenge_id, "challenge removed");
                Removal::Removed
            }
            Err(err) => {
                error!(challenge_id, error = %err, "failed to delete challenge row, will retry");
                Removal::Draining
            }
        };
        self.registry()
            .removals
            .insert(challenge_id.to_string(), next);
    }

    /// Retry row deletions that failed or were never claimed.
    async fn finish_drained_challenges(&self) {
        let drained = self.registry().drained_challenges();
        for challenge_id in drained {
            self.finish_challenge_removal(&challenge_id).await;
        }
    }

    fn removal_state(&self, challenge_id: &str) -> Option<Removal> {
        self.registry().removals.get(challenge_id).copied()
    }
}
