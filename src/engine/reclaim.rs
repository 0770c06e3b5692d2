//! Reclamation of due instances.

use tracing::{debug, error, info, warn};

use super::{Engine, Phase};
use crate::expiry::{now_nanos, Timestamp};
use crate::models::InstanceId;

enum Due {
    /// Nothing due at or before the sweep time.
    Done,
    /// Entry handled without a teardown; look at the next one.
    Skipped,
    Teardown(InstanceId),
}

impl Engine {
    /// Tear down every instance due at or before `now`, one at a time.
    ///
    /// Each step re-reads the head of the expiry index under the engine lock,
    /// so handlers may insert or re-key entries between steps. Returns the
    /// number of instances torn down.
    pub async fn sweep(&self, now: Timestamp) -> usize {
        let mut reclaimed = 0;
        loop {
            match self.next_due(now) {
                Due::Done => break,
                Due::Skipped => continue,
                Due::Teardown(instance_id) => {
                    if self.teardown(instance_id).await {
                        reclaimed += 1;
                    }
                }
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "sweep complete");
        }
        reclaimed
    }

    fn next_due(&self, now: Timestamp) -> Due {
        let mut registry = self.registry();
        let Some((timestamp, instance_id)) = registry.index.peek_min() else {
            return Due::Done;
        };
        if timestamp > now {
            return Due::Done;
        }

        let Some(live) = registry.instances.get_mut(&instance_id) else {
            error!(instance_id, timestamp, "expiry entry without an instance, dropping it");
            registry.index.remove_by_timestamp(timestamp);
            return Due::Skipped;
        };

        match live.phase {
            Phase::Provisioning { .. } => {
                // Torn down as soon as the backend answers; look again later
                // in case it never does.
                live.phase = Phase::Provisioning {
                    reclaim_pending: true,
                };
                let retry_at = now.saturating_add(self.retry_nanos());
                if let Err(err) = registry.reschedule(instance_id, retry_at) {
                    error!(instance_id, error = %err, "failed to defer reclamation");
                    registry.index.remove_by_timestamp(timestamp);
                }
                debug!(instance_id, "instance due while starting, deferred");
                Due::Skipped
            }
            Phase::Active => {
                live.phase = Phase::Reclaiming;
                registry.index.remove_by_timestamp(timestamp);
                Due::Teardown(instance_id)
            }
            Phase::Reclaiming => {
                warn!(instance_id, "instance already reclaiming still had an expiry entry");
                registry.index.remove_by_timestamp(timestamp);
                Due::Skipped
            }
        }
    }

    /// Delete the backend resource and the store row of a popped instance,
    /// then release what it held. On failure the instance goes back into the
    /// index for another attempt. Returns true once the instance is gone.
    pub(super) async fn teardown(&self, instance_id: InstanceId) -> bool {
        let snapshot = self
            .registry()
            .instances
            .get(&instance_id)
            .map(|live| (live.record.clone(), live.challenge.docker_compose));
        let Some((record, docker_compose)) = snapshot else {
            return false;
        };

        if let Err(err) = self.delete_resource(&record, docker_compose).await {
            self.retry_teardown(instance_id, &err.to_string(), false);
            return false;
        }
        if let Err(err) = self.store.delete_instance(instance_id).await {
            self.retry_teardown(instance_id, &err.to_string(), true);
            return false;
        }

        let forgotten = self.registry().forget(instance_id);
        let Some(live) = forgotten else {
            return false;
        };
        self.release(&live);
        info!(
            instance_id,
            user_id = %live.record.user_id,
            ports = ?live.record.ports_used,
            "instance reclaimed"
        );
        self.finish_challenge_removal(&live.record.challenge_id).await;
        true
    }

    /// Put a failed teardown back into the index. Once the backend resource
    /// is gone the instance stops reporting ready, refuses extension, and the
    /// retry only has the store row left to delete.
    fn retry_teardown(&self, instance_id: InstanceId, error: &str, resource_gone: bool) {
        let retry_at = now_nanos().saturating_add(self.retry_nanos());
        warn!(instance_id, error, resource_gone, retry_at, "teardown failed, will retry");
        let mut registry = self.registry();
        let key = registry.index.insert(retry_at, instance_id);
        if let Some(live) = registry.instances.get_mut(&instance_id) {
            live.phase = Phase::Active;
            live.record.expiry_timestamp = key;
            if resource_gone {
                live.record.backend_resource_id.clear();
                live.removal_requested = true;
            }
        }
    }

    /// Sweep at the current time, then retry challenge row deletions that
    /// failed earlier.
    pub async fn reclaim_due(&self) -> usize {
        let reclaimed = self.sweep(now_nanos()).await;
        self.finish_drained_challenges().await;
        reclaimed
    }
}
