//! Per-user operations: launch, remove, extend, status.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::{Engine, LiveInstance, Phase, Removal};
use crate::backend::{resource_name, ContainerSpec};
use crate::compose;
use crate::error::{RunnerError, RunnerResult};
use crate::expiry::{now_nanos, Timestamp, FORCED_EXPIRY, NANOS_PER_SECOND};
use crate::models::{
    Challenge, Instance, InstanceId, LaunchedInstance, UserStatus, DEFAULT_PORT_TYPE,
};

const MAX_INSTANCES_REACHED: &str =
    "The max number of instances for the platform has already been reached, try again later";

fn require(value: &str, missing: &'static str) -> RunnerResult<()> {
    if value.trim().is_empty() {
        return Err(RunnerError::invalid(missing));
    }
    Ok(())
}

/// Host part of a backend endpoint URL; the endpoint itself when it does not
/// parse as one.
pub(crate) fn endpoint_host(endpoint: &str) -> String {
    url::Url::parse(endpoint)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| endpoint.to_string())
}

/// Per-port tags, padded with the default for untagged ports.
pub(crate) fn port_types_for(challenge: &Challenge, port_count: usize) -> Vec<String> {
    (0..port_count)
        .map(|i| {
            challenge
                .port_types
                .get(i)
                .cloned()
                .unwrap_or_else(|| DEFAULT_PORT_TYPE.to_string())
        })
        .collect()
}

impl Engine {
    /// Admit a launch for `user_id` and queue its provisioning.
    ///
    /// Admission (duplicate check, capacity check, port and endpoint
    /// reservation, index insert) happens in one critical section. The
    /// returned coordinates are valid before the backend resource exists.
    pub async fn add_instance(
        self: &Arc<Self>,
        user_id: &str,
        challenge_id: &str,
    ) -> RunnerResult<LaunchedInstance> {
        require(user_id, "Missing userid")?;
        require(challenge_id, "Missing challid")?;

        let challenge = self
            .store
            .get_challenge(challenge_id)
            .await?
            .ok_or_else(|| RunnerError::rejected("Invalid challid"))?;
        let challenge = Arc::new(challenge);

        let (record, discriminant) = self.admit(user_id, &challenge)?;
        let launched = LaunchedInstance {
            host: endpoint_host(&record.backend_endpoint),
            ports_used: record.ports_used.clone(),
        };
        info!(
            instance_id = record.instance_id,
            user_id,
            challenge_id,
            endpoint = %record.backend_endpoint,
            ports = ?record.ports_used,
            "instance admitted"
        );

        let instance_id = record.instance_id;
        let engine = Arc::clone(self);
        let submitted = self
            .tasks
            .submit("provision", async move {
                engine.provision(record, challenge, discriminant).await;
            })
            .await;
        if let Err(err) = submitted {
            let forgotten = self.registry().forget(instance_id);
            if let Some(live) = forgotten {
                self.release(&live);
            }
            return Err(err);
        }
        Ok(launched)
    }

    fn admit(
        &self,
        user_id: &str,
        challenge: &Arc<Challenge>,
    ) -> RunnerResult<(Instance, Timestamp)> {
        let mut registry = self.registry();

        match registry.removals.get(&challenge.challenge_id) {
            Some(Removal::Removed) => return Err(RunnerError::rejected("Invalid challid")),
            Some(_) => return Err(RunnerError::rejected("Challenge is being removed")),
            None => {}
        }
        if registry.by_user.contains_key(user_id) {
            return Err(RunnerError::rejected("User is already running an instance"));
        }
        if registry.instances.len() >= self.settings.max_instances {
            return Err(RunnerError::rejected(MAX_INSTANCES_REACHED));
        }

        let ports = self
            .ports
            .allocate(challenge.port_count)
            .ok_or_else(|| RunnerError::rejected("No free ports, try again later"))?;
        let Some(endpoint) = self.balancer.acquire() else {
            self.ports.release(&ports);
            return Err(RunnerError::Internal("no backend endpoint configured".into()));
        };

        let instance_id = registry.next_id;
        registry.next_id += 1;
        let now = now_nanos();
        let expiry = registry
            .index
            .insert(now.saturating_add(self.duration_nanos()), instance_id);

        let record = Instance {
            instance_id,
            user_id: user_id.to_string(),
            challenge_id: challenge.challenge_id.clone(),
            backend_endpoint: endpoint,
            backend_resource_id: String::new(),
            expiry_timestamp: expiry,
            ports_used: ports,
        };
        registry.by_user.insert(user_id.to_string(), instance_id);
        registry.instances.insert(
            instance_id,
            LiveInstance {
                record: record.clone(),
                challenge: Arc::clone(challenge),
                phase: Phase::Provisioning {
                    reclaim_pending: false,
                },
                removal_requested: false,
            },
        );
        Ok((record, now))
    }

    /// Asynchronous half of [`Engine::add_instance`].
    async fn provision(
        self: Arc<Self>,
        record: Instance,
        challenge: Arc<Challenge>,
        discriminant: Timestamp,
    ) {
        let instance_id = record.instance_id;
        match self.launch(&record, &challenge, discriminant).await {
            Ok(resource_id) => self.finish_provisioning(instance_id, resource_id).await,
            Err(err) => {
                error!(instance_id, error = %err, "provisioning failed, rolling back");
                self.abort_provisioning(instance_id).await;
            }
        }
    }

    async fn launch(
        &self,
        record: &Instance,
        challenge: &Challenge,
        discriminant: Timestamp,
    ) -> RunnerResult<String> {
        self.store.insert_instance(record).await?;

        let name = resource_name(&challenge.challenge_name, discriminant);
        let endpoint = &record.backend_endpoint;
        let resource_id = if challenge.docker_compose {
            let file = compose::assign_ports(&challenge.docker_compose_file, &record.ports_used)?;
            self.backend.create_stack(endpoint, &name, &file).await?
        } else {
            let external_port = *record
                .ports_used
                .first()
                .ok_or_else(|| RunnerError::Internal("container launch without a port".into()))?;
            let spec = ContainerSpec {
                name,
                image: challenge.image_name.clone(),
                cmd: challenge.docker_cmds.clone(),
                internal_port: challenge.internal_port,
                external_port,
            };
            self.backend.create_container(endpoint, &spec).await?
        };

        if let Err(err) = self
            .store
            .set_backend_resource_id(record.instance_id, &resource_id)
            .await
        {
            let mut orphan = record.clone();
            orphan.backend_resource_id = resource_id;
            if let Err(delete_err) = self.delete_resource(&orphan, challenge.docker_compose).await {
                error!(
                    instance_id = record.instance_id,
                    resource_id = %orphan.backend_resource_id,
                    error = %delete_err,
                    "failed to delete unrecorded backend resource"
                );
            }
            return Err(err.into());
        }
        Ok(resource_id)
    }

    async fn finish_provisioning(self: &Arc<Self>, instance_id: InstanceId, resource_id: String) {
        let reclaim_now = {
            let mut registry = self.registry();
            let Some(live) = registry.instances.get_mut(&instance_id) else {
                error!(instance_id, "provisioned instance vanished from the registry");
                return;
            };
            live.record.backend_resource_id = resource_id;
            match live.phase {
                Phase::Provisioning {
                    reclaim_pending: true,
                } => {
                    live.phase = Phase::Reclaiming;
                    registry.index.remove_instance(instance_id);
                    true
                }
                _ => {
                    live.phase = Phase::Active;
                    false
                }
            }
        };

        if reclaim_now {
            info!(instance_id, "instance came due while starting, reclaiming");
            self.teardown(instance_id).await;
        } else {
            info!(instance_id, "instance ready");
        }
    }

    async fn abort_provisioning(&self, instance_id: InstanceId) {
        if let Err(err) = self.store.delete_instance(instance_id).await {
            error!(instance_id, error = %err, "failed to delete row of failed instance");
        }
        let forgotten = self.registry().forget(instance_id);
        if let Some(live) = forgotten {
            self.release(&live);
            self.finish_challenge_removal(&live.record.challenge_id).await;
        }
    }

    /// Force the user's instance to expire now. Teardown happens on the
    /// next sweep. Repeated calls are no-ops.
    pub async fn remove_instance(self: &Arc<Self>, user_id: &str) -> RunnerResult<()> {
        require(user_id, "Missing userid")?;

        let (instance_id, expiry) = {
            let mut registry = self.registry();
            let instance_id = *registry
                .by_user
                .get(user_id)
                .ok_or_else(|| RunnerError::rejected("User does not have an instance"))?;
            let live = registry
                .instances
                .get_mut(&instance_id)
                .ok_or_else(|| RunnerError::Internal(format!("instance {instance_id} has no record")))?;

            match live.phase {
                Phase::Provisioning { .. } => {
                    return Err(RunnerError::rejected("The instance is still starting"))
                }
                Phase::Reclaiming => return Ok(()),
                Phase::Active if live.removal_requested => return Ok(()),
                Phase::Active => live.removal_requested = true,
            }
            let expiry = registry.reschedule(instance_id, FORCED_EXPIRY)?;
            (instance_id, expiry)
        };

        info!(instance_id, user_id, "instance removal requested");
        self.persist_expiry(instance_id, expiry).await;
        Ok(())
    }

    /// Reset the user's instance to a full lifetime, once little enough
    /// time is left. The expiry never moves backwards.
    pub async fn extend_time_left(self: &Arc<Self>, user_id: &str) -> RunnerResult<()> {
        require(user_id, "Missing userid")?;

        let (instance_id, expiry) = {
            let mut registry = self.registry();
            let instance_id = *registry
                .by_user
                .get(user_id)
                .ok_or_else(|| RunnerError::rejected("User does not have an instance"))?;
            let leaving = registry
                .instances
                .get(&instance_id)
                .map(LiveInstance::is_leaving)
                .ok_or_else(|| RunnerError::Internal(format!("instance {instance_id} has no record")))?;
            if leaving {
                return Err(RunnerError::rejected("The instance is being removed"));
            }

            let now = now_nanos();
            let current = registry.index.lookup_timestamp(instance_id)?;
            let threshold = self.settings.extend_threshold;
            if current.saturating_sub(now) > super::EngineSettings::duration_nanos(threshold) {
                return Err(RunnerError::rejected(format!(
                    "Instance can only be extended when less than {} seconds are left",
                    threshold.as_secs()
                )));
            }

            let target = current.max(now.saturating_add(self.duration_nanos()));
            (instance_id, registry.reschedule(instance_id, target)?)
        };

        info!(instance_id, user_id, expiry, "instance extended");
        self.persist_expiry(instance_id, expiry).await;
        Ok(())
    }

    pub fn user_status(&self, user_id: &str) -> RunnerResult<UserStatus> {
        require(user_id, "Missing userid")?;

        let registry = self.registry();
        let Some(live) = registry
            .by_user
            .get(user_id)
            .and_then(|instance_id| registry.instances.get(instance_id))
        else {
            return Ok(UserStatus::default());
        };

        let record = &live.record;
        let time_left = (record.expiry_timestamp - now_nanos()).max(0) / NANOS_PER_SECOND;
        Ok(UserStatus {
            running_instance: true,
            instance_ready: live.phase == Phase::Active && record.is_provisioned(),
            challenge_id: record.challenge_id.clone(),
            time_left,
            host: endpoint_host(&record.backend_endpoint),
            ports_used: record.ports_used.clone(),
            port_types: port_types_for(&live.challenge, record.ports_used.len()),
        })
    }

    /// Rebuild in-memory state from the store. Instances persisted without
    /// a backend resource id were interrupted mid-launch and are scheduled
    /// for immediate reclamation. Returns the number of instances loaded.
    pub async fn resync(&self) -> RunnerResult<usize> {
        let challenges = self.store.list_challenges().await?;
        let instances = self.store.list_instances().await?;

        let mut registry = self.registry();
        for mut record in instances {
            let instance_id = record.instance_id;
            registry.next_id = registry.next_id.max(instance_id + 1);

            let challenge = match challenges
                .iter()
                .find(|challenge| challenge.challenge_id == record.challenge_id)
            {
                Some(challenge) => challenge.clone(),
                None => {
                    warn!(instance_id, challenge_id = %record.challenge_id, "instance of unknown challenge");
                    // Stack ids are numeric, container ids are hex digests.
                    Challenge {
                        challenge_id: record.challenge_id.clone(),
                        docker_compose: record.backend_resource_id.parse::<u64>().is_ok(),
                        ..Challenge::default()
                    }
                }
            };

            for port in &record.ports_used {
                if !self.ports.claim(*port) {
                    warn!(instance_id, port, "port claimed twice during resync");
                }
            }
            self.balancer.assign(&record.backend_endpoint);

            let interrupted = !record.is_provisioned();
            let expiry = if interrupted {
                warn!(instance_id, "instance was interrupted while starting, reclaiming");
                FORCED_EXPIRY
            } else {
                record.expiry_timestamp
            };
            record.expiry_timestamp = registry.index.insert(expiry, instance_id);

            if let Some(previous) = registry.by_user.insert(record.user_id.clone(), instance_id) {
                warn!(instance_id, previous, user_id = %record.user_id, "user owns several instances");
            }
            registry.instances.insert(
                instance_id,
                LiveInstance {
                    record,
                    challenge: Arc::new(challenge),
                    phase: Phase::Active,
                    removal_requested: interrupted,
                },
            );
        }

        let loaded = registry.instances.len();
        info!(
            instances = loaded,
            challenges = challenges.len(),
            next_id = registry.next_id,
            "resync complete"
        );
        Ok(loaded)
    }
}
