//! Admin operations: challenge templates and the status snapshot.

use std::sync::Arc;
use tracing::{error, info};

use super::{Engine, Phase, Removal};
use crate::compose;
use crate::error::{RunnerError, RunnerResult};
use crate::expiry::{now_nanos, FORCED_EXPIRY};
use crate::models::{challenge_id_for, Challenge, InstanceId, StatusSnapshot, DEFAULT_PORT_TYPE};

/// Fill in the derived fields of an incoming challenge and check it can be
/// launched.
fn normalize(mut challenge: Challenge) -> RunnerResult<Challenge> {
    challenge.challenge_name = challenge.challenge_name.trim().to_string();
    if challenge.challenge_name.is_empty() {
        return Err(RunnerError::invalid("Missing Challenge_Name"));
    }
    challenge.challenge_id = challenge_id_for(&challenge.challenge_name);

    if challenge.docker_compose {
        if challenge.docker_compose_file.trim().is_empty() {
            return Err(RunnerError::invalid("Missing Docker_Compose_File"));
        }
        challenge.port_count = compose::port_count(&challenge.docker_compose_file)?;
        if challenge.port_count == 0 {
            return Err(RunnerError::invalid("Docker_Compose_File publishes no ports"));
        }
    } else {
        if challenge.image_name.trim().is_empty() {
            return Err(RunnerError::invalid("Missing Image_Name"));
        }
        if challenge.internal_port == 0 {
            return Err(RunnerError::invalid("Missing Internal_Port"));
        }
        challenge.port_count = 1;
    }

    if challenge.port_types.len() > challenge.port_count {
        return Err(RunnerError::invalid(format!(
            "Port_Types lists {} ports but the challenge publishes {}",
            challenge.port_types.len(),
            challenge.port_count
        )));
    }
    challenge
        .port_types
        .resize(challenge.port_count, DEFAULT_PORT_TYPE.to_string());
    Ok(challenge)
}

impl Engine {
    /// Insert or update a challenge template. Returns the stored template.
    pub async fn add_challenge(&self, challenge: Challenge) -> RunnerResult<Challenge> {
        let challenge = normalize(challenge)?;
        let removal = self.removal_state(&challenge.challenge_id);
        if matches!(removal, Some(Removal::Draining | Removal::Deleting)) {
            return Err(RunnerError::rejected("Challenge is being removed"));
        }

        self.store.upsert_challenge(&challenge).await?;
        if removal == Some(Removal::Removed) {
            // Re-added under the same name after an earlier removal.
            let mut registry = self.registry();
            if registry.removals.get(&challenge.challenge_id) == Some(&Removal::Removed) {
                registry.removals.remove(&challenge.challenge_id);
            }
        }
        info!(
            challenge_id = %challenge.challenge_id,
            name = %challenge.challenge_name,
            docker_compose = challenge.docker_compose,
            port_count = challenge.port_count,
            "challenge saved"
        );
        Ok(challenge)
    }

    /// Make a challenge unlaunchable at once, then tear down its instances and
    /// delete it in the background.
    pub async fn remove_challenge(self: &Arc<Self>, challenge_id: &str) -> RunnerResult<()> {
        if challenge_id.trim().is_empty() {
            return Err(RunnerError::invalid("Missing challid"));
        }
        if self.store.get_challenge(challenge_id).await?.is_none() {
            return Err(RunnerError::NotFound("Invalid challid".into()));
        }

        let forced = {
            let mut registry = self.registry();
            if matches!(
                registry.removals.get(challenge_id),
                Some(Removal::Draining | Removal::Deleting)
            ) {
                return Ok(());
            }
            registry
                .removals
                .insert(challenge_id.to_string(), Removal::Draining);

            let affected: Vec<InstanceId> = registry
                .instances
                .values()
                .filter(|live| live.record.challenge_id == challenge_id)
                .map(|live| live.record.instance_id)
                .collect();

            let mut forced = Vec::new();
            for instance_id in affected {
                let Some(live) = registry.instances.get_mut(&instance_id) else {
                    continue;
                };
                match live.phase {
                    Phase::Provisioning { .. } => {
                        live.phase = Phase::Provisioning {
                            reclaim_pending: true,
                        };
                    }
                    Phase::Active if !live.removal_requested => {
                        live.removal_requested = true;
                        forced.push((instance_id, registry.reschedule(instance_id, FORCED_EXPIRY)?));
                    }
                    Phase::Active | Phase::Reclaiming => {}
                }
            }
            forced
        };
        info!(challenge_id, instances = forced.len(), "challenge marked for removal");

        let engine = Arc::clone(self);
        let challenge_id = challenge_id.to_string();
        self.tasks
            .submit("remove challenge", async move {
                for (instance_id, expiry) in forced {
                    if let Err(err) = engine.store.set_expiry(instance_id, expiry).await {
                        error!(instance_id, error = %err, "failed to persist forced expiry");
                    }
                }
                engine.sweep(now_nanos()).await;
                engine.finish_challenge_removal(&challenge_id).await;
            })
            .await
    }

    pub async fn status(&self) -> RunnerResult<StatusSnapshot> {
        let instance_count = self.store.count_instances().await?;
        let challenges = self.store.list_challenges().await?;

        let mut instances: Vec<_> = self
            .registry()
            .instances
            .values()
            .map(|live| live.record.clone())
            .collect();
        instances.sort_by_key(|instance| instance.instance_id);

        Ok(StatusSnapshot {
            instance_count,
            challenge_count: challenges.len(),
            max_instance_count: self.settings.max_instances,
            pending_tasks: self.tasks.pending(),
            endpoint_loads: self.balancer.loads(),
            instances,
            challenges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_container_challenge() {
        let challenge = normalize(Challenge {
            challenge_name: "  web  ".into(),
            image_name: "nginx:latest".into(),
            internal_port: 80,
            port_count: 9,
            ..Challenge::default()
        })
        .unwrap();
        assert_eq!(challenge.challenge_name, "web");
        assert_eq!(challenge.challenge_id, challenge_id_for("web"));
        assert_eq!(challenge.port_count, 1);
        assert_eq!(challenge.port_types, vec!["nc"]);
    }

    #[test]
    fn test_normalize_counts_compose_ports() {
        let challenge = normalize(Challenge {
            challenge_name: "stack".into(),
            docker_compose: true,
            docker_compose_file: "services:\n  a:\n    image: x\n    ports: [\"80\", \"22\"]\n".into(),
            port_types: vec!["web".into()],
            ..Challenge::default()
        })
        .unwrap();
        assert_eq!(challenge.port_count, 2);
        assert_eq!(challenge.port_types, vec!["web", "nc"]);
    }

    #[test]
    fn test_normalize_rejects_incomplete_challenges() {
        let missing_name = normalize(Challenge::default()).unwrap_err();
        assert!(matches!(missing_name, RunnerError::InvalidInput(_)));

        let missing_image = normalize(Challenge {
            challenge_name: "web".into(),
            internal_port: 80,
            ..Challenge::default()
        })
        .unwrap_err();
        assert!(matches!(missing_image, RunnerError::InvalidInput(_)));

        let too_many_types = normalize(Challenge {
            challenge_name: "web".into(),
            image_name: "nginx".into(),
            internal_port: 80,
            port_types: vec!["web".into(), "nc".into()],
            ..Challenge::default()
        })
        .unwrap_err();
        assert!(matches!(too_many_types, RunnerError::InvalidInput(_)));
    }
}
