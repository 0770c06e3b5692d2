use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::backend::fake::{Call, FakeBackend};
use crate::balancer::BalanceStrategy;
use crate::error::RunnerError;
use crate::expiry::{now_nanos, NANOS_PER_SECOND};
use crate::ports::MIN_PORT;
use crate::models::Instance;
use crate::store::{MemoryStore, Store, StoreError};

const RESERVED: [u16; 3] = [3306, 8000, 9443];
const ENDPOINTS: [&str; 2] = ["https://a.example:9443", "https://b.example:9443"];

struct Harness {
    engine: Arc<Engine>,
    backend: Arc<FakeBackend>,
    store: Arc<MemoryStore>,
}

fn settings() -> EngineSettings {
    EngineSettings {
        max_instances: 10,
        instance_duration: Duration::from_secs(3600),
        extend_threshold: Duration::from_secs(600),
        reclaim_retry: Duration::from_secs(30),
    }
}

fn harness_with(
    backend: FakeBackend,
    settings: EngineSettings,
    store: Arc<MemoryStore>,
) -> Harness {
    build(backend, settings, store.clone(), store)
}

/// Run the engine over `scripted`, keeping its tables inspectable.
fn harness_over(scripted: Arc<ScriptedStore>) -> Harness {
    let tables = Arc::clone(&scripted.inner);
    build(FakeBackend::new(), settings(), tables, scripted)
}

fn build(
    backend: FakeBackend,
    settings: EngineSettings,
    tables: Arc<MemoryStore>,
    store: Arc<dyn Store>,
) -> Harness {
    let backend = Arc::new(backend);
    let engine = Arc::new(Engine::new(
        settings,
        store,
        backend.clone(),
        PortAllocator::new(RESERVED),
        Balancer::new(
            BalanceStrategy::Distribute,
            ENDPOINTS.iter().map(|e| e.to_string()).collect(),
        ),
        TaskQueue::start(64, 4),
    ));
    Harness {
        engine,
        backend,
        store: tables,
    }
}

fn harness() -> Harness {
    harness_with(FakeBackend::new(), settings(), Arc::new(MemoryStore::new()))
}

fn web_challenge() -> Challenge {
    Challenge {
        challenge_name: "web".into(),
        image_name: "nginx:latest".into(),
        internal_port: 80,
        port_types: vec!["web".into()],
        ..Challenge::default()
    }
}

const STACK: &str = r#"
services:
  app:
    image: app:latest
    container_name: app
    ports:
      - "8080:80"
  shell:
    image: alpine
    ports:
      - "2222:22"
"#;

impl Harness {
    async fn challenge(&self, challenge: Challenge) -> String {
        self.engine.add_challenge(challenge).await.unwrap().challenge_id
    }

    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.engine.tasks().wait_idle())
            .await
            .expect("task queue did not drain");
    }

    fn expire(&self, user_id: &str, at: Timestamp) {
        let mut registry = self.engine.registry();
        let instance_id = registry.by_user[user_id];
        registry.reschedule(instance_id, at).unwrap();
    }

    fn creates(&self) -> Vec<Call> {
        self.backend
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::CreateContainer { .. } | Call::CreateStack { .. }))
            .collect()
    }
}

/// Store over a `MemoryStore` that fails deletes or serves an old
/// challenge row when told to.
#[derive(Default)]
struct ScriptedStore {
    inner: Arc<MemoryStore>,
    instance_delete_failures: AtomicUsize,
    challenge_delete_failures: AtomicUsize,
    stale_challenge: std::sync::Mutex<Option<Challenge>>,
}

impl ScriptedStore {
    fn fail_instance_deletes(&self, times: usize) {
        self.instance_delete_failures.store(times, Ordering::SeqCst);
    }

    fn fail_challenge_deletes(&self, times: usize) {
        self.challenge_delete_failures.store(times, Ordering::SeqCst);
    }

    fn serve_stale(&self, challenge: Option<Challenge>) {
        *self.stale_challenge.lock().unwrap() = challenge;
    }

    fn injected(remaining: &AtomicUsize) -> Result<(), StoreError> {
        let fail = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            Err(StoreError::Corrupt("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.inner.insert_instance(instance).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        self.inner.list_instances().await
    }

    async fn count_instances(&self) -> Result<i64, StoreError> {
        self.inner.count_instances().await
    }

    async fn active_instance_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<Instance>, StoreError> {
        self.inner.active_instance_for_user(user_id).await
    }

    async fn set_backend_resource_id(
        &self,
        instance_id: InstanceId,
        resource_id: &str,
    ) -> Result<(), StoreError> {
        self.inner.set_backend_resource_id(instance_id, resource_id).await
    }

    async fn set_expiry(&self, instance_id: InstanceId, expiry: i64) -> Result<(), StoreError> {
        self.inner.set_expiry(instance_id, expiry).await
    }

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<(), StoreError> {
        Self::injected(&self.instance_delete_failures)?;
        self.inner.delete_instance(instance_id).await
    }

    async fn upsert_challenge(&self, challenge: &Challenge) -> Result<(), StoreError> {
        self.inner.upsert_challenge(challenge).await
    }

    async fn get_challenge(&self, challenge_id: &str) -> Result<Option<Challenge>, StoreError> {
        let stale = self.stale_challenge.lock().unwrap().clone();
        match stale {
            Some(challenge) if challenge.challenge_id == challenge_id => Ok(Some(challenge)),
            _ => self.inner.get_challenge(challenge_id).await,
        }
    }

    async fn find_challenge_by_name(&self, name: &str) -> Result<Option<Challenge>, StoreError> {
        self.inner.find_challenge_by_name(name).await
    }

    async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError> {
        self.inner.list_challenges().await
    }

    async fn delete_challenge(&self, challenge_id: &str) -> Result<(), StoreError> {
        Self::injected(&self.challenge_delete_failures)?;
        self.inner.delete_challenge(challenge_id).await
    }
}

fn rejection(err: RunnerError) -> String {
    match err {
        RunnerError::Rejected(message) => message,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_add_instance_returns_coordinates_then_provisions() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;

    let launched = h.engine.add_instance("u1", &challenge_id).await.unwrap();
    assert_eq!(launched.ports_used.len(), 1);
    let port = launched.ports_used[0];
    assert!(port >= MIN_PORT);
    assert!(!RESERVED.contains(&port));
    assert!(launched.host == "a.example" || launched.host == "b.example");

    h.settle().await;
    let status = h.engine.user_status("u1").unwrap();
    assert!(status.running_instance);
    assert!(status.instance_ready);
    assert_eq!(status.ports_used, vec![port]);
    assert_eq!(status.port_types, vec!["web"]);
    assert!(status.time_left > 3500);

    match &h.creates()[..] {
        [Call::CreateContainer { spec, .. }] => {
            assert!(spec.name.starts_with("web_"));
            assert_eq!(spec.external_port, port);
            assert_eq!(spec.internal_port, 80);
        }
        calls => panic!("unexpected calls {calls:?}"),
    }

    let stored = h.store.list_instances().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].backend_resource_id.starts_with("container-"));
}

#[test_log::test(tokio::test)]
async fn test_second_launch_for_same_user_is_rejected() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;

    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    let err = h.engine.add_instance("u1", &challenge_id).await.unwrap_err();
    assert_eq!(rejection(err), "User is already running an instance");
    assert_eq!(h.engine.ports.in_use(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_launches_admit_one_per_user() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            let challenge_id = challenge_id.clone();
            tokio::spawn(async move { engine.add_instance("u1", &challenge_id).await })
        })
        .collect();
    let mut admitted = 0;
    for attempt in attempts {
        if attempt.await.unwrap().is_ok() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);

    h.settle().await;
    assert_eq!(h.engine.live_instances(), 1);
    assert_eq!(h.engine.ports.in_use(), 1);
}

#[test_log::test(tokio::test)]
async fn test_capacity_limit() {
    let h = harness_with(
        FakeBackend::new(),
        EngineSettings {
            max_instances: 2,
            ..settings()
        },
        Arc::new(MemoryStore::new()),
    );
    let challenge_id = h.challenge(web_challenge()).await;

    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.engine.add_instance("u2", &challenge_id).await.unwrap();
    let err = h.engine.add_instance("u3", &challenge_id).await.unwrap_err();
    assert!(rejection(err).starts_with("The max number of instances"));
    assert_eq!(h.engine.ports.in_use(), 2);
}

#[test_log::test(tokio::test)]
async fn test_unknown_challenge_and_missing_ids() {
    let h = harness();
    let err = h.engine.add_instance("u1", "nope").await.unwrap_err();
    assert_eq!(rejection(err), "Invalid challid");

    let err = h.engine.add_instance("", "nope").await.unwrap_err();
    assert!(matches!(err, RunnerError::InvalidInput(message) if message == "Missing userid"));
    assert!(matches!(
        h.engine.user_status(" "),
        Err(RunnerError::InvalidInput(_))
    ));
}

#[test_log::test(tokio::test)]
async fn test_due_instance_is_reclaimed_once() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.engine.add_instance("u2", &challenge_id).await.unwrap();
    h.settle().await;

    let now = now_nanos();
    h.expire("u1", now - 1);
    assert_eq!(h.engine.sweep(now).await, 1);
    assert_eq!(h.engine.sweep(now).await, 0);

    assert_eq!(h.backend.deletes(), 1);
    assert!(!h.engine.user_status("u1").unwrap().running_instance);
    assert!(h.engine.user_status("u2").unwrap().running_instance);
    assert_eq!(h.store.count_instances().await.unwrap(), 1);
    assert_eq!(h.engine.ports.in_use(), 1);

    let registry = h.engine.registry();
    assert!(registry.index.peek_min().is_some_and(|(ts, _)| ts > now));
}

#[test_log::test(tokio::test)]
async fn test_remove_instance_marks_for_reclamation() {
    let h = harness_with(FakeBackend::gated(), settings(), Arc::new(MemoryStore::new()));
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();

    let err = h.engine.remove_instance("u1").await.unwrap_err();
    assert_eq!(rejection(err), "The instance is still starting");

    h.backend.open_gate();
    h.settle().await;
    h.engine.remove_instance("u1").await.unwrap();
    h.engine.remove_instance("u1").await.unwrap();
    h.settle().await;

    // Nothing is deleted until the next sweep.
    assert_eq!(h.backend.deletes(), 0);
    let stored = h.store.list_instances().await.unwrap();
    assert!(stored[0].expiry_timestamp <= 1);

    assert_eq!(h.engine.sweep(now_nanos()).await, 1);
    assert_eq!(h.backend.deletes(), 1);
    assert_eq!(h.engine.ports.in_use(), 0);
    assert!(h.engine.balancer().loads().values().all(|load| *load == 0));

    let err = h.engine.remove_instance("u1").await.unwrap_err();
    assert_eq!(rejection(err), "User does not have an instance");
}

#[test_log::test(tokio::test)]
async fn test_extend_only_near_expiry_and_never_backwards() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.settle().await;

    let err = h.engine.extend_time_left("u1").await.unwrap_err();
    assert!(rejection(err).starts_with("Instance can only be extended"));

    let soon = now_nanos() + 60 * NANOS_PER_SECOND;
    h.expire("u1", soon);
    h.engine.extend_time_left("u1").await.unwrap();
    h.settle().await;

    let status = h.engine.user_status("u1").unwrap();
    assert!(status.time_left > 3500);
    let stored = h.store.list_instances().await.unwrap();
    assert!(stored[0].expiry_timestamp > soon);
}

#[test_log::test(tokio::test)]
async fn test_extend_refused_after_removal() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.settle().await;
    h.engine.remove_instance("u1").await.unwrap();

    let err = h.engine.extend_time_left("u1").await.unwrap_err();
    assert_eq!(rejection(err), "The instance is being removed");
}

#[test_log::test(tokio::test)]
async fn test_failed_provisioning_rolls_back() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;
    h.backend.fail_creates(true);

    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.settle().await;

    assert!(!h.engine.user_status("u1").unwrap().running_instance);
    assert_eq!(h.engine.ports.in_use(), 0);
    assert_eq!(h.store.count_instances().await.unwrap(), 0);
    assert!(h.engine.balancer().loads().values().all(|load| *load == 0));
    assert!(h.engine.registry().index.is_empty());

    h.backend.fail_creates(false);
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_failed_teardown_is_retried() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.settle().await;
    h.engine.remove_instance("u1").await.unwrap();

    h.backend.fail_deletes(true);
    let now = now_nanos();
    assert_eq!(h.engine.sweep(now).await, 0);
    assert!(h.engine.user_status("u1").unwrap().running_instance);
    assert_eq!(h.engine.ports.in_use(), 1);
    // Requeued in the future, not immediately due again.
    assert_eq!(h.engine.sweep(now).await, 0);
    assert_eq!(h.backend.deletes(), 1);

    h.backend.fail_deletes(false);
    let later = now_nanos() + 31 * NANOS_PER_SECOND;
    assert_eq!(h.engine.sweep(later).await, 1);
    assert_eq!(h.engine.ports.in_use(), 0);
    assert_eq!(h.store.count_instances().await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn test_instance_due_while_starting_is_reclaimed_after_launch() {
    let h = harness_with(FakeBackend::gated(), settings(), Arc::new(MemoryStore::new()));
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();

    let far = now_nanos() + 7200 * NANOS_PER_SECOND;
    assert_eq!(h.engine.sweep(far).await, 0);
    assert_eq!(h.backend.deletes(), 0);

    h.backend.open_gate();
    h.settle().await;
    assert_eq!(h.backend.deletes(), 1);
    assert!(!h.engine.user_status("u1").unwrap().running_instance);
    assert_eq!(h.engine.ports.in_use(), 0);
}

#[test_log::test(tokio::test)]
async fn test_remove_challenge_reclaims_instances_first() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.engine.add_instance("u2", &challenge_id).await.unwrap();
    h.settle().await;

    h.engine.remove_challenge(&challenge_id).await.unwrap();
    let err = h.engine.add_instance("u3", &challenge_id).await.unwrap_err();
    assert!(matches!(err, RunnerError::Rejected(_)));

    h.settle().await;
    assert_eq!(h.backend.deletes(), 2);
    assert_eq!(h.engine.live_instances(), 0);
    assert!(h.store.get_challenge(&challenge_id).await.unwrap().is_none());
    assert_eq!(
        h.engine.registry().removals.get(&challenge_id),
        Some(&Removal::Removed)
    );

    let err = h.engine.remove_challenge(&challenge_id).await.unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));
}

#[test_log::test(tokio::test)]
async fn test_remove_challenge_waits_for_starting_instances() {
    let h = harness_with(FakeBackend::gated(), settings(), Arc::new(MemoryStore::new()));
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();

    h.engine.remove_challenge(&challenge_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.store.get_challenge(&challenge_id).await.unwrap().is_some());

    h.backend.open_gate();
    h.settle().await;
    assert_eq!(h.backend.deletes(), 1);
    assert!(h.store.get_challenge(&challenge_id).await.unwrap().is_none());
}

#[test_log::test(tokio::test)]
async fn test_compose_challenge_launches_rewritten_stack() {
    let h = harness();
    let challenge_id = h
        .challenge(Challenge {
            challenge_name: "stack".into(),
            docker_compose: true,
            docker_compose_file: STACK.into(),
            ..Challenge::default()
        })
        .await;

    let launched = h.engine.add_instance("u1", &challenge_id).await.unwrap();
    assert_eq!(launched.ports_used.len(), 2);
    h.settle().await;

    match &h.creates()[..] {
        [Call::CreateStack { name, compose, .. }] => {
            assert!(name.starts_with("stack_"));
            assert!(compose.contains(&format!("{}:80", launched.ports_used[0])));
            assert!(compose.contains(&format!("{}:22", launched.ports_used[1])));
            assert!(!compose.contains("container_name"));
        }
        calls => panic!("unexpected calls {calls:?}"),
    }

    h.engine.remove_instance("u1").await.unwrap();
    h.engine.sweep(now_nanos()).await;
    assert!(h
        .backend
        .calls()
        .iter()
        .any(|call| matches!(call, Call::DeleteStack { .. })));
}

#[test_log::test(tokio::test)]
async fn test_resync_rebuilds_state() {
    let store = Arc::new(MemoryStore::new());
    let challenge_id = {
        let h = harness_with(FakeBackend::new(), settings(), Arc::clone(&store));
        h.challenge(web_challenge()).await
    };
    let expiry = now_nanos() + 600 * NANOS_PER_SECOND;
    for (instance_id, user_id, resource_id, port) in
        [(4, "u1", "container-a", 40001), (9, "u2", "", 40002)]
    {
        store
            .insert_instance(&Instance {
                instance_id,
                user_id: user_id.into(),
                challenge_id: challenge_id.clone(),
                backend_endpoint: ENDPOINTS[0].into(),
                backend_resource_id: resource_id.into(),
                expiry_timestamp: expiry,
                ports_used: vec![port],
            })
            .await
            .unwrap();
    }

    let h = harness_with(FakeBackend::new(), settings(), store);
    assert_eq!(h.engine.resync().await.unwrap(), 2);
    assert!(h.engine.ports.is_used(40001));
    assert!(h.engine.ports.is_used(40002));
    assert_eq!(h.engine.balancer().loads()[ENDPOINTS[0]], 2);
    assert!(h.engine.user_status("u1").unwrap().instance_ready);

    // The interrupted launch is reclaimed right away, without a backend call.
    assert_eq!(h.engine.sweep(now_nanos()).await, 1);
    assert_eq!(h.backend.deletes(), 0);
    assert!(!h.engine.user_status("u2").unwrap().running_instance);

    h.engine.add_instance("u3", &challenge_id).await.unwrap();
    assert_eq!(h.engine.registry().by_user["u3"], 10);
}

#[test_log::test(tokio::test)]
async fn test_status_snapshot() {
    let h = harness();
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.settle().await;

    let status = h.engine.status().await.unwrap();
    assert_eq!(status.instance_count, 1);
    assert_eq!(status.challenge_count, 1);
    assert_eq!(status.max_instance_count, 10);
    assert_eq!(status.instances[0].user_id, "u1");
    assert_eq!(status.endpoint_loads.values().sum::<usize>(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_launches_by_many_users_respect_capacity() {
    let h = harness_with(
        FakeBackend::new(),
        EngineSettings {
            max_instances: 5,
            ..settings()
        },
        Arc::new(MemoryStore::new()),
    );
    let challenge_id = h.challenge(web_challenge()).await;

    let attempts: Vec<_> = (0..32)
        .map(|n| {
            let engine = Arc::clone(&h.engine);
            let challenge_id = challenge_id.clone();
            tokio::spawn(async move { engine.add_instance(&format!("user-{n}"), &challenge_id).await })
        })
        .collect();
    let mut admitted = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(err) => assert!(rejection(err).starts_with("The max number of instances")),
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(h.engine.ports.in_use(), 5);

    h.settle().await;
    assert_eq!(h.engine.live_instances(), 5);
    assert_eq!(h.engine.ports.in_use(), 5);
    assert_eq!(h.store.count_instances().await.unwrap(), 5);
    assert_eq!(h.creates().len(), 5);
}

#[test_log::test(tokio::test)]
async fn test_launch_from_stale_challenge_read_is_refused_after_removal() {
    let store = Arc::new(ScriptedStore::default());
    let h = harness_over(Arc::clone(&store));
    let challenge_id = h.challenge(web_challenge()).await;
    let before_removal = h.store.get_challenge(&challenge_id).await.unwrap();

    h.engine.remove_challenge(&challenge_id).await.unwrap();
    h.settle().await;
    assert!(h.store.get_challenge(&challenge_id).await.unwrap().is_none());

    // The launch read the row before it was deleted.
    store.serve_stale(before_removal);
    let err = h.engine.add_instance("u1", &challenge_id).await.unwrap_err();
    assert_eq!(rejection(err), "Invalid challid");
    assert_eq!(h.engine.live_instances(), 0);
    assert_eq!(h.engine.ports.in_use(), 0);
    assert!(h.creates().is_empty());

    store.serve_stale(None);
    assert_eq!(h.challenge(web_challenge()).await, challenge_id);
    assert_eq!(h.engine.removal_state(&challenge_id), None);
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.settle().await;
    assert_eq!(h.creates().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_failed_challenge_delete_is_retried_by_reclaim() {
    let store = Arc::new(ScriptedStore::default());
    let h = harness_over(Arc::clone(&store));
    let challenge_id = h.challenge(web_challenge()).await;
    store.fail_challenge_deletes(1);

    h.engine.remove_challenge(&challenge_id).await.unwrap();
    h.settle().await;
    assert!(h.store.get_challenge(&challenge_id).await.unwrap().is_some());
    assert_eq!(h.engine.removal_state(&challenge_id), Some(Removal::Draining));
    let err = h.engine.add_instance("u1", &challenge_id).await.unwrap_err();
    assert_eq!(rejection(err), "Challenge is being removed");
    let err = h.engine.add_challenge(web_challenge()).await.unwrap_err();
    assert_eq!(rejection(err), "Challenge is being removed");

    assert_eq!(h.engine.reclaim_due().await, 0);
    assert!(h.store.get_challenge(&challenge_id).await.unwrap().is_none());
    assert_eq!(h.engine.removal_state(&challenge_id), Some(Removal::Removed));
    let err = h.engine.add_instance("u1", &challenge_id).await.unwrap_err();
    assert_eq!(rejection(err), "Invalid challid");
}

#[test_log::test(tokio::test)]
async fn test_store_failure_after_backend_delete_stops_serving_instance() {
    let store = Arc::new(ScriptedStore::default());
    let h = harness_over(Arc::clone(&store));
    let challenge_id = h.challenge(web_challenge()).await;
    h.engine.add_instance("u1", &challenge_id).await.unwrap();
    h.settle().await;
    assert!(h.engine.user_status("u1").unwrap().instance_ready);
    h.engine.remove_instance("u1").await.unwrap();
    h.settle().await;

    store.fail_instance_deletes(1);
    let now = now_nanos();
    assert_eq!(h.engine.sweep(now).await, 0);
    assert_eq!(h.backend.deletes(), 1);

    let status = h.engine.user_status("u1").unwrap();
    assert!(status.running_instance);
    assert!(!status.instance_ready);
    let err = h.engine.extend_time_left("u1").await.unwrap_err();
    assert_eq!(rejection(err), "The instance is being removed");
    assert_eq!(h.engine.ports.in_use(), 1);

    let later = now_nanos() + 31 * NANOS_PER_SECOND;
    assert_eq!(h.engine.sweep(later).await, 1);
    assert_eq!(h.backend.deletes(), 1);
    assert!(!h.engine.user_status("u1").unwrap().running_instance);
    assert_eq!(h.engine.ports.in_use(), 0);
    assert_eq!(h.store.count_instances().await.unwrap(), 0);
}
